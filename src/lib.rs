//! Midiwire - Framed event ingestion for live MIDI performance hosts
//!
//! Reads length-prefixed protobuf-encoded events from TCP connections,
//! decodes them against a message descriptor and dispatches each one to the
//! handler registered for its event kind.
//!
//! ```no_run
//! use midiwire::dispatch::Dispatcher;
//! use midiwire::network::{Server, ServerConfig};
//! use midiwire::protocol::schema::{self, midi_event_descriptor};
//!
//! # async fn run() -> Result<(), midiwire::network::ServerError> {
//! let descriptor = midi_event_descriptor();
//! let mut dispatcher = Dispatcher::new(&descriptor);
//! dispatcher.register_fn(schema::LOAD_CONFIG, |event| {
//!     let path = event.value.as_message().and_then(|m| m.get_str(1));
//!     println!("load config: {:?}", path);
//!     Ok(())
//! });
//!
//! let mut server = Server::new(ServerConfig::default(), descriptor, dispatcher);
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod network;
pub mod protocol;
