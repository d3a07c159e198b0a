//! Protocol module - Defines the wire protocol for Midiwire ingestion
//!
//! Every message on the wire is one frame:
//! - 4 bytes payload length (big-endian, unsigned)
//! - Variable length payload in the tagged varint field encoding
//!
//! Payloads are decoded against a [`MessageDescriptor`] into a generic
//! [`Message`] tree. The built-in `MidiEvent` schema lives in [`schema`].

mod codec;
mod descriptor;
mod json;
mod wire;
pub mod schema;

pub use codec::*;
pub use descriptor::*;
pub use json::*;
pub use wire::*;

/// Default host the server binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port for Midiwire communication
pub const DEFAULT_PORT: u16 = 5252;

/// Default upper bound on a single frame payload (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the length prefix preceding every payload
pub const HEADER_SIZE: usize = 4;
