//! Event dispatch
//!
//! Maps the populated event-kind field of a decoded message to the handler
//! registered for it. The engine that consumes events registers its
//! handlers here before the server starts; the registry is read-only after
//! that and shared by every connection.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{Message, MessageDescriptor, WireValue};

/// Error returned by a handler. Never fatal to the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Non-fatal dispatch outcomes worth reporting
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchWarning {
    #[error("Ambiguous event: fields {populated:?} populated, dispatched field {chosen}")]
    AmbiguousEvent { chosen: u32, populated: Vec<u32> },

    #[error("No handler registered for field {field}, event dropped")]
    UnregisteredHandler { field: u32 },

    #[error("Handler for field {field} failed: {error}")]
    HandlerFailed { field: u32, error: HandlerError },
}

/// Where an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventContext {
    pub connection_id: u64,
    pub peer: SocketAddr,
    /// Frame sequence number on the connection
    pub sequence: u64,
}

/// What a handler gets to see
#[derive(Debug, Clone, Copy)]
pub struct DispatchedEvent<'a> {
    pub context: &'a EventContext,
    /// The event-kind field that selected the handler
    pub field: u32,
    /// Value of that field
    pub value: &'a WireValue,
    /// The whole top-level message, for metadata fields
    pub message: &'a Message,
}

/// Bound to one event-kind field
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: DispatchedEvent<'_>) -> HandlerResult;
}

/// Adapter for synchronous closures
struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: for<'a> Fn(DispatchedEvent<'a>) -> HandlerResult + Send + Sync + 'static,
{
    async fn handle(&self, event: DispatchedEvent<'_>) -> HandlerResult {
        (self.0)(event)
    }
}

/// Result of dispatching one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler for `field` ran (successfully or not, see warnings)
    Dispatched { field: u32 },
    /// No event-kind field was populated
    NoEvent,
    /// The populated field has no handler; the message was discarded
    Dropped { field: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub outcome: DispatchOutcome,
    pub warnings: Vec<DispatchWarning>,
}

impl DispatchReport {
    fn new(outcome: DispatchOutcome) -> Self {
        Self {
            outcome,
            warnings: Vec::new(),
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, DispatchWarning::AmbiguousEvent { .. }))
    }

    pub fn handler_failed(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, DispatchWarning::HandlerFailed { .. }))
    }
}

/// Registry of event handlers keyed by discriminant field number
pub struct Dispatcher {
    /// Event-kind fields, ascending
    discriminants: Vec<u32>,
    handlers: HashMap<u32, Arc<dyn EventHandler>>,
}

impl Dispatcher {
    /// Create a dispatcher for messages of the given descriptor
    pub fn new(descriptor: &MessageDescriptor) -> Self {
        Self::with_discriminants(descriptor.discriminants())
    }

    pub fn with_discriminants(mut discriminants: Vec<u32>) -> Self {
        discriminants.sort_unstable();
        discriminants.dedup();
        Self {
            discriminants,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for an event-kind field, replacing any previous one
    pub fn register(&mut self, field: u32, handler: impl EventHandler) -> &mut Self {
        if !self.discriminants.contains(&field) {
            tracing::warn!("Registering handler for field {} which is not an event kind", field);
        }
        if self.handlers.insert(field, Arc::new(handler)).is_some() {
            tracing::debug!("Replaced handler for field {}", field);
        }
        self
    }

    /// Register a synchronous closure
    pub fn register_fn<F>(&mut self, field: u32, handler: F) -> &mut Self
    where
        F: for<'a> Fn(DispatchedEvent<'a>) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(field, FnHandler(handler))
    }

    pub fn is_registered(&self, field: u32) -> bool {
        self.handlers.contains_key(&field)
    }

    pub fn discriminants(&self) -> &[u32] {
        &self.discriminants
    }

    /// Invoke the handler for the message's event kind.
    ///
    /// With several kinds populated only the lowest-numbered one runs and an
    /// [`DispatchWarning::AmbiguousEvent`] is reported.
    pub async fn dispatch(&self, context: &EventContext, message: &Message) -> DispatchReport {
        let populated: Vec<(u32, &WireValue)> = self
            .discriminants
            .iter()
            .filter_map(|&field| message.get(field).map(|value| (field, value)))
            .collect();

        let Some(&(field, value)) = populated.first() else {
            tracing::debug!(
                connection = context.connection_id,
                sequence = context.sequence,
                "Message carries no event kind"
            );
            return DispatchReport::new(DispatchOutcome::NoEvent);
        };

        let mut warnings = Vec::new();
        if populated.len() > 1 {
            warnings.push(DispatchWarning::AmbiguousEvent {
                chosen: field,
                populated: populated.iter().map(|(field, _)| *field).collect(),
            });
        }

        let Some(handler) = self.handlers.get(&field) else {
            warnings.push(DispatchWarning::UnregisteredHandler { field });
            return DispatchReport {
                outcome: DispatchOutcome::Dropped { field },
                warnings,
            };
        };

        let event = DispatchedEvent {
            context,
            field,
            value,
            message,
        };

        if let Err(error) = handler.handle(event).await {
            warnings.push(DispatchWarning::HandlerFailed { field, error });
        }

        DispatchReport {
            outcome: DispatchOutcome::Dispatched { field },
            warnings,
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut registered: Vec<_> = self.handlers.keys().copied().collect();
        registered.sort_unstable();
        f.debug_struct("Dispatcher")
            .field("discriminants", &self.discriminants)
            .field("registered", &registered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::schema::{self, midi_event_descriptor, EventKind, MidiEvent};
    use std::sync::Mutex;

    fn context() -> EventContext {
        EventContext {
            connection_id: 1,
            peer: "127.0.0.1:40000".parse().unwrap(),
            sequence: 0,
        }
    }

    fn recording_dispatcher() -> (Dispatcher, Arc<Mutex<Vec<(u32, Option<String>)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new(&midi_event_descriptor());

        for field in [schema::LOAD_CONFIG, schema::CC] {
            let calls = calls.clone();
            dispatcher.register_fn(field, move |event| {
                let path = event
                    .value
                    .as_message()
                    .and_then(|m| m.get_str(1))
                    .map(str::to_string);
                calls.lock().unwrap().push((event.field, path));
                Ok(())
            });
        }

        (dispatcher, calls)
    }

    #[tokio::test]
    async fn test_dispatch_load_config() {
        let (dispatcher, calls) = recording_dispatcher();
        let message = MidiEvent::load_config("/tmp/orchestra.yaml").to_message();

        let report = dispatcher.dispatch(&context(), &message).await;

        assert_eq!(report.outcome, DispatchOutcome::Dispatched { field: schema::LOAD_CONFIG });
        assert!(report.warnings.is_empty());
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            &[(schema::LOAD_CONFIG, Some("/tmp/orchestra.yaml".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_ambiguous_event_uses_lowest_field() {
        let (dispatcher, calls) = recording_dispatcher();
        let mut message = MidiEvent::load_config("/a.yaml").to_message();
        message.push(schema::CC, WireValue::Message(Message::new()));

        let report = dispatcher.dispatch(&context(), &message).await;

        assert_eq!(report.outcome, DispatchOutcome::Dispatched { field: schema::LOAD_CONFIG });
        assert_eq!(
            report.warnings,
            vec![DispatchWarning::AmbiguousEvent {
                chosen: schema::LOAD_CONFIG,
                populated: vec![schema::LOAD_CONFIG, schema::CC],
            }]
        );
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_message_is_noop() {
        let (dispatcher, calls) = recording_dispatcher();

        let report = dispatcher.dispatch(&context(), &Message::new()).await;

        assert_eq!(report.outcome, DispatchOutcome::NoEvent);
        assert!(report.warnings.is_empty());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_only_is_noop() {
        let (dispatcher, _) = recording_dispatcher();
        let message = Message::new().with(schema::CHANNEL, WireValue::UInt(4));

        let report = dispatcher.dispatch(&context(), &message).await;
        assert_eq!(report.outcome, DispatchOutcome::NoEvent);
    }

    #[tokio::test]
    async fn test_unregistered_handler_drops() {
        let (dispatcher, _) = recording_dispatcher();
        let message = MidiEvent::new(EventKind::NoteOn {
            note_number: 60,
            velocity: 90,
        })
        .to_message();

        let report = dispatcher.dispatch(&context(), &message).await;

        assert_eq!(report.outcome, DispatchOutcome::Dropped { field: schema::NOTE_ON });
        assert_eq!(
            report.warnings,
            vec![DispatchWarning::UnregisteredHandler { field: schema::NOTE_ON }]
        );
    }

    #[tokio::test]
    async fn test_handler_failure_is_reported() {
        let mut dispatcher = Dispatcher::new(&midi_event_descriptor());
        dispatcher.register_fn(schema::OTHER, |_| Err(HandlerError::new("engine busy")));

        let message = MidiEvent::new(EventKind::Other {
            description: "ping".to_string(),
        })
        .to_message();
        let report = dispatcher.dispatch(&context(), &message).await;

        assert_eq!(report.outcome, DispatchOutcome::Dispatched { field: schema::OTHER });
        assert!(report.handler_failed());
    }

    struct Counting(Arc<std::sync::atomic::AtomicUsize>);

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, event: DispatchedEvent<'_>) -> HandlerResult {
            tokio::task::yield_now().await;
            assert_eq!(event.context.connection_id, 1);
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_async_handler() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new(&midi_event_descriptor());
        dispatcher.register(schema::NOTE_OFF, Counting(count.clone()));

        let message = MidiEvent::new(EventKind::NoteOff {
            note_number: 60,
            velocity: 0,
        })
        .to_message();
        dispatcher.dispatch(&context(), &message).await;
        dispatcher.dispatch(&context(), &message).await;

        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
