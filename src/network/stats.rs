//! Counters shared between the accept loop and connection tasks

use std::sync::atomic::{AtomicU64, Ordering};

/// Server-wide counters
#[derive(Debug, Default)]
pub struct ServerStats {
    connections_accepted: AtomicU64,
    connections_active: AtomicU64,
    connection_errors: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    events_dispatched: AtomicU64,
    events_dropped: AtomicU64,
    ambiguous_events: AtomicU64,
    handler_failures: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connection_errors: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub events_dispatched: u64,
    /// Frames whose event kind had no registered handler
    pub events_dropped: u64,
    pub ambiguous_events: u64,
    pub handler_failures: u64,
}

impl ServerStats {
    pub(crate) fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self, failed: bool) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
        if failed {
            self.connection_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn frame_received(&self, len: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn event_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn ambiguous_event(&self) {
        self.ambiguous_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            ambiguous_events: self.ambiguous_events.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}
