//! Connection event sinks.
//!
//! The engine reports connection-level events through an [`EventHandler`]:
//! the first server greeting (`on_ready`), the queue running dry (`on_idle`),
//! fatal errors (`on_error`), and the peer certificate after a TLS handshake
//! (`on_cert`). Per-command outcomes are not events; they resolve the
//! command's completion handle.

use std::sync::{Arc, Mutex};

use crate::Error;

/// Handler for connection-level events.
///
/// All methods default to no-ops, so implementors only override what they
/// care about.
pub trait EventHandler: Send + 'static {
    /// Called once, when the first server response arrives.
    fn on_ready(&mut self) {}

    /// Called when the send queue drains and stays empty.
    fn on_idle(&mut self) {}

    /// Called at most once, when a fatal error tears the connection down.
    fn on_error(&mut self, error: &Error) {
        let _ = error;
    }

    /// Called with the server's DER-encoded leaf certificate after a TLS
    /// handshake, implicit or STARTTLS.
    fn on_cert(&mut self, der: &[u8]) {
        let _ = der;
    }
}

/// A no-op handler that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl EventHandler for NoopEvents {}

/// A handler that logs events using tracing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEvents;

impl EventHandler for LoggingEvents {
    fn on_ready(&mut self) {
        tracing::debug!("connection ready");
    }

    fn on_idle(&mut self) {
        tracing::trace!("connection idle");
    }

    fn on_error(&mut self, error: &Error) {
        tracing::error!(%error, "connection error");
    }

    fn on_cert(&mut self, der: &[u8]) {
        tracing::debug!(len = der.len(), "peer certificate");
    }
}

/// A connection-level event captured by [`CollectingEvents`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// First server response observed.
    Ready,
    /// Send queue drained.
    Idle,
    /// Fatal error, rendered to text.
    Error(String),
    /// Peer certificate, DER-encoded.
    Cert(Vec<u8>),
}

/// A handler that records events for later inspection.
///
/// Clones share one event log, so a clone can move into the connection while
/// the original stays with the test or caller.
#[derive(Debug, Default, Clone)]
pub struct CollectingEvents {
    log: Arc<Mutex<Vec<ClientEvent>>>,
}

impl CollectingEvents {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<ClientEvent> {
        self.log
            .lock()
            .map_or_else(|poisoned| poisoned.into_inner().clone(), |log| log.clone())
    }

    fn push(&self, event: ClientEvent) {
        if let Ok(mut log) = self.log.lock() {
            log.push(event);
        }
    }
}

impl EventHandler for CollectingEvents {
    fn on_ready(&mut self) {
        self.push(ClientEvent::Ready);
    }

    fn on_idle(&mut self) {
        self.push(ClientEvent::Idle);
    }

    fn on_error(&mut self, error: &Error) {
        self.push(ClientEvent::Error(error.to_string()));
    }

    fn on_cert(&mut self, der: &[u8]) {
        self.push(ClientEvent::Cert(der.to_vec()));
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_handler() {
        let mut handler = NoopEvents;
        handler.on_ready();
        handler.on_idle();
        handler.on_error(&Error::Protocol("x".to_string()));
        handler.on_cert(b"der");
    }

    #[test]
    fn test_collecting_handler_shares_log() {
        let collector = CollectingEvents::new();
        let mut clone = collector.clone();

        clone.on_ready();
        clone.on_idle();
        clone.on_error(&Error::Protocol("boom".to_string()));

        let events = collector.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ClientEvent::Ready);
        assert_eq!(events[1], ClientEvent::Idle);
        assert_eq!(events[2], ClientEvent::Error("Protocol error: boom".to_string()));
    }
}
