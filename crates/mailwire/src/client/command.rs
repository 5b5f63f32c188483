//! Command records and tag generation.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::oneshot;

use crate::Result;
use crate::compiler::Request;
use crate::parser::Response;

/// Per-command flags merged into the command record at enqueue time.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandOptions {
    /// Reply with a bare CRLF if the server issues a continuation request
    /// after every chunk of the command has been sent. SASL exchanges expect
    /// this when the server challenges again after a failed response.
    pub empty_line_on_continuation: bool,
}

impl CommandOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the empty-line continuation reply.
    #[must_use]
    pub const fn empty_line_on_continuation(mut self, enabled: bool) -> Self {
        self.empty_line_on_continuation = enabled;
        self
    }
}

/// A command waiting in the client queue.
pub(crate) struct QueuedCommand {
    pub request: Request,
    pub accept_untagged: BTreeSet<String>,
    pub options: CommandOptions,
    pub completion: oneshot::Sender<Result<Response>>,
}

/// The single command currently on the wire.
pub(crate) struct ActiveCommand {
    pub tag: String,
    pub accept_untagged: BTreeSet<String>,
    /// One bucket per accepted untagged name, filled as responses arrive.
    pub payload: BTreeMap<String, Vec<Response>>,
    /// Chunks still owed to the server, released one per continuation.
    pub chunks: VecDeque<Vec<u8>>,
    pub options: CommandOptions,
    pub completion: oneshot::Sender<Result<Response>>,
}

impl ActiveCommand {
    pub(crate) fn new(tag: String, queued: QueuedCommand) -> Self {
        let payload = queued
            .accept_untagged
            .iter()
            .map(|name| (name.clone(), Vec::new()))
            .collect();
        Self {
            tag,
            accept_untagged: queued.accept_untagged,
            payload,
            chunks: VecDeque::new(),
            options: queued.options,
            completion: queued.completion,
        }
    }
}

/// Tag generator for client commands.
///
/// Tags are the letter `W` followed by a strictly increasing decimal number,
/// starting at 1, never reused within a client instance.
#[derive(Debug)]
pub struct TagGenerator {
    counter: AtomicU32,
    prefix: char,
}

impl TagGenerator {
    /// Creates a new tag generator with the given prefix.
    #[must_use]
    pub const fn new(prefix: char) -> Self {
        Self {
            counter: AtomicU32::new(0),
            prefix,
        }
    }

    /// Generates the next tag.
    ///
    /// # Panics
    ///
    /// Panics if the counter would wrap, which takes four billion commands on
    /// one connection.
    #[must_use]
    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        assert!(n != u32::MAX, "tag counter overflow");
        format!("{}{}", self.prefix, n + 1)
    }

    /// Returns how many tags have been handed out.
    #[must_use]
    pub fn issued(&self) -> u32 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new('W')
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
    fn test_tag_sequence() {
        let tags = TagGenerator::default();
        assert_eq!(tags.next(), "W1");
        assert_eq!(tags.next(), "W2");
        assert_eq!(tags.next(), "W3");
        assert_eq!(tags.issued(), 3);
    }

    #[test]
    fn test_custom_prefix() {
        let tags = TagGenerator::new('A');
        assert_eq!(tags.next(), "A1");
    }

    #[test]
    fn test_uniqueness() {
        let tags = TagGenerator::default();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(tags.next()), "duplicate tag generated");
        }
    }

    #[test]
    fn test_payload_buckets_precreated() {
        let (tx, _rx) = oneshot::channel();
        let queued = QueuedCommand {
            request: Request::new("LIST"),
            accept_untagged: ["LIST".to_string(), "LSUB".to_string()].into(),
            options: CommandOptions::default(),
            completion: tx,
        };
        let active = ActiveCommand::new("W1".to_string(), queued);
        assert_eq!(active.payload.len(), 2);
        assert!(active.payload.contains_key("LIST"));
        assert!(active.payload.contains_key("LSUB"));
        assert!(active.payload.values().all(Vec::is_empty));
    }
}
