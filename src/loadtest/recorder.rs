//! Per-client append-only event logs.
//!
//! Every simulated client owns one [`EventLog`] of [`SentEvent`]s and one of
//! [`ReceivedEvent`]s. The send log is written by the client task, the
//! receive log by the transport's inbound callback, which may run on another
//! worker thread. Neither log is ever shared between clients, so the only
//! synchronisation is a short mutex hold per append. Logs are frozen into a
//! [`ClientRecord`] once the client finishes and are only merged afterwards,
//! by the reconciler.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;

use crate::loadtest::error::ClientError;

/// A publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEvent {
    pub topic: String,
    /// Unique across the whole run.
    pub payload: String,
    pub send_time: Instant,
}

/// An inbound message as seen by one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEvent {
    pub topic: String,
    pub payload: String,
    pub receive_time: Instant,
}

/// Thread-safe append-only log.
///
/// Clones share the same underlying storage.
#[derive(Debug)]
pub struct EventLog<T> {
    events: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for EventLog<T> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
        }
    }
}

impl<T> Default for EventLog<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventLog<T> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Append one event.
    pub fn append(&self, event: T) {
        self.events.lock().push(event);
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Take everything recorded so far, leaving the log empty.
    ///
    /// Late appends after a drain land in the (now empty) log and are not
    /// seen by whoever drained it.
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl<T: Clone> EventLog<T> {
    /// Copy of the events recorded so far, in append order.
    pub fn snapshot(&self) -> Vec<T> {
        self.events.lock().clone()
    }
}

/// How a client's connect phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Broker acknowledged the connection.
    Connected,
    /// No acknowledgment within the connect timeout; the client carried on.
    TimedOut,
    /// Broker refused the connection; the client skipped subscribing.
    Rejected,
    /// No session could be opened at all; the client skipped subscribing.
    Failed,
}

/// Frozen logs of one finished client, handed to the reconciler.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub username: String,
    pub client_id: String,
    pub connect: ConnectOutcome,
    /// Publish attempts in order.
    pub sent: Vec<SentEvent>,
    /// Inbound messages in arrival order.
    pub received: Vec<ReceivedEvent>,
    /// Every non-fatal failure the client ran into.
    pub errors: Vec<ClientError>,
}

impl ClientRecord {
    /// Record for a client that recorded nothing, e.g. an empty test fixture.
    pub fn empty(username: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            client_id: client_id.into(),
            connect: ConnectOutcome::Connected,
            sent: Vec::new(),
            received: Vec::new(),
            errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(payload: &str) -> ReceivedEvent {
        ReceivedEvent {
            topic: "load/topic0".to_string(),
            payload: payload.to_string(),
            receive_time: Instant::now(),
        }
    }

    #[test]
    fn test_append_and_snapshot_preserve_order() {
        let log = EventLog::new();
        log.append(received("a"));
        log.append(received("b"));
        let payloads: Vec<_> = log.snapshot().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec!["a", "b"]);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_clones_share_storage() {
        let log = EventLog::new();
        let writer = log.clone();
        writer.append(received("x"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_drain_empties_log() {
        let log = EventLog::new();
        log.append(received("x"));
        assert_eq!(log.drain().len(), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let log: EventLog<u32> = EventLog::new();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        log.append(t * 1000 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.len(), 8000);
    }
}
