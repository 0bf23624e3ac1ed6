//! Keyspace event notifications and the propagation sink.
//!
//! Both are fire-and-forget broadcast channels: the engine publishes
//! and never waits, delivery order is per-key, and a send with no
//! subscribers is silently dropped. The propagation sink carries the
//! synthesized `DEL`/`UNLINK` commands that expiry evictions feed to the
//! AOF writer and the replication stream; each message names its
//! targets because active replicas write their own expirations to the
//! AOF but never forward them to peers.

use bytes::Bytes;
use tokio::sync::broadcast;

/// Buffer depth for both sinks; laggy subscribers lose oldest-first.
const SINK_CAPACITY: usize = 1024;

/// Keyspace event kinds emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A read missed (absent or logically expired key).
    KeyMiss,
    /// A key was evicted because its deadline passed.
    Expired,
    /// A key was deleted by DEL/UNLINK.
    Del,
    /// RENAME removed this key.
    RenameFrom,
    /// RENAME created this key.
    RenameTo,
}

impl EventKind {
    /// Event name on the notification wire.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::KeyMiss => "keymiss",
            EventKind::Expired => "expired",
            EventKind::Del => "del",
            EventKind::RenameFrom => "rename_from",
            EventKind::RenameTo => "rename_to",
        }
    }
}

/// One keyspace notification.
#[derive(Debug, Clone)]
pub struct KeyspaceEvent {
    pub db: usize,
    pub kind: EventKind,
    pub key: Bytes,
}

/// Where a propagated command is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropagationTargets {
    pub aof: bool,
    pub replicas: bool,
}

impl PropagationTargets {
    pub const BOTH: Self = Self { aof: true, replicas: true };
    pub const AOF_ONLY: Self = Self { aof: true, replicas: false };
}

/// A command synthesized by the engine for the AOF/replication channel.
#[derive(Debug, Clone)]
pub struct PropagatedCommand {
    pub db: usize,
    pub argv: Vec<Bytes>,
    pub targets: PropagationTargets,
}

/// The engine's outbound channels.
#[derive(Debug)]
pub struct Sinks {
    events: broadcast::Sender<KeyspaceEvent>,
    propagation: broadcast::Sender<PropagatedCommand>,
}

impl Sinks {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(SINK_CAPACITY);
        let (propagation, _) = broadcast::channel(SINK_CAPACITY);
        Self { events, propagation }
    }

    /// Emits a keyspace notification. Never blocks, never fails.
    pub fn notify(&self, db: usize, kind: EventKind, key: &Bytes) {
        let _ = self.events.send(KeyspaceEvent {
            db,
            kind,
            key: key.clone(),
        });
    }

    /// Feeds a synthesized command to the AOF/replication channel.
    pub fn propagate(&self, db: usize, argv: Vec<Bytes>, targets: PropagationTargets) {
        let _ = self.propagation.send(PropagatedCommand { db, argv, targets });
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<KeyspaceEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_propagation(&self) -> broadcast::Receiver<PropagatedCommand> {
        self.propagation.subscribe()
    }
}

impl Default for Sinks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_reach_subscribers() {
        let sinks = Sinks::new();
        let mut rx = sinks.subscribe_events();
        sinks.notify(0, EventKind::Del, &Bytes::from("k"));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind.as_str(), "del");
        assert_eq!(event.key, Bytes::from("k"));
    }

    #[test]
    fn send_without_subscribers_is_dropped() {
        let sinks = Sinks::new();
        sinks.notify(0, EventKind::Expired, &Bytes::from("k"));
        sinks.propagate(0, vec![Bytes::from("DEL"), Bytes::from("k")], PropagationTargets::BOTH);
    }

    #[test]
    fn propagation_carries_targets() {
        let sinks = Sinks::new();
        let mut rx = sinks.subscribe_propagation();
        sinks.propagate(2, vec![Bytes::from("UNLINK"), Bytes::from("k")], PropagationTargets::AOF_ONLY);
        let cmd = rx.try_recv().unwrap();
        assert_eq!(cmd.db, 2);
        assert!(cmd.targets.aof);
        assert!(!cmd.targets.replicas);
    }
}
