//! cinder-core: the keyspace engine.
//!
//! Owns the mapping from binary keys to typed value objects across a
//! fixed array of logical databases: copy-on-write snapshots over the
//! live tables, the ordered expiry index (whole-key and per-subkey
//! deadlines), MVCC stamping for active-active last-writer-wins merge,
//! lazy freeing, and the type-agnostic command surface (DEL, EXISTS,
//! RENAME, MOVE, SCAN, KEYS, SWAPDB, ...) built on those.
//!
//! The RESP protocol, connection lifecycle, cluster routing and
//! persistence formats are external collaborators; this crate exposes
//! the hooks they attach to (notification and propagation sinks, the
//! storage backend trait, the slot index) and nothing more.

pub mod cluster;
pub mod commands;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod expire;
pub mod extract;
pub mod keyspace;
pub mod lazyfree;
pub mod notify;
pub mod object;
pub mod snapshot;
pub mod time;
pub mod types;

pub use commands::{dispatch, Reply, Session};
pub use config::{Config, MaxmemoryPolicy};
pub use db::{Db, LookupFlags};
pub use engine::{Engine, ServerState, Stats};
pub use error::CommandError;
pub use expire::{ExpireEntry, ExpireIndex};
pub use keyspace::{GlobPattern, Keyspace, StorageBackend};
pub use lazyfree::FreeHandle;
pub use notify::{EventKind, KeyspaceEvent, PropagatedCommand, PropagationTargets, Sinks};
pub use object::{Encoding, Object};
pub use snapshot::Snapshot;
pub use types::Value;
