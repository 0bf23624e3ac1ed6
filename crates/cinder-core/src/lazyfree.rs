//! Background free thread for asynchronous deletion.
//!
//! Releasing a large container inline can stall the command loop, so
//! UNLINK, lazy expiry and FLUSH ASYNC hand their victims to a dedicated
//! OS thread and let the destructors run there. A plain `std::thread` is
//! used rather than an async task because dropping data structures is
//! CPU-bound work that would starve an async executor.
//!
//! An object handed over here may still be aliased by a snapshot; the
//! worker just drops its reference and the payload is freed whenever the
//! last reference goes.

use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;

use crate::expire::ExpireIndex;
use crate::object::Object;
use crate::types::Value;

/// Bounded channel capacity; absorbs bursts without meaningful memory
/// overhead.
const FREE_CHANNEL_CAPACITY: usize = 4096;

/// Containers below this element count are dropped inline — the channel
/// round-trip costs more than the destructor.
const FREE_EFFORT_THRESHOLD: usize = 64;

/// Items sent to the free thread. The fields are never read; the point
/// is that the receiving thread runs their destructors.
#[allow(dead_code)]
enum Freeable {
    Object(Arc<Object>),
    Table(AHashMap<Bytes, Arc<Object>>),
    Expires(ExpireIndex),
}

/// A cloneable handle to the background free thread.
///
/// When every handle is dropped the channel closes and the thread exits.
#[derive(Debug, Clone)]
pub struct FreeHandle {
    tx: SyncSender<Freeable>,
}

impl FreeHandle {
    /// Spawns the free thread and returns a handle.
    ///
    /// If the thread cannot be spawned the handle still works: the
    /// channel reports disconnected and everything is freed inline.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::sync_channel::<Freeable>(FREE_CHANNEL_CAPACITY);

        if let Err(e) = std::thread::Builder::new()
            .name("cinder-free".into())
            .spawn(move || {
                // draining the channel is the whole job
                while rx.recv().is_ok() {}
            })
        {
            tracing::warn!("failed to spawn free thread, values will be freed inline: {e}");
        }

        Self { tx }
    }

    /// Releases an object reference on the free thread when its payload
    /// is heavy enough to bother; drops inline otherwise. Never blocks.
    pub fn free_object(&self, obj: Arc<Object>) {
        if !worth_deferring(obj.value()) {
            return;
        }
        match self.tx.try_send(Freeable::Object(obj)) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) | Err(TrySendError::Disconnected(item)) => drop(item),
        }
    }

    /// Releases a whole keyspace table, from FLUSH ASYNC or a snapshot
    /// teardown. Always deferred; a full table is always worth it.
    pub fn free_table(&self, table: AHashMap<Bytes, Arc<Object>>, expires: ExpireIndex) {
        if table.is_empty() && expires.is_empty() {
            return;
        }
        for item in [Freeable::Table(table), Freeable::Expires(expires)] {
            match self.tx.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(item)) | Err(TrySendError::Disconnected(item)) => drop(item),
            }
        }
    }
}

fn worth_deferring(value: &Value) -> bool {
    match value {
        Value::String(s) => s.len() >= 4096,
        other => other.len() >= FREE_EFFORT_THRESHOLD,
    }
}
