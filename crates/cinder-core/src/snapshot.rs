//! Immutable point-in-time views of a keyspace.
//!
//! A snapshot is produced by [`crate::keyspace::Keyspace::fork`]: the
//! live tables move into the snapshot wholesale (no per-key copying) and
//! the keyspace starts over with empty tables layered on top. Snapshots
//! chain — a snapshot taken while another is outstanding keeps the older
//! one as its ancestor — and every level carries the tombstone set of
//! keys deleted while it was the live layer.
//!
//! A snapshot is immutable for its whole lifetime and safe to read from
//! worker threads. The handle count tracks outstanding readers; the
//! keyspace collapses a snapshot back into itself only once the count
//! reaches zero.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use rand::Rng;

use crate::expire::{ExpireEntry, ExpireIndex};
use crate::object::Object;

/// An immutable prior version of a keyspace.
#[derive(Debug)]
pub struct Snapshot {
    pub(crate) dict: AHashMap<Bytes, Arc<Object>>,
    pub(crate) expires: ExpireIndex,
    /// Keys deleted or shadowed while this level was live, hiding the
    /// ancestor's version.
    pub(crate) tombstones: AHashSet<Bytes>,
    pub(crate) ancestor: Option<Arc<Snapshot>>,
    /// Outstanding reader handles. The matching `end_snapshot` calls
    /// drive this back to zero.
    handles: AtomicU32,
    /// MVCC stamp this view was forked at; a caller whose checkpoint is
    /// not newer shares this snapshot instead of forcing a new fork.
    checkpoint: u64,
}

impl Snapshot {
    pub(crate) fn new(
        dict: AHashMap<Bytes, Arc<Object>>,
        expires: ExpireIndex,
        tombstones: AHashSet<Bytes>,
        ancestor: Option<Arc<Snapshot>>,
        checkpoint: u64,
    ) -> Self {
        Self {
            dict,
            expires,
            tombstones,
            ancestor,
            handles: AtomicU32::new(1),
            checkpoint,
        }
    }

    pub(crate) fn checkpoint(&self) -> u64 {
        self.checkpoint
    }

    pub(crate) fn acquire(&self) {
        self.handles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release(&self) {
        let prev = self.handles.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "snapshot released more times than acquired");
    }

    pub(crate) fn handle_count(&self) -> u32 {
        self.handles.load(Ordering::Acquire)
    }

    /// Looks up a key through this view: own table first, then the
    /// ancestor chain, with tombstones hiding ancestor versions.
    pub fn find(&self, key: &[u8]) -> Option<&Arc<Object>> {
        if let Some(obj) = self.dict.get(key) {
            return Some(obj);
        }
        if self.tombstones.contains(key) {
            return None;
        }
        self.ancestor.as_deref()?.find(key)
    }

    /// Expiry entry for a key as seen through this view.
    pub fn get_expire(&self, key: &[u8]) -> Option<&ExpireEntry> {
        if self.dict.contains_key(key) {
            return self.expires.get(key);
        }
        if self.tombstones.contains(key) {
            return None;
        }
        self.ancestor.as_deref()?.get_expire(key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.find(key).is_some()
    }

    /// Number of keys visible through this view.
    ///
    /// Tombstones only ever name ancestor-visible keys, so the chain
    /// arithmetic is exact.
    pub fn size(&self) -> usize {
        let inherited = match &self.ancestor {
            Some(anc) => anc.size() - self.tombstones.len(),
            None => 0,
        };
        self.dict.len() + inherited
    }

    /// Number of visible keys carrying an expiry.
    pub fn expire_size(&self) -> usize {
        let mut n = 0;
        self.for_each_expire(&mut |_, _| {
            n += 1;
            true
        });
        n
    }

    /// Walks every visible key. The callback returns `false` to stop;
    /// the walk result is `false` if it was stopped early.
    pub fn for_each(&self, f: &mut dyn FnMut(&Bytes, &Arc<Object>) -> bool) -> bool {
        for (key, obj) in &self.dict {
            if !f(key, obj) {
                return false;
            }
        }
        if let Some(anc) = &self.ancestor {
            return anc.for_each(&mut |key, obj| {
                if self.dict.contains_key(key) || self.tombstones.contains(key) {
                    return true;
                }
                f(key, obj)
            });
        }
        true
    }

    /// Walks every visible expiry entry, same shadowing rules as
    /// [`Snapshot::for_each`].
    pub fn for_each_expire(&self, f: &mut dyn FnMut(&Bytes, &ExpireEntry) -> bool) -> bool {
        for (key, entry) in self.expires.iter() {
            if !f(key, entry) {
                return false;
            }
        }
        if let Some(anc) = &self.ancestor {
            return anc.for_each_expire(&mut |key, entry| {
                if self.dict.contains_key(key) || self.tombstones.contains(key) {
                    return true;
                }
                f(key, entry)
            });
        }
        true
    }

    /// Uniform random visible key, or `None` when the view is empty.
    /// One reservoir pass; O(visible keys).
    pub fn random_key(&self, rng: &mut impl Rng) -> Option<Bytes> {
        let mut picked: Option<Bytes> = None;
        let mut seen = 0usize;
        self.for_each(&mut |key, _| {
            seen += 1;
            if rng.random_range(0..seen) == 0 {
                picked = Some(key.clone());
            }
            true
        });
        picked
    }
}
