//! The keyspace: the hash table behind one logical database.
//!
//! A `Keyspace` owns the key→object table, the expiry index, the
//! tombstone set that hides ancestor versions while a snapshot is
//! outstanding, and the change-tracking scope used to mirror deltas into
//! an optional secondary storage.
//!
//! Key bytes are `Bytes`, so the keyspace and the expiry index share one
//! allocation per key no matter how many sides reference it. Objects are
//! held as `Arc<Object>`; the strong count is the object's reference
//! count (keyspace slot + snapshot aliases + transient pins).
//!
//! Single-writer: every mutating method takes `&mut self`, which is the
//! in-crate witness that the caller holds the global lock. Snapshot
//! handles are the only state shared with worker threads, and those are
//! immutable.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use rand::Rng;
use tracing::warn;

use crate::expire::{ExpireEntry, ExpireIndex};
use crate::lazyfree::FreeHandle;
use crate::object::Object;
use crate::snapshot::Snapshot;

/// Secondary storage fed by the change-tracking scope: a disk or
/// remote mirror of the keyspace maintained incrementally. The on-disk
/// format belongs to the implementer; the engine only promises to call
/// these in a consistent order.
pub trait StorageBackend: Send {
    /// A key now holds this object (insert or overwrite).
    fn insert(&mut self, key: &[u8], obj: &Object);
    /// A key no longer exists.
    fn erase(&mut self, key: &[u8]);
    /// Everything is gone.
    fn clear(&mut self);
}

/// The key→object store for one logical database.
pub struct Keyspace {
    dict: AHashMap<Bytes, Arc<Object>>,
    expires: ExpireIndex,
    /// Keys deleted or shadowed since the snapshot was forked. Only ever
    /// names keys visible through the snapshot chain, which keeps the
    /// size arithmetic exact.
    tombstones: AHashSet<Bytes>,
    snapshot: Option<Arc<Snapshot>>,
    /// Depth of nested change-tracking scopes.
    track_depth: u32,
    /// Everything changed (a flush happened inside the scope); the next
    /// flush rewrites storage wholesale instead of replaying the delta.
    all_changed: bool,
    /// Keys touched inside the current scope.
    changed: AHashSet<Bytes>,
    storage: Option<Box<dyn StorageBackend>>,
}

impl std::fmt::Debug for Keyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyspace")
            .field("keys", &self.dict.len())
            .field("expires", &self.expires.len())
            .field("tombstones", &self.tombstones.len())
            .field("snapshot", &self.snapshot.is_some())
            .finish()
    }
}

/// Unshares and detaches a slot so its object can be mutated: shared
/// immortals are replaced by a private copy, and an object aliased by a
/// snapshot is cloned so the snapshot keeps the old version.
pub(crate) fn make_owned(slot: &mut Arc<Object>) -> &mut Object {
    if slot.is_shared() {
        *slot = Arc::new(slot.unshared());
    }
    Arc::make_mut(slot)
}

impl Keyspace {
    pub fn new() -> Self {
        Self {
            dict: AHashMap::new(),
            expires: ExpireIndex::new(),
            tombstones: AHashSet::new(),
            snapshot: None,
            track_depth: 0,
            all_changed: false,
            changed: AHashSet::new(),
            storage: None,
        }
    }

    /// Attaches a secondary storage mirror fed by change tracking.
    pub fn set_storage(&mut self, storage: Box<dyn StorageBackend>) {
        self.storage = Some(storage);
    }

    /// Number of keys visible through this keyspace, snapshot chain
    /// included.
    pub fn size(&self) -> usize {
        let inherited = match &self.snapshot {
            Some(snap) => snap.size() - self.tombstones.len(),
            None => 0,
        };
        self.dict.len() + inherited
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of visible keys carrying an expiry.
    pub fn expire_size(&self) -> usize {
        let mut n = self.expires.len();
        if let Some(snap) = &self.snapshot {
            snap.for_each_expire(&mut |key, _| {
                if !self.dict.contains_key(key) && !self.tombstones.contains(key) {
                    n += 1;
                }
                true
            });
        }
        n
    }

    /// The live expiry index (snapshot entries not included).
    pub fn expires(&self) -> &ExpireIndex {
        &self.expires
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        if self.dict.contains_key(key) {
            return true;
        }
        if self.tombstones.contains(key) {
            return false;
        }
        self.snapshot.as_deref().is_some_and(|s| s.contains(key))
    }

    /// Looks up a key for the write path, materializing it from the
    /// snapshot chain into the live table first.
    pub fn find(&mut self, key: &Bytes) -> Option<&Arc<Object>> {
        self.ensure(key);
        self.dict.get(key)
    }

    /// Read-only composite lookup; never materializes, safe on a `&self`
    /// shared with snapshot readers.
    pub fn get_visible(&self, key: &[u8]) -> Option<&Arc<Object>> {
        if let Some(obj) = self.dict.get(key) {
            return Some(obj);
        }
        if self.tombstones.contains(key) {
            return None;
        }
        self.snapshot.as_deref()?.find(key)
    }

    /// Inserts a new key. Returns `false` without touching anything if
    /// the key is already visible.
    ///
    /// The key bytes are cloned into the store (`Bytes` makes that a
    /// refcount bump), so the key's lifetime is tied to the store, not
    /// the argument.
    pub fn insert(&mut self, key: &Bytes, val: Arc<Object>) -> bool {
        debug_assert!(!val.has_expiry(), "inserting an object with a dangling expiry flag");
        if self.contains(key) {
            return false;
        }
        self.dict.insert(key.clone(), val);
        self.track_key(key);
        true
    }

    /// Replaces the object at an existing live slot and returns the old
    /// one. The key must have been materialized (`find`) first.
    pub fn update_value(&mut self, key: &Bytes, val: Arc<Object>) -> Arc<Object> {
        self.track_key(key);
        let slot = self
            .dict
            .get_mut(key)
            .expect("overwriting a key not present in the keyspace");
        std::mem::replace(slot, val)
    }

    /// Mutable access to the object at a live slot, unsharing it first.
    pub fn get_owned(&mut self, key: &Bytes) -> Option<&mut Object> {
        self.ensure(key);
        self.track_key(key);
        self.dict.get_mut(key).map(make_owned)
    }

    /// Removes a key. Returns the removed object, which may still be
    /// aliased by a snapshot.
    pub fn remove(&mut self, key: &Bytes) -> Option<Arc<Object>> {
        if let Some(obj) = self.dict.remove(key) {
            if obj.has_expiry() {
                let entry = self.expires.remove(key);
                assert!(entry.is_some(), "expiry flag set with no index entry");
            }
            self.track_key(key);
            self.shroud(key);
            return Some(obj);
        }
        if self.tombstones.contains(key) {
            return None;
        }
        if let Some(snap) = self.snapshot.clone() {
            if let Some(obj) = snap.find(key) {
                let obj = Arc::clone(obj);
                self.tombstones.insert(key.clone());
                self.track_key(key);
                return Some(obj);
            }
        }
        None
    }

    /// Records a tombstone when the key still has a version in the
    /// snapshot chain that must stay hidden.
    fn shroud(&mut self, key: &Bytes) {
        if let Some(snap) = &self.snapshot {
            if !self.tombstones.contains(key) && snap.contains(key) {
                self.tombstones.insert(key.clone());
            }
        }
    }

    /// Materializes a snapshot-resident key into the live table:
    /// shared immortals are aliased, everything else is deep-copied so
    /// later mutation cannot reach the snapshot's version. The expiry
    /// entry travels with the key.
    pub(crate) fn ensure(&mut self, key: &Bytes) {
        if self.dict.contains_key(key) || self.tombstones.contains(key) {
            return;
        }
        let Some(snap) = self.snapshot.clone() else {
            return;
        };
        let Some(obj) = snap.find(key) else {
            return;
        };
        let materialized = if obj.is_shared() {
            Arc::clone(obj)
        } else {
            Arc::new((**obj).clone())
        };
        debug_assert_eq!(materialized.mvcc(), obj.mvcc());
        self.dict.insert(key.clone(), materialized);
        if let Some(entry) = snap.get_expire(key) {
            self.expires.insert(key.clone(), entry.clone());
        }
        self.tombstones.insert(key.clone());
    }

    // ---- expiry bookkeeping -------------------------------------------
    //
    // The `has_expiry` flag on an object and the key's entry in the
    // expiry index are two sides of one fact; every method below mutates
    // them together.

    /// Sets or updates the deadline for a key (or one of its subkeys).
    /// The key must exist; calling this on a missing key is a programmer
    /// error.
    pub fn set_expire(&mut self, key: &Bytes, subkey: Option<Bytes>, when_ms: i64) {
        self.ensure(key);
        self.track_key(key);
        let had_expiry = {
            let slot = self
                .dict
                .get_mut(key)
                .expect("setting an expiry on a missing key");
            make_owned(slot).has_expiry()
        };
        if had_expiry {
            self.expires
                .get_mut(key)
                .expect("expiry flag set with no index entry")
                .update(subkey, when_ms);
        } else {
            self.expires.insert(key.clone(), ExpireEntry::new(subkey, when_ms));
            let slot = self.dict.get_mut(key).expect("slot vanished during set_expire");
            make_owned(slot).set_has_expiry(true);
        }
    }

    /// Installs a whole carried entry (RENAME/MOVE preserve expiries by
    /// carrying the entry across the delete/add pair).
    pub fn set_expire_entry(&mut self, key: &Bytes, entry: ExpireEntry) {
        self.ensure(key);
        self.track_key(key);
        let had_expiry = {
            let slot = self
                .dict
                .get_mut(key)
                .expect("setting an expiry on a missing key");
            make_owned(slot).has_expiry()
        };
        if had_expiry {
            self.expires.remove(key);
        }
        self.expires.insert(key.clone(), entry);
        let slot = self.dict.get_mut(key).expect("slot vanished during set_expire_entry");
        make_owned(slot).set_has_expiry(true);
    }

    /// Removes a key's expiry. Returns `true` if it had one. The key
    /// must exist.
    pub fn remove_expire(&mut self, key: &Bytes) -> bool {
        self.ensure(key);
        let slot = self
            .dict
            .get_mut(key)
            .expect("removing an expiry from a missing key");
        if !slot.has_expiry() {
            return false;
        }
        make_owned(slot).set_has_expiry(false);
        let entry = self.expires.remove(key);
        assert!(entry.is_some(), "expiry flag set with no index entry");
        self.track_key(key);
        true
    }

    /// Removes one subkey's deadline from a fat entry. Returns `true`
    /// if the subkey had one. Dropping the last pair removes the whole
    /// entry.
    pub fn remove_subkey_expire(&mut self, key: &Bytes, subkey: &[u8]) -> bool {
        self.ensure(key);
        let has_expiry = self
            .dict
            .get(key)
            .expect("removing a subkey expiry from a missing key")
            .has_expiry();
        if !has_expiry {
            return false;
        }
        let (found, now_empty) = {
            let entry = self
                .expires
                .get_mut(key)
                .expect("expiry flag set with no index entry");
            if !entry.is_fat() {
                return false;
            }
            let found = entry.remove_subkey(subkey);
            (found, entry.is_empty())
        };
        if now_empty {
            self.remove_expire(key);
        }
        found
    }

    /// Expiry entry for a key as currently visible (live table first,
    /// then the snapshot chain).
    pub fn get_expire(&self, key: &[u8]) -> Option<&ExpireEntry> {
        if self.dict.contains_key(key) {
            return self.expires.get(key);
        }
        if self.tombstones.contains(key) {
            return None;
        }
        self.snapshot.as_deref()?.get_expire(key)
    }

    // ---- iteration ----------------------------------------------------

    /// Walks every visible key, materializing snapshot-resident ones
    /// into the live table first so the walked entries stay stable
    /// against later mutation. Callback returns `false` to stop early.
    pub fn for_each(&mut self, mut f: impl FnMut(&Bytes, &Arc<Object>) -> bool) -> bool {
        for (key, obj) in &self.dict {
            if !f(key, obj) {
                return false;
            }
        }
        let Some(snap) = self.snapshot.clone() else {
            return true;
        };
        let mut pending = Vec::new();
        snap.for_each(&mut |key, _| {
            if !self.dict.contains_key(key) && !self.tombstones.contains(key) {
                pending.push(key.clone());
            }
            true
        });
        for key in pending {
            self.ensure(&key);
            if let Some(obj) = self.dict.get(&key) {
                if !f(&key, obj) {
                    return false;
                }
            }
        }
        true
    }

    /// Read-only walk over the composite view; never materializes.
    pub fn for_each_visible(&self, f: &mut dyn FnMut(&Bytes, &Arc<Object>) -> bool) -> bool {
        for (key, obj) in &self.dict {
            if !f(key, obj) {
                return false;
            }
        }
        if let Some(snap) = &self.snapshot {
            return snap.for_each(&mut |key, obj| {
                if self.dict.contains_key(key) || self.tombstones.contains(key) {
                    return true;
                }
                f(key, obj)
            });
        }
        true
    }

    /// Uniform random visible key. When the draw lands in the snapshot
    /// chain the key is materialized first, so the returned key names a
    /// live slot that is stable against further mutation.
    pub fn random_key(&mut self) -> Option<Bytes> {
        if self.size() == 0 {
            return None;
        }
        let mut rng = rand::rng();
        if let Some(snap) = self.snapshot.clone() {
            let inherited = snap.size() - self.tombstones.len();
            if inherited > 0 {
                let pct = inherited as f64 / (self.dict.len() + inherited) as f64;
                if rng.random::<f64>() <= pct {
                    let mut picked: Option<Bytes> = None;
                    let mut seen = 0usize;
                    snap.for_each(&mut |key, _| {
                        if self.dict.contains_key(key) || self.tombstones.contains(key) {
                            return true;
                        }
                        seen += 1;
                        if rng.random_range(0..seen) == 0 {
                            picked = Some(key.clone());
                        }
                        true
                    });
                    if let Some(key) = picked {
                        self.ensure(&key);
                        return Some(key);
                    }
                }
            }
        }
        if self.dict.is_empty() {
            return None;
        }
        let idx = rng.random_range(0..self.dict.len());
        self.dict.keys().nth(idx).cloned()
    }

    /// Cursor scan over the live table.
    ///
    /// The cursor is the smallest unvisited position in per-process key
    /// hash order; because a key's hash never changes, growth and rehash
    /// cannot move a key across the cursor boundary, so every key present
    /// from the first call to the last is returned at least once.
    /// `count` is a hint: ties on the boundary hash are always included.
    pub fn scan(&self, cursor: u64, count: usize) -> (u64, Vec<Bytes>) {
        let count = count.max(1);
        let mut candidates: Vec<(u64, &Bytes)> = self
            .dict
            .keys()
            .map(|k| (scan_position(k), k))
            .filter(|(h, _)| *h >= cursor)
            .collect();
        if candidates.is_empty() {
            return (0, Vec::new());
        }
        candidates.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        if candidates.len() <= count {
            return (0, candidates.into_iter().map(|(_, k)| k.clone()).collect());
        }
        let boundary = candidates[count - 1].0;
        let mut keys = Vec::with_capacity(count + 1);
        for (i, (h, k)) in candidates.iter().enumerate() {
            if i < count || *h == boundary {
                keys.push((*k).clone());
            } else {
                break;
            }
        }
        (boundary.checked_add(1).unwrap_or(0), keys)
    }

    /// All visible keys matching a glob pattern. O(keyspace).
    pub fn keys(&self, pattern: &[u8]) -> Vec<Bytes> {
        let len = self.size();
        if len > 10_000 {
            warn!(key_count = len, "KEYS on large keyspace, consider SCAN instead");
        }
        let compiled = GlobPattern::new(pattern);
        let mut out = Vec::new();
        self.for_each_visible(&mut |key, _| {
            if compiled.matches(key) {
                out.push(key.clone());
            }
            true
        });
        out
    }

    // ---- snapshots ----------------------------------------------------

    /// Forks a copy-on-write snapshot at the caller's MVCC checkpoint.
    ///
    /// If the outstanding snapshot is already at least as new as the
    /// checkpoint it gains a handle and is returned; otherwise the live
    /// tables move into a fresh snapshot (chaining the old one as its
    /// ancestor) and the keyspace restarts with empty tables.
    pub fn fork(&mut self, checkpoint: u64) -> Arc<Snapshot> {
        if let Some(snap) = &self.snapshot {
            if checkpoint <= snap.checkpoint() {
                snap.acquire();
                return Arc::clone(snap);
            }
            warn!("nested snapshot created");
        }
        let dict = std::mem::take(&mut self.dict);
        let expires = std::mem::take(&mut self.expires);
        let tombstones = std::mem::take(&mut self.tombstones);
        let ancestor = self.snapshot.take();
        let snap = Arc::new(Snapshot::new(dict, expires, tombstones, ancestor, checkpoint));
        self.snapshot = Some(Arc::clone(&snap));
        snap
    }

    /// Releases one snapshot handle. When a snapshot's handle count
    /// reaches zero and it is the direct child of the live keyspace it
    /// collapses back in; freshly exposed zero-handle ancestors cascade.
    pub fn end_snapshot(&mut self, handle: Arc<Snapshot>) {
        let mut in_chain = false;
        let mut cur = self.snapshot.as_ref();
        while let Some(s) = cur {
            if Arc::ptr_eq(s, &handle) {
                in_chain = true;
                break;
            }
            cur = s.ancestor.as_ref();
        }
        handle.release();
        drop(handle);
        if !in_chain {
            // the keyspace was cleared since the fork; nothing to merge
            return;
        }
        while self.snapshot.as_deref().is_some_and(|s| s.handle_count() == 0) {
            self.collapse_top();
        }
    }

    /// Merges the live overlay back into the direct snapshot and makes
    /// the merged tables live again.
    fn collapse_top(&mut self) {
        let top = self.snapshot.take().expect("collapse with no snapshot");
        assert_eq!(top.handle_count(), 0, "collapsing a snapshot with outstanding handles");
        let mut snap = match Arc::try_unwrap(top) {
            Ok(snap) => snap,
            Err(_) => panic!("snapshot still referenced at collapse"),
        };

        let mut merged_tombstones = std::mem::take(&mut snap.tombstones);

        // Stage 1: apply the deletions recorded against this snapshot.
        // A tombstone whose key lives deeper in the chain stays a
        // tombstone, now recorded against the next ancestor.
        for key in self.tombstones.drain() {
            if let Some(obj) = snap.dict.remove(&key) {
                if obj.has_expiry() {
                    let entry = snap.expires.remove(&key);
                    assert!(entry.is_some(), "expiry flag set with no index entry");
                }
                continue;
            }
            if snap.ancestor.as_deref().is_some_and(|a| a.contains(&key)) {
                merged_tombstones.insert(key);
            }
        }

        // Stage 2: move the live keys in; the live version and its
        // expiry state always win over the snapshot's.
        for (key, obj) in self.dict.drain() {
            if let Some(old) = snap.dict.get(&key) {
                if old.has_expiry() {
                    snap.expires.remove(&key);
                }
            }
            if let Some(entry) = self.expires.remove(&key) {
                snap.expires.insert(key.clone(), entry);
            }
            snap.dict.insert(key, obj);
        }
        assert!(self.expires.is_empty(), "expiry entry with no live key at collapse");

        // Stages 3 and 4: the merged tables become the live tables and
        // the grandparent (if any) becomes the direct snapshot.
        self.dict = snap.dict;
        self.expires = snap.expires;
        self.tombstones = merged_tombstones;
        self.snapshot = snap.ancestor.take();
    }

    // ---- flush --------------------------------------------------------

    /// Removes every visible key. With `lazy` and a free handle the old
    /// tables are handed to the free thread; either way the expiry index
    /// is freshly allocated. Outstanding snapshot handles keep their
    /// (now detached) view alive until released.
    pub fn clear(&mut self, lazy: bool, free: Option<&FreeHandle>) -> usize {
        let removed = self.size();
        let dict = std::mem::take(&mut self.dict);
        let expires = std::mem::take(&mut self.expires);
        self.tombstones.clear();
        self.snapshot = None;
        if self.track_depth > 0 {
            self.all_changed = true;
        }
        self.changed.clear();
        if let Some(storage) = &mut self.storage {
            storage.clear();
        }
        match (lazy, free) {
            (true, Some(handle)) => handle.free_table(dict, expires),
            _ => drop((dict, expires)),
        }
        removed
    }

    // ---- change tracking ----------------------------------------------

    /// Enters a change-tracking scope. Scopes nest.
    pub fn track_changes(&mut self) {
        self.track_depth += 1;
    }

    /// Leaves a change-tracking scope. When the outermost scope closes,
    /// the accumulated delta (or the whole keyspace, after a flush) is
    /// pushed to the secondary storage.
    pub fn process_changes(&mut self) {
        assert!(self.track_depth > 0, "change-tracking scope underflow");
        self.track_depth -= 1;
        if self.track_depth > 0 {
            return;
        }
        if let Some(mut storage) = self.storage.take() {
            if self.all_changed {
                storage.clear();
                for (key, obj) in &self.dict {
                    storage.insert(key, obj);
                }
                self.all_changed = false;
            } else {
                for key in &self.changed {
                    match self.get_visible(key) {
                        Some(obj) => storage.insert(key, obj),
                        None => storage.erase(key),
                    }
                }
            }
            self.storage = Some(storage);
        }
        self.changed.clear();
    }

    fn track_key(&mut self, key: &Bytes) {
        if self.track_depth > 0 && !self.all_changed {
            self.changed.insert(key.clone());
        }
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-process stable scan position for a key. SipHash via the default
/// hasher: deterministic within one process, which is all the cursor
/// contract needs.
fn scan_position(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Glob-style pattern matching over raw bytes.
///
/// Supports `*`, `?`, `[abc]`, `[a-z]`, `[^abc]`/`[!abc]` and `\`
/// escapes. Iterative two-pointer matching with backtracking on the most
/// recent `*`: O(n·m) worst case.
pub struct GlobPattern {
    pat: Vec<u8>,
}

impl GlobPattern {
    pub fn new(pattern: &[u8]) -> Self {
        Self { pat: pattern.to_vec() }
    }

    /// `*` matches everything; KEYS and SCAN skip per-key matching
    /// entirely in that case.
    pub fn matches_all(&self) -> bool {
        self.pat == b"*"
    }

    pub fn matches(&self, text: &[u8]) -> bool {
        glob_match(&self.pat, text)
    }
}

fn glob_match(pat: &[u8], txt: &[u8]) -> bool {
    let mut pi = 0;
    let mut ti = 0;
    // backtracking state for the most recent '*'
    let mut star_pi: Option<usize> = None;
    let mut star_ti = 0;

    while ti < txt.len() {
        if pi < pat.len() {
            match pat[pi] {
                b'*' => {
                    star_pi = Some(pi);
                    star_ti = ti;
                    pi += 1;
                    continue;
                }
                b'?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                b'[' => {
                    if class_match(pat, &mut pi, txt[ti]) {
                        ti += 1;
                        continue;
                    }
                }
                b'\\' if pi + 1 < pat.len() => {
                    if pat[pi + 1] == txt[ti] {
                        pi += 2;
                        ti += 1;
                        continue;
                    }
                }
                c => {
                    if c == txt[ti] {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
            }
        }
        // mismatch: retry from the last '*', consuming one more byte
        match star_pi {
            Some(sp) => {
                star_ti += 1;
                ti = star_ti;
                pi = sp + 1;
            }
            None => return false,
        }
    }

    while pi < pat.len() && pat[pi] == b'*' {
        pi += 1;
    }
    pi == pat.len()
}

/// Matches one byte against the character class starting at `pat[*pi]`
/// (which is `[`). On a match, advances `*pi` past the closing `]` and
/// returns `true`; otherwise leaves `*pi` unchanged.
fn class_match(pat: &[u8], pi: &mut usize, tc: u8) -> bool {
    let mut j = *pi + 1;
    let mut negated = false;
    let mut matched = false;

    if j < pat.len() && (pat[j] == b'^' || pat[j] == b'!') {
        negated = true;
        j += 1;
    }

    while j < pat.len() && pat[j] != b']' {
        if pat[j] == b'\\' && j + 1 < pat.len() {
            j += 1;
            if pat[j] == tc {
                matched = true;
            }
        } else if j + 2 < pat.len() && pat[j + 1] == b'-' && pat[j + 2] != b']' {
            let (lo, hi) = if pat[j] <= pat[j + 2] {
                (pat[j], pat[j + 2])
            } else {
                (pat[j + 2], pat[j])
            };
            if (lo..=hi).contains(&tc) {
                matched = true;
            }
            j += 2;
        } else if pat[j] == tc {
            matched = true;
        }
        j += 1;
    }

    if negated {
        matched = !matched;
    }
    if matched && j < pat.len() {
        *pi = j + 1;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn obj(s: &str) -> Arc<Object> {
        Arc::new(Object::new(Value::String(Bytes::copy_from_slice(s.as_bytes()))))
    }

    fn str_of(o: &Arc<Object>) -> Bytes {
        match o.value() {
            Value::String(s) => s.clone(),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn insert_find_remove() {
        let mut ks = Keyspace::new();
        assert!(ks.insert(&b("k"), obj("v")));
        assert!(!ks.insert(&b("k"), obj("w")));
        assert_eq!(str_of(ks.find(&b("k")).unwrap()), b("v"));
        assert!(ks.remove(&b("k")).is_some());
        assert!(ks.remove(&b("k")).is_none());
        assert_eq!(ks.size(), 0);
    }

    #[test]
    fn expiry_flag_and_index_move_together() {
        let mut ks = Keyspace::new();
        ks.insert(&b("k"), obj("v"));
        ks.set_expire(&b("k"), None, 5_000);
        assert!(ks.find(&b("k")).unwrap().has_expiry());
        assert!(ks.expires().contains(b"k"));
        assert_eq!(ks.expire_size(), 1);

        assert!(ks.remove_expire(&b("k")));
        assert!(!ks.find(&b("k")).unwrap().has_expiry());
        assert!(!ks.expires().contains(b"k"));
        assert!(!ks.remove_expire(&b("k")));
    }

    #[test]
    fn removing_a_volatile_key_drops_its_index_entry() {
        let mut ks = Keyspace::new();
        ks.insert(&b("k"), obj("v"));
        ks.set_expire(&b("k"), None, 5_000);
        ks.remove(&b("k"));
        assert_eq!(ks.expire_size(), 0);
        assert!(ks.size() >= ks.expire_size());
    }

    #[test]
    fn set_expire_on_shared_object_duplicates_it() {
        let mut ks = Keyspace::new();
        let pooled = crate::object::shared_integer(3);
        ks.insert(&b("n"), Arc::clone(&pooled));
        ks.set_expire(&b("n"), None, 5_000);
        let resident = ks.find(&b("n")).unwrap();
        assert!(!resident.is_shared());
        assert!(resident.has_expiry());
        // the pool copy is untouched
        assert!(!pooled.has_expiry());
    }

    #[test]
    fn subkey_expiry_promotes_and_demotes() {
        let mut ks = Keyspace::new();
        ks.insert(&b("h"), obj("v"));
        ks.set_expire(&b("h"), Some(b("f1")), 5_000);
        ks.set_expire(&b("h"), None, 9_000);
        assert!(ks.get_expire(b"h").unwrap().is_fat());

        assert!(ks.remove_subkey_expire(&b("h"), b"f1"));
        assert!(!ks.remove_subkey_expire(&b("h"), b"f1"));
        // the whole-key deadline survives as a non-fat concern
        assert_eq!(ks.get_expire(b"h").unwrap().whole_when(), Some(9_000));
    }

    #[test]
    fn snapshot_preserves_the_forked_view() {
        let mut ks = Keyspace::new();
        ks.insert(&b("a"), obj("1"));
        ks.insert(&b("b"), obj("2"));

        let snap = ks.fork(1);
        ks.remove(&b("a"));
        ks.insert(&b("c"), obj("3"));

        // the snapshot still sees the old world
        assert!(snap.contains(b"a"));
        assert!(!snap.contains(b"c"));
        assert_eq!(snap.size(), 2);

        // the live view sees the new world
        assert!(!ks.contains(b"a"));
        assert!(ks.contains(b"b"));
        assert!(ks.contains(b"c"));
        assert_eq!(ks.size(), 2);

        ks.end_snapshot(snap);
        assert_eq!(ks.size(), 2);
        assert!(!ks.contains(b"a"));
        assert!(ks.contains(b"c"));
    }

    #[test]
    fn collapse_restores_plain_keyspace_state() {
        let mut ks = Keyspace::new();
        ks.insert(&b("keep"), obj("old"));
        ks.insert(&b("gone"), obj("x"));
        ks.insert(&b("volatile"), obj("v"));
        ks.set_expire(&b("volatile"), None, 9_000);

        let snap = ks.fork(1);
        ks.remove(&b("gone"));
        ks.insert(&b("new"), obj("n"));
        ks.set_expire(&b("new"), None, 7_000);
        ks.remove_expire(&b("volatile"));
        ks.end_snapshot(snap);

        assert_eq!(ks.size(), 3);
        assert!(!ks.contains(b"gone"));
        assert_eq!(ks.get_expire(b"new").unwrap().whole_when(), Some(7_000));
        // the expiry removed during the window stays removed
        assert!(ks.get_expire(b"volatile").is_none());
        assert!(!ks.find(&b("volatile")).unwrap().has_expiry());
        assert_eq!(ks.expire_size(), 1);
    }

    #[test]
    fn overwrite_during_snapshot_keeps_both_versions() {
        let mut ks = Keyspace::new();
        ks.insert(&b("k"), obj("old"));
        let snap = ks.fork(1);

        // write path: materialize, then replace
        assert!(ks.find(&b("k")).is_some());
        let old = ks.update_value(&b("k"), obj("new"));
        assert_eq!(str_of(&old), b("old"));

        assert_eq!(str_of(snap.find(b"k").unwrap()), b("old"));
        assert_eq!(str_of(ks.get_visible(b"k").unwrap()), b("new"));

        ks.end_snapshot(snap);
        assert_eq!(str_of(ks.get_visible(b"k").unwrap()), b("new"));
        assert_eq!(ks.size(), 1);
    }

    #[test]
    fn materialization_deep_copies_unshared_objects() {
        let mut ks = Keyspace::new();
        ks.insert(&b("k"), obj("v"));
        let snap = ks.fork(1);

        let live = ks.find(&b("k")).unwrap();
        let frozen = snap.find(b"k").unwrap();
        assert!(!Arc::ptr_eq(live, frozen));
        assert_eq!(live.mvcc(), frozen.mvcc());

        ks.end_snapshot(snap);
    }

    #[test]
    fn materialization_aliases_shared_objects() {
        let mut ks = Keyspace::new();
        ks.insert(&b("n"), crate::object::shared_integer(7));
        let snap = ks.fork(1);

        let live = ks.find(&b("n")).unwrap();
        let frozen = snap.find(b"n").unwrap();
        assert!(Arc::ptr_eq(live, frozen));

        ks.end_snapshot(snap);
    }

    #[test]
    fn mvcc_checkpoint_reuses_the_existing_snapshot() {
        let mut ks = Keyspace::new();
        ks.insert(&b("k"), obj("v"));
        let first = ks.fork(10);
        let second = ks.fork(5);
        assert!(Arc::ptr_eq(&first, &second));

        ks.remove(&b("k"));
        ks.end_snapshot(first);
        // one handle still outstanding; the old view lives on
        assert_eq!(second.size(), 1);
        ks.end_snapshot(second);
        assert_eq!(ks.size(), 0);
    }

    #[test]
    fn nested_snapshots_collapse_in_order() {
        let mut ks = Keyspace::new();
        ks.insert(&b("a"), obj("1"));
        let s1 = ks.fork(10);
        ks.insert(&b("b"), obj("2"));
        let s2 = ks.fork(20);
        ks.insert(&b("c"), obj("3"));

        assert_eq!(s1.size(), 1);
        assert_eq!(s2.size(), 2);
        assert_eq!(ks.size(), 3);

        // release the deeper snapshot first: collapse is deferred until
        // it surfaces
        ks.end_snapshot(s1);
        assert_eq!(ks.size(), 3);
        ks.end_snapshot(s2);
        assert_eq!(ks.size(), 3);
        for key in ["a", "b", "c"] {
            assert!(ks.contains(key.as_bytes()));
        }
    }

    #[test]
    fn delete_of_deep_ancestor_key_survives_collapse() {
        let mut ks = Keyspace::new();
        ks.insert(&b("deep"), obj("1"));
        let s1 = ks.fork(10);
        ks.insert(&b("b"), obj("2"));
        let s2 = ks.fork(20); // nested: live → s2 → s1
        ks.remove(&b("deep"));
        assert!(!ks.contains(b"deep"));

        // s2 collapses into the live layer; "deep" lives below it, so
        // the deletion must stay recorded against s1
        ks.end_snapshot(s2);
        assert!(!ks.contains(b"deep"));
        assert!(ks.contains(b"b"));
        ks.end_snapshot(s1);
        assert!(!ks.contains(b"deep"));
        assert_eq!(ks.size(), 1);
    }

    #[test]
    fn clear_detaches_outstanding_snapshots() {
        let mut ks = Keyspace::new();
        ks.insert(&b("k"), obj("v"));
        let snap = ks.fork(1);
        assert_eq!(ks.clear(false, None), 1);
        assert_eq!(ks.size(), 0);
        // the reader's view is unaffected
        assert_eq!(snap.size(), 1);
        ks.end_snapshot(snap);
        assert_eq!(ks.size(), 0);
    }

    #[test]
    fn random_key_reaches_snapshot_residents() {
        let mut ks = Keyspace::new();
        ks.insert(&b("only"), obj("v"));
        let snap = ks.fork(1);
        // the live table is empty; the draw must come from the snapshot
        let key = ks.random_key().unwrap();
        assert_eq!(key, b("only"));
        // and the key was materialized into the live table
        assert!(ks.dict.contains_key(b"only".as_slice()));
        ks.end_snapshot(snap);
    }

    #[test]
    fn scan_visits_every_key_exactly_once() {
        let mut ks = Keyspace::new();
        for i in 0..100 {
            ks.insert(&b(&format!("key:{i}")), obj("v"));
        }
        let mut seen = AHashSet::new();
        let mut cursor = 0;
        loop {
            let (next, keys) = ks.scan(cursor, 10);
            for k in keys {
                seen.insert(k);
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn scan_never_misses_a_stable_key_across_inserts() {
        let mut ks = Keyspace::new();
        for i in 0..50 {
            ks.insert(&b(&format!("stable:{i}")), obj("v"));
        }
        let mut seen = AHashSet::new();
        let (mut cursor, keys) = ks.scan(0, 7);
        seen.extend(keys);
        // grow the table mid-scan
        for i in 0..200 {
            ks.insert(&b(&format!("extra:{i}")), obj("v"));
        }
        while cursor != 0 {
            let (next, keys) = ks.scan(cursor, 7);
            seen.extend(keys);
            cursor = next;
        }
        for i in 0..50 {
            assert!(seen.contains(format!("stable:{i}").as_bytes()));
        }
    }

    #[test]
    fn keys_traverses_the_snapshot_chain() {
        let mut ks = Keyspace::new();
        ks.insert(&b("user:1"), obj("a"));
        let snap = ks.fork(1);
        ks.insert(&b("user:2"), obj("b"));
        ks.insert(&b("other"), obj("c"));

        let mut matched = ks.keys(b"user:*");
        matched.sort();
        assert_eq!(matched, vec![b("user:1"), b("user:2")]);
        ks.end_snapshot(snap);
    }

    #[test]
    fn change_scope_flushes_delta_to_storage() {
        #[derive(Default)]
        struct Recorder {
            ops: Vec<String>,
        }
        #[derive(Clone, Default)]
        struct SharedRecorder(std::sync::Arc<std::sync::Mutex<Recorder>>);
        impl StorageBackend for SharedRecorder {
            fn insert(&mut self, key: &[u8], _obj: &Object) {
                self.0.lock().unwrap().ops.push(format!("insert {}", String::from_utf8_lossy(key)));
            }
            fn erase(&mut self, key: &[u8]) {
                self.0.lock().unwrap().ops.push(format!("erase {}", String::from_utf8_lossy(key)));
            }
            fn clear(&mut self) {
                self.0.lock().unwrap().ops.push("clear".into());
            }
        }

        let recorder = SharedRecorder::default();
        let mut ks = Keyspace::new();
        ks.set_storage(Box::new(recorder.clone()));

        ks.track_changes();
        ks.insert(&b("a"), obj("1"));
        ks.insert(&b("b"), obj("2"));
        ks.remove(&b("b"));
        // nothing flushed while the scope is open
        assert!(recorder.0.lock().unwrap().ops.is_empty());
        ks.process_changes();

        let mut ops = recorder.0.lock().unwrap().ops.clone();
        ops.sort();
        assert_eq!(ops, vec!["erase b", "insert a"]);
    }

    #[test]
    fn flush_inside_scope_rewrites_storage_wholesale() {
        #[derive(Clone, Default)]
        struct Counter(std::sync::Arc<std::sync::Mutex<(usize, usize)>>);
        impl StorageBackend for Counter {
            fn insert(&mut self, _key: &[u8], _obj: &Object) {
                self.0.lock().unwrap().0 += 1;
            }
            fn erase(&mut self, _key: &[u8]) {}
            fn clear(&mut self) {
                self.0.lock().unwrap().1 += 1;
            }
        }

        let counter = Counter::default();
        let mut ks = Keyspace::new();
        ks.set_storage(Box::new(counter.clone()));

        ks.track_changes();
        ks.insert(&b("a"), obj("1"));
        ks.clear(false, None);
        ks.insert(&b("b"), obj("2"));
        ks.insert(&b("c"), obj("3"));
        ks.process_changes();

        let (inserts, clears) = *counter.0.lock().unwrap();
        // one clear from the flush itself, one from the wholesale rewrite
        assert_eq!(clears, 2);
        assert_eq!(inserts, 2);
    }

    #[test]
    #[should_panic(expected = "change-tracking scope underflow")]
    fn unbalanced_scope_is_fatal() {
        let mut ks = Keyspace::new();
        ks.process_changes();
    }

    #[test]
    #[should_panic(expected = "overwriting a key not present")]
    fn overwriting_a_missing_key_is_fatal() {
        let mut ks = Keyspace::new();
        ks.update_value(&b("nope"), obj("v"));
    }

    #[test]
    fn glob_basics() {
        assert!(glob_match(b"*", b"anything"));
        assert!(glob_match(b"h?llo", b"hello"));
        assert!(glob_match(b"h[ae]llo", b"hallo"));
        assert!(!glob_match(b"h[^ae]llo", b"hello"));
        assert!(glob_match(b"h[a-c]llo", b"hbllo"));
        assert!(glob_match(b"user:*:profile", b"user:123:profile"));
        assert!(!glob_match(b"user:*:profile", b"user:123:settings"));
        assert!(glob_match(b"a\\*b", b"a*b"));
        assert!(!glob_match(b"a\\*b", b"axb"));
        assert!(glob_match(b"", b""));
        assert!(!glob_match(b"", b"x"));
        assert!(glob_match(b"**", b""));
    }
}
