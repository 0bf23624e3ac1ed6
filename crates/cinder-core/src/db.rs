//! One logical database: a keyspace plus the expiry accounting and the
//! blocking/watch bookkeeping that stays behind when databases are
//! swapped.
//!
//! The write paths here carry the engine-wide policies: MVCC stamping in
//! active-replica mode, LFU inheritance on overwrite, expiry carry or
//! strip, sync-vs-lazy release of replaced values, cluster slot index
//! maintenance, and the signal-ready/signal-modified hooks the blocking
//! and transaction layers listen on.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use rand::seq::IteratorRandom;

use crate::engine::ServerState;
use crate::expire::ExpireEntry;
use crate::keyspace::{make_owned, Keyspace};
use crate::notify::{EventKind, PropagationTargets};
use crate::object::Object;
use crate::time;
use crate::types::Value;

/// Flags for the read-path lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct LookupFlags {
    /// Don't refresh the key's access clock (TYPE, OBJECT, SCAN filter).
    pub no_touch: bool,
}

impl LookupFlags {
    pub const NONE: Self = Self { no_touch: false };
    pub const NO_TOUCH: Self = Self { no_touch: true };
}

/// A logical database.
#[derive(Debug)]
pub struct Db {
    pub(crate) ks: Keyspace,
    id: usize,
    /// Exponentially-weighted average of remaining TTL at expire-set
    /// time, surfaced in INFO.
    avg_ttl: f64,
    last_expire_set: i64,
    /// Keys with at least one blocked waiter, with the waiter count.
    blocking_keys: AHashMap<Bytes, u32>,
    /// Keys that became servable since the last beat; drained by the
    /// blocking layer.
    ready_keys: AHashSet<Bytes>,
    /// Key → ids of clients WATCHing it.
    watched_keys: AHashMap<Bytes, AHashSet<u64>>,
}

impl Db {
    pub fn new(id: usize) -> Self {
        Self {
            ks: Keyspace::new(),
            id,
            avg_ttl: 0.0,
            last_expire_set: 0,
            blocking_keys: AHashMap::new(),
            ready_keys: AHashSet::new(),
            watched_keys: AHashMap::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn size(&self) -> usize {
        self.ks.size()
    }

    pub fn expire_size(&self) -> usize {
        self.ks.expire_size()
    }

    pub fn avg_ttl(&self) -> f64 {
        self.avg_ttl
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.ks
    }

    pub fn keyspace_mut(&mut self) -> &mut Keyspace {
        &mut self.ks
    }

    // ---- lookups ------------------------------------------------------

    /// Read-path lookup: runs the expiration gate, refreshes the access
    /// clock, updates hit/miss stats and fires `keymiss` on a miss.
    ///
    /// On a replica a logically expired key reads as missing even though
    /// the master has yet to propagate the DEL.
    pub fn lookup_key_read_with_flags(
        &mut self,
        state: &mut ServerState,
        key: &Bytes,
        flags: LookupFlags,
    ) -> Option<Arc<Object>> {
        if self.expire_if_needed(state, key) {
            state.stats.keyspace_misses += 1;
            state.sinks.notify(self.id, EventKind::KeyMiss, key);
            return None;
        }
        match self.ks.find(key) {
            Some(obj) => {
                if !flags.no_touch {
                    obj.touch(&state.config);
                }
                state.stats.keyspace_hits += 1;
                Some(Arc::clone(obj))
            }
            None => {
                state.stats.keyspace_misses += 1;
                state.sinks.notify(self.id, EventKind::KeyMiss, key);
                None
            }
        }
    }

    pub fn lookup_key_read(&mut self, state: &mut ServerState, key: &Bytes) -> Option<Arc<Object>> {
        self.lookup_key_read_with_flags(state, key, LookupFlags::NONE)
    }

    /// Write-path lookup: expires the key if due, stamps MVCC in
    /// active-replica mode, no miss accounting.
    pub fn lookup_key_write(&mut self, state: &mut ServerState, key: &Bytes) -> Option<Arc<Object>> {
        if self.expire_if_needed(state, key) {
            return None;
        }
        if state.config.active_replica && self.ks.contains(key) {
            let stamp = time::next_mvcc_stamp();
            if let Some(obj) = self.ks.get_owned(key) {
                obj.set_mvcc(stamp);
            }
        }
        let obj = self.ks.find(key)?;
        obj.touch(&state.config);
        Some(Arc::clone(obj))
    }

    // ---- write paths --------------------------------------------------

    /// Adds a key that may already exist. Returns `false` (leaving the
    /// resident value in place) if it does.
    pub fn try_add(&mut self, state: &mut ServerState, key: &Bytes, mut val: Arc<Object>) -> bool {
        if state.config.active_replica {
            make_owned(&mut val).set_mvcc(time::next_mvcc_stamp());
        }
        let wakes = matches!(val.value(), Value::List(_) | Value::SortedSet(_));
        if !self.ks.insert(key, val) {
            return false;
        }
        if wakes {
            self.signal_key_as_ready(key);
        }
        if state.config.cluster_enabled && self.id == 0 {
            state.cluster.add(key);
        }
        true
    }

    /// Adds a key known to be absent; aborting on a duplicate because a
    /// caller that didn't check first has corrupted state.
    pub fn add(&mut self, state: &mut ServerState, key: &Bytes, val: Arc<Object>) {
        let inserted = self.try_add(state, key, val);
        assert!(inserted, "adding a key that already exists");
    }

    /// Overwrites an existing key. The old value's expiry is carried to
    /// the new value (duplicating a shared immortal first) or removed on
    /// request; under an LFU policy the access field is inherited so the
    /// decay history survives; `update_mvcc` stamps the new value.
    ///
    /// Aborts if the key is not present.
    pub fn overwrite_core(
        &mut self,
        state: &mut ServerState,
        key: &Bytes,
        mut val: Arc<Object>,
        update_mvcc: bool,
        remove_expire: bool,
    ) {
        let old = Arc::clone(
            self.ks
                .find(key)
                .expect("overwriting a key not present in the keyspace"),
        );
        if old.has_expiry() {
            if remove_expire {
                self.ks.remove_expire(key);
            } else {
                // the index entry stays keyed as-is; only the flag moves
                make_owned(&mut val).set_has_expiry(true);
            }
        }
        if state.config.maxmemory_policy.uses_lfu() {
            val.set_access_field(old.access_field());
        }
        if update_mvcc {
            make_owned(&mut val).set_mvcc(time::next_mvcc_stamp());
        }
        drop(old);
        let released = self.ks.update_value(key, val);
        if state.config.lazyfree_lazy_server_del {
            state.free.free_object(released);
        }
    }

    /// Overwrite preserving the expiry, stamping MVCC in active-replica
    /// mode.
    pub fn overwrite(&mut self, state: &mut ServerState, key: &Bytes, val: Arc<Object>) {
        self.overwrite_core(state, key, val, state.config.active_replica, false);
    }

    /// High-level set: add or overwrite, resetting any expiry, then
    /// signal watchers.
    pub fn set_key(&mut self, state: &mut ServerState, key: &Bytes, val: Arc<Object>) {
        if self.ks.find(key).is_none() {
            self.add(state, key, val);
        } else {
            self.overwrite_core(state, key, val, state.config.active_replica, true);
        }
        self.signal_modified(state, key);
    }

    /// Last-writer-wins merge for a replicated write. With `replace` the
    /// incoming value applies only when the resident value is at most as
    /// new; an older incoming write is dropped.
    pub fn merge(
        &mut self,
        state: &mut ServerState,
        key: &Bytes,
        val: Arc<Object>,
        replace: bool,
    ) -> bool {
        if !replace {
            return self.try_add(state, key, val);
        }
        let resident_mvcc = match self.ks.find(key) {
            None => return self.try_add(state, key, val),
            Some(old) => old.mvcc(),
        };
        if resident_mvcc <= val.mvcc() {
            self.overwrite_core(state, key, val, false, true);
            true
        } else {
            false
        }
    }

    /// Deletes a key, sync or lazy per configuration.
    pub fn delete(&mut self, state: &mut ServerState, key: &Bytes) -> bool {
        if state.config.lazyfree_lazy_server_del {
            self.delete_async(state, key)
        } else {
            self.delete_sync(state, key)
        }
    }

    pub fn delete_sync(&mut self, state: &mut ServerState, key: &Bytes) -> bool {
        match self.ks.remove(key) {
            Some(_obj) => {
                self.after_delete(state, key);
                true
            }
            None => false,
        }
    }

    /// Like `delete_sync` but the value's destructor runs on the free
    /// thread.
    pub fn delete_async(&mut self, state: &mut ServerState, key: &Bytes) -> bool {
        match self.ks.remove(key) {
            Some(obj) => {
                self.after_delete(state, key);
                state.free.free_object(obj);
                true
            }
            None => false,
        }
    }

    fn after_delete(&mut self, state: &mut ServerState, key: &Bytes) {
        if state.config.cluster_enabled && self.id == 0 {
            state.cluster.remove(key);
        }
    }

    /// Removes a key and hands its object (flag detached) to the caller,
    /// for RENAME/MOVE which re-add it elsewhere.
    pub fn take_for_transfer(&mut self, state: &mut ServerState, key: &Bytes) -> Option<Arc<Object>> {
        let mut obj = self.ks.remove(key)?;
        self.after_delete(state, key);
        if obj.has_expiry() {
            // the index entry went with the delete; the carried object
            // must not claim one until it is re-added
            make_owned(&mut obj).set_has_expiry(false);
        }
        Some(obj)
    }

    // ---- expiry -------------------------------------------------------

    /// Sets a deadline for a key (or one of its subkeys), maintaining
    /// the database's TTL moving average and, on a writable replica, the
    /// set of locally expiring keys.
    pub fn set_expire(
        &mut self,
        state: &mut ServerState,
        key: &Bytes,
        subkey: Option<Bytes>,
        when_ms: i64,
    ) {
        let now = time::now_ms();
        // the average ages by the wall time elapsed since the last set
        self.avg_ttl -= (now - self.last_expire_set) as f64;
        let expire_size = self.ks.expire_size();
        if expire_size == 0 {
            self.avg_ttl = 0.0;
        } else {
            // slide one entry out of the window
            self.avg_ttl -= self.avg_ttl / expire_size as f64;
        }
        if self.avg_ttl < 0.0 {
            self.avg_ttl = 0.0;
        }
        self.avg_ttl += (when_ms - now) as f64 / (expire_size + 1) as f64;
        self.last_expire_set = now;

        self.ks.set_expire(key, subkey, when_ms);

        if state.masters > 0 && !state.config.repl_replica_ro {
            state.replica_expires.insert((self.id, key.clone()));
        }
    }

    /// Installs a carried expiry entry whole (RENAME/MOVE).
    pub fn set_expire_entry(&mut self, state: &mut ServerState, key: &Bytes, entry: ExpireEntry) {
        self.ks.set_expire_entry(key, entry);
        if state.masters > 0 && !state.config.repl_replica_ro {
            state.replica_expires.insert((self.id, key.clone()));
        }
    }

    pub fn remove_expire(&mut self, key: &Bytes) -> bool {
        self.ks.remove_expire(key)
    }

    pub fn remove_subkey_expire(&mut self, key: &Bytes, subkey: &[u8]) -> bool {
        self.ks.remove_subkey_expire(key, subkey)
    }

    pub fn get_expire(&self, key: &[u8]) -> Option<&ExpireEntry> {
        self.ks.get_expire(key)
    }

    /// Whether the key's whole-key deadline has passed.
    ///
    /// Loading is atemporal: nothing expires while an RDB/AOF is being
    /// read. Inside a script the clock is frozen at the script's start
    /// so a key expires at most once per invocation and propagation
    /// stays deterministic.
    pub fn key_is_expired(&self, state: &ServerState, key: &[u8]) -> bool {
        let Some(entry) = self.ks.get_expire(key) else {
            return false;
        };
        if state.loading {
            return false;
        }
        let Some(when) = entry.whole_when() else {
            return false;
        };
        let now = state.script_time.unwrap_or_else(time::now_ms);
        now > when
    }

    /// The expiration gate consulted by every lookup.
    ///
    /// Returns `true` when the key is logically expired. On a
    /// non-active replica the key is left in place (the master owns the
    /// eviction); otherwise the eviction is counted, propagated as a
    /// synthesized DEL/UNLINK, notified, and performed sync or lazy per
    /// configuration.
    pub fn expire_if_needed(&mut self, state: &mut ServerState, key: &Bytes) -> bool {
        if !self.key_is_expired(state, key) {
            return false;
        }
        if state.masters > 0 && !state.config.active_replica {
            return true;
        }

        state.stats.expired_keys += 1;
        self.propagate_expire(state, key);
        state.sinks.notify(self.id, EventKind::Expired, key);
        if state.config.lazyfree_lazy_expire {
            self.delete_async(state, key)
        } else {
            self.delete_sync(state, key)
        }
    }

    /// Feeds the synthesized eviction to the AOF and, unless this is an
    /// active replica (peers expire independently), to the replicas.
    fn propagate_expire(&self, state: &ServerState, key: &Bytes) {
        let verb = if state.config.lazyfree_lazy_expire {
            Bytes::from_static(b"UNLINK")
        } else {
            Bytes::from_static(b"DEL")
        };
        let targets = if state.config.active_replica {
            PropagationTargets::AOF_ONLY
        } else {
            PropagationTargets::BOTH
        };
        state.sinks.propagate(self.id, vec![verb, key.clone()], targets);
    }

    /// One active-expiration sampling pass: up to `sample` random
    /// volatile keys are run through the gate. Returns how many were
    /// evicted.
    pub fn expire_cycle(&mut self, state: &mut ServerState, sample: usize) -> usize {
        if self.ks.expires().is_empty() {
            return 0;
        }
        let picked: Vec<Bytes> = {
            let mut rng = rand::rng();
            self.ks.expires().keys().cloned().choose_multiple(&mut rng, sample)
        };
        let mut removed = 0;
        for key in picked {
            if self.expire_if_needed(state, &key) {
                removed += 1;
            }
        }
        removed
    }

    // ---- random -------------------------------------------------------

    /// Uniform random non-expired key.
    ///
    /// On a replica whose dataset is entirely volatile every draw may be
    /// logically expired, so after 100 tries the last draw is returned
    /// as-is rather than looping forever.
    pub fn random_key(&mut self, state: &mut ServerState) -> Option<Bytes> {
        let mut maxtries = 100;
        let all_volatile = self.ks.expire_size() == self.ks.size();
        loop {
            let key = self.ks.random_key()?;
            let has_expiry = self.ks.get_visible(&key).is_some_and(|o| o.has_expiry());
            if has_expiry {
                if all_volatile && state.masters > 0 {
                    maxtries -= 1;
                    if maxtries == 0 {
                        return Some(key);
                    }
                }
                if self.expire_if_needed(state, &key) {
                    continue;
                }
            }
            return Some(key);
        }
    }

    // ---- introspection ------------------------------------------------

    /// LFU frequency counter (decayed), when an LFU policy is active.
    pub fn object_freq(&self, state: &ServerState, key: &[u8]) -> Option<u8> {
        if !state.config.maxmemory_policy.uses_lfu() {
            return None;
        }
        self.ks.get_visible(key).map(|o| o.lfu_decr_and_return(&state.config))
    }

    /// Approximate idle seconds, when an LRU policy is active.
    pub fn object_idletime(&self, state: &ServerState, key: &[u8]) -> Option<u64> {
        if state.config.maxmemory_policy.uses_lfu() {
            return None;
        }
        self.ks.get_visible(key).map(|o| o.idle_seconds())
    }

    // ---- blocking / watch bookkeeping ---------------------------------

    /// Registers a blocked waiter on a key.
    pub fn block_on_key(&mut self, key: &Bytes) {
        *self.blocking_keys.entry(key.clone()).or_insert(0) += 1;
    }

    /// Drops one blocked waiter from a key.
    pub fn unblock_on_key(&mut self, key: &[u8]) {
        if let Some(count) = self.blocking_keys.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.blocking_keys.remove(key);
            }
        }
    }

    /// Marks a key servable if anyone is blocked on it.
    pub fn signal_key_as_ready(&mut self, key: &Bytes) {
        if self.blocking_keys.contains_key(key) {
            self.ready_keys.insert(key.clone());
        }
    }

    /// Drains the ready set; the blocking layer retries its waiters.
    pub fn take_ready_keys(&mut self) -> Vec<Bytes> {
        self.ready_keys.drain().collect()
    }

    /// Registers a WATCH.
    pub fn watch_key(&mut self, key: &Bytes, client: u64) {
        self.watched_keys.entry(key.clone()).or_default().insert(client);
    }

    /// Drops every WATCH held by a client.
    pub fn unwatch(&mut self, client: u64) {
        self.watched_keys.retain(|_, watchers| {
            watchers.remove(&client);
            !watchers.is_empty()
        });
    }

    /// Marks every client watching this key as dirty (their MULTI will
    /// abort).
    pub fn signal_modified(&mut self, state: &mut ServerState, key: &Bytes) {
        if let Some(watchers) = self.watched_keys.get(key) {
            state.dirty_clients.extend(watchers.iter().copied());
        }
    }

    /// Marks every watcher in this database dirty (FLUSHDB/FLUSHALL/SWAPDB).
    pub(crate) fn touch_all_watched(&self, state: &mut ServerState) {
        for watchers in self.watched_keys.values() {
            state.dirty_clients.extend(watchers.iter().copied());
        }
    }

    /// After a database swap, keys a waiter blocked on may suddenly
    /// exist: rescan and re-signal readiness.
    pub(crate) fn scan_for_ready_lists(&mut self) {
        let candidates: Vec<Bytes> = self.blocking_keys.keys().cloned().collect();
        for key in candidates {
            if let Some(obj) = self.ks.get_visible(&key) {
                if obj.value().can_wake_blocked() {
                    self.ready_keys.insert(key);
                }
            }
        }
    }

    /// Swaps the persistent halves of two databases, leaving the
    /// blocking and watch tables bound to their logical slots.
    pub(crate) fn swap_persistent(a: &mut Db, b: &mut Db) {
        std::mem::swap(&mut a.ks, &mut b.ks);
        std::mem::swap(&mut a.avg_ttl, &mut b.avg_ttl);
        std::mem::swap(&mut a.last_expire_set, &mut b.last_expire_set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, MaxmemoryPolicy};
    use crate::engine::Engine;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn obj(s: &str) -> Arc<Object> {
        Arc::new(Object::new(Value::String(Bytes::copy_from_slice(s.as_bytes()))))
    }

    fn obj_with_mvcc(s: &str, mvcc: u64) -> Arc<Object> {
        let mut o = Object::new(Value::String(Bytes::copy_from_slice(s.as_bytes())));
        o.set_mvcc(mvcc);
        Arc::new(o)
    }

    fn str_of(o: &Arc<Object>) -> Bytes {
        match o.value() {
            Value::String(s) => s.clone(),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn overwrite_carries_the_expiry_flag() {
        let mut engine = Engine::new(Config::default());
        let (db, state) = engine.db_and_state(0);
        db.add(state, &b("k"), obj("old"));
        db.set_expire(state, &b("k"), None, time::now_ms() + 50_000);

        db.overwrite(state, &b("k"), obj("new"));
        let resident = db.keyspace_mut().find(&b("k")).unwrap();
        assert_eq!(str_of(resident), b("new"));
        assert!(resident.has_expiry());
        assert!(db.get_expire(b"k").is_some());
    }

    #[test]
    fn set_key_strips_the_expiry() {
        let mut engine = Engine::new(Config::default());
        let (db, state) = engine.db_and_state(0);
        db.set_key(state, &b("k"), obj("old"));
        db.set_expire(state, &b("k"), None, time::now_ms() + 50_000);

        db.set_key(state, &b("k"), obj("new"));
        assert!(db.get_expire(b"k").is_none());
        assert!(!db.keyspace_mut().find(&b("k")).unwrap().has_expiry());
        assert_eq!(db.expire_size(), 0);
    }

    #[test]
    fn overwrite_inherits_the_lfu_field() {
        let mut engine = Engine::new(Config {
            maxmemory_policy: MaxmemoryPolicy::AllKeysLfu,
            ..Config::default()
        });
        let (db, state) = engine.db_and_state(0);
        db.add(state, &b("k"), obj("old"));
        db.keyspace_mut().find(&b("k")).unwrap().set_access_field(0x00ab_cd42);

        db.overwrite(state, &b("k"), obj("new"));
        let resident = db.keyspace_mut().find(&b("k")).unwrap();
        assert_eq!(resident.access_field(), 0x00ab_cd42);
    }

    #[test]
    fn merge_drops_older_incoming_writes() {
        let mut engine = Engine::new(Config::default());
        let (db, state) = engine.db_and_state(0);
        db.add(state, &b("k"), obj_with_mvcc("resident", 100));

        // older incoming write loses
        assert!(!db.merge(state, &b("k"), obj_with_mvcc("stale", 50), true));
        assert_eq!(str_of(db.keyspace_mut().find(&b("k")).unwrap()), b("resident"));

        // newer (or equal) incoming write wins and keeps its stamp
        assert!(db.merge(state, &b("k"), obj_with_mvcc("fresh", 200), true));
        let resident = db.keyspace_mut().find(&b("k")).unwrap();
        assert_eq!(str_of(resident), b("fresh"));
        assert_eq!(resident.mvcc(), 200);
    }

    #[test]
    fn merge_without_replace_never_overwrites() {
        let mut engine = Engine::new(Config::default());
        let (db, state) = engine.db_and_state(0);
        db.add(state, &b("k"), obj_with_mvcc("resident", 1));
        assert!(!db.merge(state, &b("k"), obj_with_mvcc("incoming", 999), false));
        assert_eq!(str_of(db.keyspace_mut().find(&b("k")).unwrap()), b("resident"));
    }

    #[test]
    fn active_replica_stamps_every_insert() {
        let mut engine = Engine::new(Config {
            active_replica: true,
            ..Config::default()
        });
        let (db, state) = engine.db_and_state(0);
        db.set_key(state, &b("k"), obj("v"));
        let first = db.keyspace_mut().find(&b("k")).unwrap().mvcc();
        assert!(first > 0);
        db.set_key(state, &b("k"), obj("w"));
        let second = db.keyspace_mut().find(&b("k")).unwrap().mvcc();
        assert!(second > first);
    }

    #[test]
    fn replica_reads_expired_keys_as_missing_without_evicting() {
        let mut engine = Engine::new(Config::default());
        engine.state.masters = 1;
        let (db, state) = engine.db_and_state(0);
        db.set_key(state, &b("k"), obj("v"));
        db.set_expire(state, &b("k"), None, time::now_ms() - 10);

        assert!(db.lookup_key_read(state, &b("k")).is_none());
        // the key is still physically present: eviction is the master's
        assert_eq!(db.size(), 1);
        assert_eq!(state.stats.expired_keys, 0);
        assert_eq!(state.stats.keyspace_misses, 1);
    }

    #[test]
    fn master_eviction_propagates_then_deletes() {
        let mut engine = Engine::new(Config::default());
        let mut propagation = engine.subscribe_propagation();
        let mut events = engine.subscribe_events();
        let (db, state) = engine.db_and_state(0);
        db.set_key(state, &b("k"), obj("v"));
        db.set_expire(state, &b("k"), None, time::now_ms() - 10);

        assert!(db.lookup_key_read(state, &b("k")).is_none());
        assert_eq!(db.size(), 0);
        assert_eq!(state.stats.expired_keys, 1);

        let cmd = propagation.try_recv().unwrap();
        assert_eq!(cmd.argv, vec![b("DEL"), b("k")]);
        assert!(cmd.targets.replicas);
        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::Expired, EventKind::KeyMiss]);
    }

    #[test]
    fn active_replica_expires_locally_but_does_not_forward() {
        let mut engine = Engine::new(Config {
            active_replica: true,
            ..Config::default()
        });
        engine.state.masters = 1;
        let mut propagation = engine.subscribe_propagation();
        let (db, state) = engine.db_and_state(0);
        db.set_key(state, &b("k"), obj("v"));
        db.set_expire(state, &b("k"), None, time::now_ms() - 10);

        assert!(db.expire_if_needed(state, &b("k")));
        // evicted locally despite having a master
        assert_eq!(db.size(), 0);
        let cmd = propagation.try_recv().unwrap();
        assert!(cmd.targets.aof);
        assert!(!cmd.targets.replicas);
    }

    #[test]
    fn lazy_expire_propagates_unlink() {
        let mut engine = Engine::new(Config {
            lazyfree_lazy_expire: true,
            ..Config::default()
        });
        let mut propagation = engine.subscribe_propagation();
        let (db, state) = engine.db_and_state(0);
        db.set_key(state, &b("k"), obj("v"));
        db.set_expire(state, &b("k"), None, time::now_ms() - 10);

        assert!(db.expire_if_needed(state, &b("k")));
        assert_eq!(propagation.try_recv().unwrap().argv[0], b("UNLINK"));
    }

    #[test]
    fn nothing_expires_while_loading() {
        let mut engine = Engine::new(Config::default());
        engine.state.loading = true;
        let (db, state) = engine.db_and_state(0);
        db.set_key(state, &b("k"), obj("v"));
        db.set_expire(state, &b("k"), None, time::now_ms() - 10);

        assert!(!db.key_is_expired(state, b"k"));
        assert!(db.lookup_key_read(state, &b("k")).is_some());
    }

    #[test]
    fn script_clock_is_frozen_at_invocation() {
        let mut engine = Engine::new(Config::default());
        let (db, state) = engine.db_and_state(0);
        db.set_key(state, &b("k"), obj("v"));
        let deadline = time::now_ms() + 50;
        db.set_expire(state, &b("k"), None, deadline);

        // the script started before the deadline; even "later" reads
        // inside it see the key alive
        state.script_time = Some(deadline - 20);
        assert!(!db.key_is_expired(state, b"k"));
        // a script started after the deadline sees it dead
        state.script_time = Some(deadline + 1);
        assert!(db.key_is_expired(state, b"k"));
    }

    #[test]
    fn random_key_gives_up_after_the_try_cap() {
        let mut engine = Engine::new(Config::default());
        engine.state.masters = 1; // replica: the gate never evicts
        let (db, state) = engine.db_and_state(0);
        for i in 0..5 {
            let key = b(&format!("vol:{i}"));
            db.set_key(state, &key, obj("v"));
            db.set_expire(state, &key, None, time::now_ms() - 10);
        }
        assert_eq!(db.expire_size(), db.size());

        // every key is logically expired; the cap forces a result anyway
        let drawn = db.random_key(state).expect("cap must yield a key");
        assert!(drawn.starts_with(b"vol:"));
        assert_eq!(db.size(), 5);
    }

    #[test]
    fn random_key_skips_expired_keys_on_a_master() {
        let mut engine = Engine::new(Config::default());
        let (db, state) = engine.db_and_state(0);
        db.set_key(state, &b("alive"), obj("v"));
        db.set_key(state, &b("dead"), obj("v"));
        db.set_expire(state, &b("dead"), None, time::now_ms() - 10);

        for _ in 0..20 {
            assert_eq!(db.random_key(state), Some(b("alive")));
        }
        // drawing evicted the dead key on first touch
        assert_eq!(db.size(), 1);
    }

    #[test]
    fn take_for_transfer_detaches_the_expiry_flag() {
        let mut engine = Engine::new(Config::default());
        let (db, state) = engine.db_and_state(0);
        db.set_key(state, &b("k"), obj("v"));
        db.set_expire(state, &b("k"), None, time::now_ms() + 50_000);

        let carried = db.take_for_transfer(state, &b("k")).unwrap();
        assert!(!carried.has_expiry());
        assert_eq!(db.size(), 0);
        assert_eq!(db.expire_size(), 0);
        // re-adding elsewhere is clean
        db.add(state, &b("j"), carried);
    }

    #[test]
    fn avg_ttl_tracks_sets_and_never_goes_negative() {
        let mut engine = Engine::new(Config::default());
        let (db, state) = engine.db_and_state(0);
        db.set_key(state, &b("a"), obj("v"));
        db.set_expire(state, &b("a"), None, time::now_ms() + 10_000);
        assert!(db.avg_ttl() > 0.0);

        db.set_key(state, &b("b"), obj("v"));
        db.set_expire(state, &b("b"), None, time::now_ms() - 500_000);
        assert!(db.avg_ttl() >= 0.0);
    }

    #[test]
    fn writable_replica_remembers_local_expiries() {
        let mut engine = Engine::new(Config {
            repl_replica_ro: false,
            ..Config::default()
        });
        engine.state.masters = 1;
        let (db, state) = engine.db_and_state(0);
        db.set_key(state, &b("k"), obj("v"));
        db.set_expire(state, &b("k"), None, time::now_ms() + 50_000);
        assert!(state.replica_expires.contains(&(0, b("k"))));
    }

    #[test]
    fn watch_and_modify_marks_clients_dirty() {
        let mut engine = Engine::new(Config::default());
        let (db, state) = engine.db_and_state(0);
        db.watch_key(&b("k"), 7);
        db.set_key(state, &b("k"), obj("v"));
        assert!(state.dirty_clients.contains(&7));

        state.dirty_clients.clear();
        db.unwatch(7);
        db.set_key(state, &b("k"), obj("w"));
        assert!(state.dirty_clients.is_empty());
    }

    #[test]
    fn blocked_waiters_are_signalled_on_list_insert() {
        let mut engine = Engine::new(Config::default());
        let (db, state) = engine.db_and_state(0);
        db.block_on_key(&b("queue"));

        // a plain string does not wake list waiters
        db.set_key(state, &b("queue"), obj("v"));
        assert!(db.take_ready_keys().is_empty());
        db.delete(state, &b("queue"));

        let list = Value::List([b("x")].into_iter().collect());
        db.set_key(state, &b("queue"), Arc::new(Object::new(list)));
        assert_eq!(db.take_ready_keys(), vec![b("queue")]);

        db.unblock_on_key(b"queue");
        let list = Value::List([b("y")].into_iter().collect());
        db.set_key(state, &b("queue2"), Arc::new(Object::new(list)));
        assert!(db.take_ready_keys().is_empty());
    }

    #[test]
    fn object_freq_and_idletime_follow_the_policy() {
        let mut engine = Engine::new(Config::default());
        let (db, state) = engine.db_and_state(0);
        db.set_key(state, &b("k"), obj("v"));
        assert!(db.object_freq(state, b"k").is_none());
        assert!(db.object_idletime(state, b"k").is_some());

        state.config.maxmemory_policy = MaxmemoryPolicy::AllKeysLfu;
        assert!(db.object_freq(state, b"k").is_some());
        assert!(db.object_idletime(state, b"k").is_none());
    }
}
