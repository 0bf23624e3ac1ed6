//! The engine: a fixed array of logical databases plus the process-wide
//! state their operations consult.
//!
//! Command execution is single-writer: the embedding server serializes
//! commands behind its global lock and every mutating entry point here
//! takes `&mut Engine`, which is the in-crate witness that the lock is
//! held. Worker threads only ever touch immutable snapshot handles.

use ahash::AHashSet;
use bytes::Bytes;

use crate::cluster::SlotIndex;
use crate::config::Config;
use crate::db::Db;
use crate::error::CommandError;
use crate::lazyfree::FreeHandle;
use crate::notify::{KeyspaceEvent, PropagatedCommand, Sinks};
use crate::time;

/// How many volatile keys one active-expiration round samples per
/// database.
const EXPIRE_SAMPLE_SIZE: usize = 20;

/// If more than this fraction of a sample was expired, go again.
const EXPIRE_THRESHOLD: f64 = 0.25;

/// Maximum rounds per beat, to avoid starving the command loop.
const EXPIRE_MAX_ROUNDS: usize = 3;

/// Counters surfaced in INFO.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub expired_keys: u64,
    pub keyspace_hits: u64,
    pub keyspace_misses: u64,
    /// Writes since the last save.
    pub dirty: u64,
}

/// Process-wide state shared by every database.
#[derive(Debug)]
pub struct ServerState {
    pub config: Config,
    pub stats: Stats,
    /// Number of master links; non-zero makes this instance a replica.
    pub masters: usize,
    /// Set while an RDB/AOF is being loaded; nothing expires.
    pub loading: bool,
    /// Set to the script's start time while one is running, freezing
    /// the expiry clock.
    pub script_time: Option<i64>,
    pub sinks: Sinks,
    pub free: FreeHandle,
    pub cluster: SlotIndex,
    /// Clients whose WATCHed keys changed; their MULTI will abort.
    pub dirty_clients: AHashSet<u64>,
    /// Keys a writable replica gave local expiries to, flushed wholesale
    /// on FLUSHALL.
    pub replica_expires: AHashSet<(usize, Bytes)>,
    /// Unix time of the last completed save.
    pub lastsave: i64,
    pub save_in_progress: bool,
    /// Set by SHUTDOWN; the embedding server tears down when it sees
    /// this after the command returns.
    pub shutdown_requested: bool,
}

impl ServerState {
    fn new(config: Config) -> Self {
        Self {
            config,
            stats: Stats::default(),
            masters: 0,
            loading: false,
            script_time: None,
            sinks: Sinks::new(),
            free: FreeHandle::spawn(),
            cluster: SlotIndex::new(),
            dirty_clients: AHashSet::new(),
            replica_expires: AHashSet::new(),
            lastsave: time::now_ms() / 1000,
            save_in_progress: false,
            shutdown_requested: false,
        }
    }

    /// Aborts an in-progress background save (FLUSHALL does this before
    /// forcing a fresh one).
    pub fn kill_background_save(&mut self) {
        if self.save_in_progress {
            tracing::info!("killing background save in progress");
            self.save_in_progress = false;
        }
    }

    /// Requests an immediate save through the persistence hook and
    /// stamps `lastsave`.
    pub fn schedule_save(&mut self) {
        self.lastsave = time::now_ms() / 1000;
        tracing::info!("scheduled immediate save");
    }
}

/// The database array and shared state.
#[derive(Debug)]
pub struct Engine {
    dbs: Vec<Db>,
    pub state: ServerState,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        assert!(config.dbnum > 0, "dbnum must be at least 1");
        let dbs = (0..config.dbnum).map(Db::new).collect();
        Self {
            dbs,
            state: ServerState::new(config),
        }
    }

    pub fn dbnum(&self) -> usize {
        self.dbs.len()
    }

    pub fn db(&self, id: usize) -> &Db {
        &self.dbs[id]
    }

    pub fn db_mut(&mut self, id: usize) -> &mut Db {
        &mut self.dbs[id]
    }

    /// Split borrow for the common "one database + shared state" shape.
    pub fn db_and_state(&mut self, id: usize) -> (&mut Db, &mut ServerState) {
        (&mut self.dbs[id], &mut self.state)
    }

    /// Split borrow of two distinct databases plus the shared state
    /// (MOVE needs both sides at once).
    pub fn two_dbs_and_state(&mut self, a: usize, b: usize) -> (&mut Db, &mut Db, &mut ServerState) {
        assert!(a != b, "two_dbs_and_state needs distinct databases");
        let (lo, hi) = (a.min(b), a.max(b));
        let (head, tail) = self.dbs.split_at_mut(hi);
        let (first, second) = (&mut head[lo], &mut tail[0]);
        if a < b {
            (first, second, &mut self.state)
        } else {
            (second, first, &mut self.state)
        }
    }

    /// Validates a SELECT/MOVE target index.
    pub fn select(&self, id: i64) -> Result<usize, CommandError> {
        if id < 0 || id as usize >= self.dbs.len() {
            return Err(CommandError::DbIndexOutOfRange);
        }
        Ok(id as usize)
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<KeyspaceEvent> {
        self.state.sinks.subscribe_events()
    }

    pub fn subscribe_propagation(&self) -> tokio::sync::broadcast::Receiver<PropagatedCommand> {
        self.state.sinks.subscribe_propagation()
    }

    /// Swaps the keyspaces (and TTL accounting) of two databases while
    /// the blocking and watch tables stay with their logical index, so
    /// connected clients keep their bindings. Both databases are then
    /// rescanned for waiters whose keys now exist.
    pub fn swap_databases(&mut self, a: usize, b: usize) -> Result<(), CommandError> {
        if a >= self.dbs.len() || b >= self.dbs.len() {
            return Err(CommandError::DbIndexOutOfRange);
        }
        if a == b {
            return Ok(());
        }
        let (lo, hi) = (a.min(b), a.max(b));
        let (head, tail) = self.dbs.split_at_mut(hi);
        let first = &mut head[lo];
        let second = &mut tail[0];
        Db::swap_persistent(first, second);
        first.scan_for_ready_lists();
        second.scan_for_ready_lists();
        Ok(())
    }

    /// Removes every key from one database (or all of them with
    /// `dbnum == None`). Watchers are marked dirty, the cluster index is
    /// flushed, and with `lazy` the old tables go to the free thread.
    /// Returns the number of keys removed.
    pub fn empty_db(&mut self, dbnum: Option<usize>, lazy: bool) -> Result<usize, CommandError> {
        if let Some(id) = dbnum {
            if id >= self.dbs.len() {
                return Err(CommandError::DbIndexOutOfRange);
            }
        }
        let range = match dbnum {
            Some(id) => id..id + 1,
            None => 0..self.dbs.len(),
        };
        let state = &mut self.state;
        let mut removed = 0;
        for db in &mut self.dbs[range] {
            db.touch_all_watched(state);
            removed += db.keyspace_mut().clear(lazy, Some(&state.free));
        }
        if state.config.cluster_enabled {
            state.cluster.flush();
        }
        if dbnum.is_none() {
            state.replica_expires.clear();
        }
        Ok(removed)
    }

    /// One active-expiration beat over every database: sample, evict,
    /// and repeat while the hit rate stays high. Returns total evicted.
    pub fn run_expire_cycle(&mut self) -> usize {
        let mut total = 0;
        for id in 0..self.dbs.len() {
            let (db, state) = (&mut self.dbs[id], &mut self.state);
            for _ in 0..EXPIRE_MAX_ROUNDS {
                let removed = db.expire_cycle(state, EXPIRE_SAMPLE_SIZE);
                total += removed;
                if (removed as f64) < (EXPIRE_SAMPLE_SIZE as f64) * EXPIRE_THRESHOLD {
                    break;
                }
            }
        }
        total
    }

    /// Deletes every key in a cluster slot, one at a time, until the
    /// slot counter drains. Cluster keys live in database 0.
    pub fn del_keys_in_slot(&mut self, slot: u16) -> usize {
        let mut removed = 0;
        while self.state.cluster.count_keys_in_slot(slot) > 0 {
            let key = self
                .state
                .cluster
                .first_key_in_slot(slot)
                .expect("slot counter out of sync with the index");
            let (db, state) = self.db_and_state(0);
            db.delete(state, &key);
            removed += 1;
        }
        removed
    }
}
