//! Engine configuration.
//!
//! These are the inputs the embedding server resolves from its config
//! file or CLI and hands to [`crate::engine::Engine::new`]. Parsing
//! helpers accept the config-file spellings.

/// Default number of logical databases.
pub const DEFAULT_DBNUM: usize = 16;

/// How the 24-bit access field on each object is interpreted.
///
/// LRU-family policies store a coarse access clock; LFU-family policies
/// store a logarithmic frequency counter plus a decay timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MaxmemoryPolicy {
    /// Reject writes when memory is full; access field holds the LRU clock.
    #[default]
    NoEviction,
    /// Evict the least-recently-used key across the whole keyspace.
    AllKeysLru,
    /// Evict the least-frequently-used key across the whole keyspace.
    AllKeysLfu,
    /// Evict the least-recently-used key among volatile keys.
    VolatileLru,
    /// Evict the least-frequently-used key among volatile keys.
    VolatileLfu,
}

impl MaxmemoryPolicy {
    /// Returns `true` when the policy interprets the access field as an
    /// LFU counter rather than an LRU clock.
    pub fn uses_lfu(self) -> bool {
        matches!(self, MaxmemoryPolicy::AllKeysLfu | MaxmemoryPolicy::VolatileLfu)
    }
}

/// Parses a maxmemory-policy name from its config-file spelling.
pub fn parse_maxmemory_policy(input: &str) -> Result<MaxmemoryPolicy, String> {
    match input.to_ascii_lowercase().as_str() {
        "noeviction" => Ok(MaxmemoryPolicy::NoEviction),
        "allkeys-lru" => Ok(MaxmemoryPolicy::AllKeysLru),
        "allkeys-lfu" => Ok(MaxmemoryPolicy::AllKeysLfu),
        "volatile-lru" => Ok(MaxmemoryPolicy::VolatileLru),
        "volatile-lfu" => Ok(MaxmemoryPolicy::VolatileLfu),
        _ => Err(format!(
            "unknown maxmemory policy '{input}'. valid options: noeviction, \
             allkeys-lru, allkeys-lfu, volatile-lru, volatile-lfu"
        )),
    }
}

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of logical databases.
    pub dbnum: usize,
    /// Eviction policy; selects LRU vs LFU semantics for the access field.
    pub maxmemory_policy: MaxmemoryPolicy,
    /// Delete values on a background thread for DEL and internal deletes.
    pub lazyfree_lazy_server_del: bool,
    /// Delete values on a background thread when evicting expired keys.
    pub lazyfree_lazy_expire: bool,
    /// Cluster mode: single database, slot→key index maintained,
    /// SELECT/MOVE/SWAPDB restricted.
    pub cluster_enabled: bool,
    /// Active-replica mode: writes are accepted locally and reconciled
    /// with peers through MVCC merge.
    pub active_replica: bool,
    /// Whether replicas reject writes from regular clients.
    pub repl_replica_ro: bool,
    /// Saturation point of the logarithmic LFU counter. Higher values
    /// make the counter grow more slowly.
    pub lfu_log_factor: u32,
    /// Minutes without access before the LFU counter decays by one.
    pub lfu_decay_time: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dbnum: DEFAULT_DBNUM,
            maxmemory_policy: MaxmemoryPolicy::default(),
            lazyfree_lazy_server_del: false,
            lazyfree_lazy_expire: false,
            cluster_enabled: false,
            active_replica: false,
            repl_replica_ro: true,
            lfu_log_factor: 10,
            lfu_decay_time: 1,
        }
    }
}
