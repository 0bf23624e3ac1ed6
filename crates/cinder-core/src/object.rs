//! The value object: a typed payload plus the per-key metadata the
//! engine tracks.
//!
//! Keyspace slots hold `Arc<Object>`; the `Arc` strong count plays the
//! role of the object reference count (one per keyspace slot, snapshot
//! alias or transient caller pin). Shared immortal objects — the small
//! integer pool — are marked with `shared` and must be duplicated before
//! any mutation, expiry assignment or MVCC stamp; [`Object::unshared`]
//! is that duplication.
//!
//! The 24-bit access field is an `AtomicU32` because objects aliased by
//! immutable snapshots still get their access clock touched on reads.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use rand::Rng;

use crate::config::Config;
use crate::time;
use crate::types::Value;

/// Size of the shared small-integer pool.
pub const SHARED_INTEGERS: i64 = 10_000;

/// Strings at or below this length use the embedded encoding.
const EMBSTR_SIZE_LIMIT: usize = 44;

/// Containers at or below this element count use a compact encoding.
const COMPACT_ENCODING_LIMIT: usize = 128;

/// Initial value of a fresh LFU counter, so new keys are not immediate
/// eviction victims.
pub const LFU_INIT_VAL: u8 = 5;

/// Mask for the 24-bit access field.
const ACCESS_FIELD_MASK: u32 = 0x00ff_ffff;

/// How a value is physically represented, as reported by OBJECT ENCODING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Plain heap string.
    Raw,
    /// Short string stored inline with the header.
    Embstr,
    /// String holding a decimal integer.
    Int,
    /// General hash table.
    HashTable,
    /// Compact flat encoding for small lists/hashes/zsets.
    ZipList,
    /// Sorted array of integers for small all-integer sets.
    IntSet,
    /// Skip-list encoding for large sorted sets.
    SkipList,
}

impl Encoding {
    fn for_value(value: &Value) -> Encoding {
        match value {
            Value::String(s) => {
                if parse_i64(s).is_some() {
                    Encoding::Int
                } else if s.len() <= EMBSTR_SIZE_LIMIT {
                    Encoding::Embstr
                } else {
                    Encoding::Raw
                }
            }
            Value::List(_) => Encoding::ZipList,
            Value::Hash(h) if h.len() <= COMPACT_ENCODING_LIMIT => Encoding::ZipList,
            Value::Hash(_) => Encoding::HashTable,
            Value::Set(s) => {
                if s.len() <= COMPACT_ENCODING_LIMIT && s.iter().all(|m| parse_i64(m).is_some()) {
                    Encoding::IntSet
                } else {
                    Encoding::HashTable
                }
            }
            Value::SortedSet(z) if z.len() <= COMPACT_ENCODING_LIMIT => Encoding::ZipList,
            Value::SortedSet(_) => Encoding::SkipList,
            Value::Stream(_) => Encoding::Raw,
        }
    }
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// A stored value plus its metadata.
#[derive(Debug)]
pub struct Object {
    value: Value,
    encoding: Encoding,
    /// 24-bit combined field: LRU clock, or LFU (decay-minute << 8 | counter).
    access: AtomicU32,
    /// MVCC stamp of the write that installed this value.
    mvcc: u64,
    /// Mirrors membership in the expiry index. The two are mutated
    /// together and never independently.
    has_expiry: bool,
    /// Shared immortal marker; such objects never carry an expiry.
    shared: bool,
}

impl Clone for Object {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            encoding: self.encoding,
            access: AtomicU32::new(self.access.load(Ordering::Relaxed)),
            mvcc: self.mvcc,
            has_expiry: self.has_expiry,
            shared: self.shared,
        }
    }
}

impl Object {
    /// Wraps a value with fresh metadata.
    pub fn new(value: Value) -> Self {
        let encoding = Encoding::for_value(&value);
        Self {
            value,
            encoding,
            access: AtomicU32::new(time::lru_clock()),
            mvcc: 0,
            has_expiry: false,
            shared: false,
        }
    }

    /// Creates a string object, using the shared pool for small integers.
    pub fn string(data: Bytes) -> Arc<Object> {
        if let Some(n) = parse_i64(&data) {
            if (0..SHARED_INTEGERS).contains(&n) {
                return shared_integer(n);
            }
        }
        Arc::new(Object::new(Value::String(data)))
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        debug_assert!(!self.shared, "mutating a shared immortal object");
        &mut self.value
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn type_name(&self) -> &'static str {
        self.value.type_name()
    }

    pub fn mvcc(&self) -> u64 {
        self.mvcc
    }

    pub fn set_mvcc(&mut self, stamp: u64) {
        debug_assert!(!self.shared, "stamping a shared immortal object");
        self.mvcc = stamp;
    }

    pub fn has_expiry(&self) -> bool {
        self.has_expiry
    }

    pub fn set_has_expiry(&mut self, flag: bool) {
        debug_assert!(!(flag && self.shared), "shared objects cannot carry an expiry");
        self.has_expiry = flag;
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Deep copy with the shared marker cleared, ready for expiry or
    /// MVCC stamping.
    pub fn unshared(&self) -> Object {
        let mut copy = self.clone();
        copy.shared = false;
        copy
    }

    /// Raw 24-bit access field; LFU inheritance on overwrite copies this
    /// from the old object to the new one.
    pub fn access_field(&self) -> u32 {
        self.access.load(Ordering::Relaxed)
    }

    pub fn set_access_field(&self, raw: u32) {
        self.access.store(raw & ACCESS_FIELD_MASK, Ordering::Relaxed);
    }

    /// Updates the access field for a read or write touch. Under an LFU
    /// policy this decays and then logarithmically bumps the counter;
    /// otherwise it refreshes the LRU clock.
    pub fn touch(&self, config: &Config) {
        if config.maxmemory_policy.uses_lfu() {
            let counter = lfu_log_incr(self.lfu_decr_and_return(config), config.lfu_log_factor);
            self.access.store(
                (time::lfu_time_minutes() << 8) | u32::from(counter),
                Ordering::Relaxed,
            );
        } else {
            self.access.store(time::lru_clock(), Ordering::Relaxed);
        }
    }

    /// Current LFU counter after applying time-based decay, without
    /// writing the decayed value back.
    pub fn lfu_decr_and_return(&self, config: &Config) -> u8 {
        let raw = self.access.load(Ordering::Relaxed);
        let ldt = raw >> 8;
        let counter = (raw & 0xff) as u8;
        if config.lfu_decay_time == 0 {
            return counter;
        }
        let periods = lfu_minutes_elapsed(ldt) / config.lfu_decay_time;
        counter.saturating_sub(periods.min(u32::from(counter)) as u8)
    }

    /// Approximate seconds since the last access, for LRU policies.
    pub fn idle_seconds(&self) -> u64 {
        let now = time::lru_clock();
        let then = self.access.load(Ordering::Relaxed) & ACCESS_FIELD_MASK;
        if now >= then {
            u64::from(now - then)
        } else {
            // the 24-bit clock wrapped
            u64::from(now + (ACCESS_FIELD_MASK - then) + 1)
        }
    }
}

/// Minutes elapsed since an LFU decay timestamp, on the wrapping 16-bit
/// minute clock.
fn lfu_minutes_elapsed(ldt: u32) -> u32 {
    let now = time::lfu_time_minutes();
    if now >= ldt {
        now - ldt
    } else {
        0xffff - ldt + now
    }
}

/// Logarithmic counter increment: the probability of a bump shrinks as
/// the counter grows, scaled by the configured log factor.
fn lfu_log_incr(counter: u8, log_factor: u32) -> u8 {
    if counter == u8::MAX {
        return counter;
    }
    let base = u32::from(counter.saturating_sub(LFU_INIT_VAL));
    let p = 1.0 / (base as f64 * f64::from(log_factor) + 1.0);
    if rand::rng().random::<f64>() < p {
        counter + 1
    } else {
        counter
    }
}

/// Returns the pooled shared object for a small non-negative integer.
pub fn shared_integer(n: i64) -> Arc<Object> {
    assert!((0..SHARED_INTEGERS).contains(&n), "integer outside the shared pool");
    static POOL: OnceLock<Vec<Arc<Object>>> = OnceLock::new();
    let pool = POOL.get_or_init(|| {
        (0..SHARED_INTEGERS)
            .map(|i| {
                let mut obj = Object::new(Value::String(Bytes::from(i.to_string())));
                obj.shared = true;
                Arc::new(obj)
            })
            .collect()
    });
    Arc::clone(&pool[n as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_encoding_heuristics() {
        assert_eq!(
            Object::new(Value::String(Bytes::from("123456"))).encoding(),
            Encoding::Int
        );
        assert_eq!(
            Object::new(Value::String(Bytes::from("short"))).encoding(),
            Encoding::Embstr
        );
        let long = "x".repeat(64);
        assert_eq!(
            Object::new(Value::String(Bytes::from(long))).encoding(),
            Encoding::Raw
        );
    }

    #[test]
    fn small_integers_come_from_the_shared_pool() {
        let a = Object::string(Bytes::from("42"));
        let b = Object::string(Bytes::from("42"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_shared());
        assert!(!a.has_expiry());
    }

    #[test]
    fn large_integers_are_not_pooled() {
        let a = Object::string(Bytes::from("999999999"));
        assert!(!a.is_shared());
        assert_eq!(a.encoding(), Encoding::Int);
    }

    #[test]
    fn unshared_copy_clears_the_marker() {
        let pooled = shared_integer(7);
        let copy = pooled.unshared();
        assert!(!copy.is_shared());
        assert_eq!(copy.value(), pooled.value());
        assert_eq!(copy.mvcc(), pooled.mvcc());
    }

    #[test]
    fn lfu_counter_decays_with_elapsed_minutes() {
        let config = Config {
            maxmemory_policy: crate::config::MaxmemoryPolicy::AllKeysLfu,
            lfu_decay_time: 1,
            ..Config::default()
        };
        let obj = Object::new(Value::String(Bytes::from("v")));
        // pretend the last access was 3 minutes ago with counter 10
        let three_ago = (time::lfu_time_minutes().wrapping_sub(3)) & 0xffff;
        obj.set_access_field((three_ago << 8) | 10);
        assert_eq!(obj.lfu_decr_and_return(&config), 7);
    }

    #[test]
    fn lfu_counter_saturates_at_max() {
        assert_eq!(lfu_log_incr(u8::MAX, 10), u8::MAX);
    }

    #[test]
    fn touch_refreshes_lru_clock() {
        let config = Config::default();
        let obj = Object::new(Value::String(Bytes::from("v")));
        obj.set_access_field(1);
        obj.touch(&config);
        assert!(obj.idle_seconds() < 60);
    }
}
