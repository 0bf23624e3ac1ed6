//! Clock utilities: wall-clock milliseconds, the coarse LRU clock, and
//! the process-monotonic MVCC stamp generator.
//!
//! Expiry deadlines are absolute wall-clock milliseconds so they survive
//! replication between hosts. The MVCC stamp packs the millisecond clock
//! into the high bits and a per-millisecond counter into the low bits,
//! which keeps stamps monotonic even when many writes land in the same
//! millisecond.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Bits reserved for the sub-millisecond counter in an MVCC stamp.
pub const MVCC_INCR_BITS: u32 = 20;

/// Returns the current wall-clock time in milliseconds since the epoch.
#[inline]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Coarse clock for the LRU field: unix seconds truncated to 24 bits.
#[inline]
pub fn lru_clock() -> u32 {
    ((now_ms() / 1000) as u64 & 0x00ff_ffff) as u32
}

/// Minute-resolution clock for LFU decay, truncated to 16 bits.
#[inline]
pub fn lfu_time_minutes() -> u32 {
    ((now_ms() / 60_000) as u64 & 0xffff) as u32
}

static MVCC_CLOCK: AtomicU64 = AtomicU64::new(0);

/// Returns the next MVCC stamp: strictly greater than every stamp handed
/// out before it in this process.
pub fn next_mvcc_stamp() -> u64 {
    let floor = (now_ms() as u64) << MVCC_INCR_BITS;
    let mut prev = MVCC_CLOCK.load(Ordering::Relaxed);
    loop {
        let next = floor.max(prev + 1);
        match MVCC_CLOCK.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => prev = observed,
        }
    }
}

/// Returns the most recently issued MVCC stamp without advancing the clock.
#[inline]
pub fn current_mvcc_stamp() -> u64 {
    MVCC_CLOCK.load(Ordering::Relaxed)
}
