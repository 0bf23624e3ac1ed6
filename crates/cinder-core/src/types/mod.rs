//! Concrete value payloads for the six supported data types.
//!
//! The key-level engine treats these as opaque cargo: it installs,
//! replaces and releases whole values, and only ever looks at their type
//! tag, their element count, and (for per-subkey expiry) their members.
//! The full per-type command families live in the command layers above.

pub mod sorted_set;
pub mod stream;

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;

use sorted_set::SortedSet;
use stream::Stream;

/// A stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Binary-safe string. `Bytes` gives cheap cloning and zero-copy
    /// slicing.
    String(Bytes),
    /// Ordered list with O(1) push/pop at both ends.
    List(VecDeque<Bytes>),
    /// Unordered set of unique members.
    Set(AHashSet<Bytes>),
    /// Field → value map.
    Hash(AHashMap<Bytes, Bytes>),
    /// Members ordered by (score, member).
    SortedSet(SortedSet),
    /// Append-only log of id-stamped entries.
    Stream(Stream),
}

impl Value {
    /// Type name as reported by the TYPE command.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
            Value::SortedSet(_) => "zset",
            Value::Stream(_) => "stream",
        }
    }

    /// Number of elements (1 for strings).
    pub fn len(&self) -> usize {
        match self {
            Value::String(_) => 1,
            Value::List(l) => l.len(),
            Value::Set(s) => s.len(),
            Value::Hash(h) => h.len(),
            Value::SortedSet(z) => z.len(),
            Value::Stream(s) => s.len(),
        }
    }

    /// Returns `true` for container values with no elements.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::String(_) => false,
            _ => self.len() == 0,
        }
    }

    /// Whether a freshly created value of this type can satisfy a
    /// blocked waiter (lists and sorted sets have blocking pop commands).
    pub fn can_wake_blocked(&self) -> bool {
        matches!(self, Value::List(_) | Value::SortedSet(_) | Value::Stream(_))
    }
}
