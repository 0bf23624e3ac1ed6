//! Stream payload: an append-only log of id-stamped field/value entries.
//!
//! Only the storage shape lives here. Consumer groups, blocking reads
//! and the XADD/XRANGE family are implemented by the stream command
//! layer, which is external to the keyspace engine.

use std::collections::BTreeMap;

use bytes::Bytes;

/// A stream entry id: millisecond timestamp plus a sequence number to
/// disambiguate entries within the same millisecond.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    /// The smallest id strictly greater than `self`.
    pub fn next(self) -> Self {
        if self.seq == u64::MAX {
            Self { ms: self.ms + 1, seq: 0 }
        } else {
            Self { ms: self.ms, seq: self.seq + 1 }
        }
    }
}

/// An append-only stream of entries ordered by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stream {
    entries: BTreeMap<StreamId, Vec<(Bytes, Bytes)>>,
    /// Highest id ever appended, kept even after trims so ids never
    /// regress.
    last_id: StreamId,
}

impl Stream {
    /// Creates an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry with an auto-generated id and returns that id.
    pub fn append(&mut self, now_ms: u64, fields: Vec<(Bytes, Bytes)>) -> StreamId {
        let id = if now_ms > self.last_id.ms {
            StreamId { ms: now_ms, seq: 0 }
        } else {
            self.last_id.next()
        };
        self.entries.insert(id, fields);
        self.last_id = id;
        id
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the stream holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest id ever appended.
    pub fn last_id(&self) -> StreamId {
        self.last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_within_one_millisecond() {
        let mut s = Stream::new();
        let a = s.append(5, vec![]);
        let b = s.append(5, vec![]);
        let c = s.append(4, vec![]); // clock went backwards
        assert!(a < b);
        assert!(b < c);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn last_id_survives_clock_skew() {
        let mut s = Stream::new();
        s.append(100, vec![]);
        s.append(50, vec![]);
        assert_eq!(s.last_id().ms, 100);
        assert_eq!(s.last_id().seq, 1);
    }
}
