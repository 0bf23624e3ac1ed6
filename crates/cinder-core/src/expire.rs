//! The expiry index: deadlines for whole keys and for subkeys of
//! compound values.
//!
//! The index is an ordered map keyed by the same `Bytes` allocation the
//! keyspace owns, so a key's bytes exist once no matter how many sides
//! reference them. An entry is either a single whole-key deadline or a
//! "fat" entry carrying (subkey, deadline) pairs; the pair with no
//! subkey is the whole-key deadline.
//!
//! Consistency with the keyspace is the caller's job: the `has_expiry`
//! flag on a value object is true iff this index holds an entry for the
//! key, and the two sides are always mutated together.

use std::collections::BTreeMap;

use bytes::Bytes;
use smallvec::{smallvec, SmallVec};

/// One (subkey, deadline) pair inside a fat entry. `subkey == None`
/// denotes the whole-key deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubkeyExpire {
    pub subkey: Option<Bytes>,
    pub when_ms: i64,
}

/// Deadline state for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpireEntry {
    /// The common case: one deadline for the whole key.
    Whole(i64),
    /// Per-subkey deadlines, kept sorted by deadline.
    Fat(SmallVec<[SubkeyExpire; 2]>),
}

impl ExpireEntry {
    /// Creates an entry for a single (subkey, deadline) pair.
    pub fn new(subkey: Option<Bytes>, when_ms: i64) -> Self {
        match subkey {
            None => ExpireEntry::Whole(when_ms),
            Some(sub) => ExpireEntry::Fat(smallvec![SubkeyExpire {
                subkey: Some(sub),
                when_ms,
            }]),
        }
    }

    /// The whole-key deadline, if one is set.
    pub fn whole_when(&self) -> Option<i64> {
        match self {
            ExpireEntry::Whole(when) => Some(*when),
            ExpireEntry::Fat(subs) => subs
                .iter()
                .find(|s| s.subkey.is_none())
                .map(|s| s.when_ms),
        }
    }

    /// Inserts or replaces the deadline for one subkey (or the whole
    /// key), promoting to the fat form when needed.
    pub fn update(&mut self, subkey: Option<Bytes>, when_ms: i64) {
        match self {
            ExpireEntry::Whole(when) if subkey.is_none() => *when = when_ms,
            ExpireEntry::Whole(when) => {
                let mut subs: SmallVec<[SubkeyExpire; 2]> = smallvec![SubkeyExpire {
                    subkey: None,
                    when_ms: *when,
                }];
                insert_sorted(&mut subs, SubkeyExpire { subkey, when_ms });
                *self = ExpireEntry::Fat(subs);
            }
            ExpireEntry::Fat(subs) => {
                subs.retain(|s| s.subkey != subkey);
                insert_sorted(subs, SubkeyExpire { subkey, when_ms });
            }
        }
    }

    /// Removes the deadline for one subkey. Returns `true` if it was
    /// present. The entry may be left empty; the caller is responsible
    /// for dropping empty entries from the index.
    pub fn remove_subkey(&mut self, subkey: &[u8]) -> bool {
        match self {
            ExpireEntry::Whole(_) => false,
            ExpireEntry::Fat(subs) => {
                let before = subs.len();
                subs.retain(|s| s.subkey.as_deref() != Some(subkey));
                subs.len() != before
            }
        }
    }

    /// Whether this entry carries per-subkey deadlines.
    pub fn is_fat(&self) -> bool {
        matches!(self, ExpireEntry::Fat(_))
    }

    /// Number of (subkey, deadline) pairs.
    pub fn len(&self) -> usize {
        match self {
            ExpireEntry::Whole(_) => 1,
            ExpireEntry::Fat(subs) => subs.len(),
        }
    }

    /// Returns `true` when no pairs remain (only possible for fat
    /// entries after subkey removal).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates (subkey, deadline) pairs in deadline order.
    pub fn iter(&self) -> ExpireEntryIter<'_> {
        match self {
            ExpireEntry::Whole(when) => ExpireEntryIter::Whole(Some(*when)),
            ExpireEntry::Fat(subs) => ExpireEntryIter::Fat(subs.iter()),
        }
    }
}

fn insert_sorted(subs: &mut SmallVec<[SubkeyExpire; 2]>, entry: SubkeyExpire) {
    let pos = subs.partition_point(|s| s.when_ms <= entry.when_ms);
    subs.insert(pos, entry);
}

/// Iterator over the (subkey, deadline) pairs of one entry.
pub enum ExpireEntryIter<'a> {
    Whole(Option<i64>),
    Fat(std::slice::Iter<'a, SubkeyExpire>),
}

impl<'a> Iterator for ExpireEntryIter<'a> {
    type Item = (Option<&'a Bytes>, i64);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            ExpireEntryIter::Whole(when) => when.take().map(|w| (None, w)),
            ExpireEntryIter::Fat(iter) => iter.next().map(|s| (s.subkey.as_ref(), s.when_ms)),
        }
    }
}

/// The per-database expiry index.
#[derive(Debug, Default)]
pub struct ExpireIndex {
    entries: BTreeMap<Bytes, ExpireEntry>,
}

impl ExpireIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or replaces the entry for a key. The caller passes the
    /// keyspace-owned `Bytes` so the allocation is shared.
    pub fn insert(&mut self, key: Bytes, entry: ExpireEntry) {
        self.entries.insert(key, entry);
    }

    pub fn get(&self, key: &[u8]) -> Option<&ExpireEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut ExpireEntry> {
        self.entries.get_mut(key)
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<ExpireEntry> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &ExpireEntry)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.entries.keys()
    }
}
