//! Sorted set payload: dual-indexed by score and member.
//!
//! Members are ordered by (score, member) — ties in score are broken by
//! the member bytes, matching Redis semantics. A `BTreeMap` keyed by
//! `(OrderedFloat<f64>, member)` provides ordered iteration and a
//! `HashMap` provides O(1) member→score lookups; this is simpler and
//! more obviously correct than a hand-rolled skip list.

use std::collections::BTreeMap;

use ahash::AHashMap;
use bytes::Bytes;
use ordered_float::OrderedFloat;

/// A set of unique binary members, each with a floating-point score.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedSet {
    /// Score→member index for ordered iteration.
    tree: BTreeMap<(OrderedFloat<f64>, Bytes), ()>,
    /// Member→score index for O(1) lookups.
    scores: AHashMap<Bytes, OrderedFloat<f64>>,
}

impl SortedSet {
    /// Creates an empty sorted set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member or updates its score. Returns `true` if the member
    /// was newly added.
    pub fn add(&mut self, member: Bytes, score: f64) -> bool {
        let score = OrderedFloat(score);
        match self.scores.insert(member.clone(), score) {
            Some(old) => {
                if old != score {
                    self.tree.remove(&(old, member.clone()));
                    self.tree.insert((score, member), ());
                }
                false
            }
            None => {
                self.tree.insert((score, member), ());
                true
            }
        }
    }

    /// Removes a member. Returns `true` if it was present.
    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.tree.remove(&(score, Bytes::copy_from_slice(member)));
                true
            }
            None => false,
        }
    }

    /// Returns the score of a member.
    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).map(|s| s.0)
    }

    /// Returns the 0-based rank of a member in (score, member) order.
    pub fn rank(&self, member: &[u8]) -> Option<usize> {
        let score = *self.scores.get(member)?;
        Some(
            self.tree
                .range(..(score, Bytes::copy_from_slice(member)))
                .count(),
        )
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Returns `true` if the set has no members.
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Iterates members in (score, member) order.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, f64)> {
        self.tree.keys().map(|(score, member)| (member, score.0))
    }
}
