//! Vector clocks for causality tracking between replicas.
//!
//! Every site owns one counter. A replica increments its own counter when it
//! creates an operation and merges (pointwise max) the clock of every remote
//! operation it applies. Comparing two clocks tells whether one event
//! happened before the other or whether they are concurrent.
//!
//! # References
//!
//! Mattern, "Virtual Time and Global States of Distributed Systems" (1989)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of a replica (one per connected user).
pub type SiteId = String;

/// Causal relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// The first clock happened before the second.
    Before,
    /// The first clock happened after the second.
    After,
    /// Neither clock includes the other.
    Concurrent,
    /// Both clocks are identical.
    Equal,
}

/// A map from site id to the highest counter seen for that site.
///
/// Missing entries read as zero, so `{A:1}` and `{A:1, B:0}` compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<SiteId, u64>,
}

impl VectorClock {
    /// Create an empty clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `site`, zero if the site is unknown.
    #[must_use]
    pub fn get(&self, site: &str) -> u64 {
        self.counters.get(site).copied().unwrap_or(0)
    }

    /// Set the counter for `site` unconditionally.
    pub fn set(&mut self, site: impl Into<SiteId>, counter: u64) {
        self.counters.insert(site.into(), counter);
    }

    /// Increment the counter of `site` and return the new value.
    pub fn increment(&mut self, site: &str) -> u64 {
        let counter = self.counters.entry(site.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pointwise maximum with another clock.
    ///
    /// Commutative, associative and idempotent.
    pub fn merge(&mut self, other: &Self) {
        for (site, &counter) in &other.counters {
            let entry = self.counters.entry(site.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// Return the pointwise maximum of `self` and `other`.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Compare two clocks.
    #[must_use]
    pub fn compare(&self, other: &Self) -> CausalOrder {
        let mut self_ge = true;
        let mut other_ge = true;

        for site in self.counters.keys().chain(other.counters.keys()) {
            let mine = self.get(site);
            let theirs = other.get(site);
            if mine < theirs {
                self_ge = false;
            }
            if theirs < mine {
                other_ge = false;
            }
        }

        match (self_ge, other_ge) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (false, false) => CausalOrder::Concurrent,
        }
    }

    /// `true` if every counter of `self` is `>=` the matching counter of
    /// `other` and at least one is strictly greater.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::After
    }

    /// `true` if neither clock dominates the other.
    ///
    /// Identical clocks are reported as concurrent: neither strictly includes
    /// the other.
    #[must_use]
    pub fn is_concurrent_with(&self, other: &Self) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Check whether an operation stamped with `remote` by `origin` can be
    /// applied on top of this (local) clock.
    ///
    /// The origin counter must be exactly one past what is known locally and
    /// no other site may be ahead of local knowledge. Returns the first
    /// violated requirement, or `None` when the operation is ready.
    #[must_use]
    pub fn causal_gap(&self, origin: &str, remote: &Self) -> Option<CausalGap> {
        let known = self.get(origin);
        let required = remote.get(origin);
        if required != known + 1 {
            return Some(CausalGap {
                site: origin.to_string(),
                known,
                required,
            });
        }

        remote
            .counters
            .iter()
            .filter(|(site, _)| site.as_str() != origin)
            .find(|(site, &counter)| counter > self.get(site))
            .map(|(site, &counter)| CausalGap {
                site: site.clone(),
                known: self.get(site),
                required: counter,
            })
    }

    /// Iterate over `(site, counter)` pairs in site order.
    pub fn iter(&self) -> impl Iterator<Item = (&SiteId, &u64)> {
        self.counters.iter()
    }

    /// Number of sites tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// `true` if no site has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl<S: Into<SiteId>> FromIterator<(S, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        Self {
            counters: iter.into_iter().map(|(s, c)| (s.into(), c)).collect(),
        }
    }
}

/// Unmet causal dependency of a remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CausalGap {
    /// Site whose counter does not line up
    pub site: SiteId,
    /// Counter known locally for that site
    pub known: u64,
    /// Counter the operation requires
    pub required: u64,
}

impl std::fmt::Display for CausalGap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "site {} requires {} but local clock knows {}",
            self.site, self.required, self.known
        )
    }
}
