//! Causal registers backing per-field convergence.
//!
//! A [`CausalRegister`] keeps every write that no other recorded write
//! causally dominates. The visible value is the last-write-wins maximum of
//! that frontier, so a causal successor always beats its predecessors and
//! only mutually concurrent writes fall back to the timestamp tie-break.
//! Because the frontier of a set of writes does not depend on the order they
//! were recorded in, neither does the value.

use crate::clock::{SiteId, VectorClock};
use crate::operation::{Fields, OpKind, Operation, OperationId};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Identity and causal position of one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteStamp {
    /// Writing operation
    pub op_id: OperationId,
    /// Origin site of the operation
    pub site_id: SiteId,
    /// Wall-clock milliseconds, tie-break only
    pub timestamp: u64,
    /// Clock of the operation
    pub vector_clock: VectorClock,
}

impl WriteStamp {
    /// Stamp of the writes performed by `op`.
    #[must_use]
    pub fn of(op: &Operation) -> Self {
        Self {
            op_id: op.id.clone(),
            site_id: op.site_id.clone(),
            timestamp: op.timestamp,
            vector_clock: op.vector_clock.clone(),
        }
    }

    /// Same ordering as [`Operation::lww_cmp`].
    #[must_use]
    pub fn lww_cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.site_id.cmp(&other.site_id))
            .then_with(|| self.op_id.cmp(&other.op_id))
    }

    fn supersedes(&self, other: &Self) -> bool {
        self.vector_clock.dominates(&other.vector_clock)
    }
}

/// Frontier of causally-maximal writes to one value.
#[derive(Debug, Clone)]
pub struct CausalRegister<T> {
    frontier: Vec<(WriteStamp, T)>,
}

impl<T> Default for CausalRegister<T> {
    fn default() -> Self {
        Self {
            frontier: Vec::new(),
        }
    }
}

impl<T> CausalRegister<T> {
    /// Record a write.
    ///
    /// Returns `false` if the write was already recorded or a recorded write
    /// dominates it. Otherwise every write it dominates is discarded.
    pub fn write(&mut self, stamp: WriteStamp, value: T) -> bool {
        if self
            .frontier
            .iter()
            .any(|(s, _)| s.op_id == stamp.op_id || s.supersedes(&stamp))
        {
            return false;
        }
        self.frontier.retain(|(s, _)| !stamp.supersedes(s));
        self.frontier.push((stamp, value));
        true
    }

    /// The visible write: last-write-wins maximum of the frontier.
    #[must_use]
    pub fn winner(&self) -> Option<&(WriteStamp, T)> {
        self.frontier.iter().max_by(|a, b| a.0.lww_cmp(&b.0))
    }

    /// Current frontier, unordered.
    pub fn frontier(&self) -> impl Iterator<Item = &(WriteStamp, T)> {
        self.frontier.iter()
    }

    /// `true` if nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frontier.is_empty()
    }
}

/// Causal write history of one entity.
///
/// An `add` writes every field: the fields it carries get its values and
/// all others are erased. Updates and moves write only their own fields.
#[derive(Debug, Clone, Default)]
pub struct EntityRegisters {
    adds: CausalRegister<Fields>,
    fields: BTreeMap<String, CausalRegister<serde_json::Value>>,
}

impl EntityRegisters {
    /// Record the writes of an add, update or move. Returns the field keys
    /// whose value may have changed.
    pub fn record(&mut self, op: &Operation) -> BTreeSet<String> {
        let stamp = WriteStamp::of(op);
        match op.kind {
            OpKind::Add => {
                self.adds.write(stamp, op.payload.fields.clone());
                self.keys()
            }
            OpKind::Update | OpKind::Move => {
                let written = op.written_fields();
                let keys = written.keys().cloned().collect();
                for (key, value) in written {
                    self.fields
                        .entry(key)
                        .or_default()
                        .write(stamp.clone(), value);
                }
                keys
            }
            OpKind::Delete => BTreeSet::new(),
        }
    }

    /// Every key any recorded write touched.
    #[must_use]
    pub fn keys(&self) -> BTreeSet<String> {
        self.fields
            .keys()
            .cloned()
            .chain(self.adds.frontier().flat_map(|(_, f)| f.keys().cloned()))
            .collect()
    }

    /// `true` once an add has been recorded.
    #[must_use]
    pub fn has_add(&self) -> bool {
        !self.adds.is_empty()
    }

    /// Value of `key` decided by its writes.
    ///
    /// `None` if nothing wrote the key, `Some(None)` if the winning write
    /// erased it.
    #[must_use]
    pub fn resolve(&self, key: &str) -> Option<Option<&serde_json::Value>> {
        let mut candidates: Vec<(&WriteStamp, Option<&serde_json::Value>)> = self
            .adds
            .frontier()
            .map(|(stamp, fields)| (stamp, fields.get(key)))
            .collect();
        if let Some(register) = self.fields.get(key) {
            candidates.extend(register.frontier().map(|(stamp, value)| (stamp, Some(value))));
        }

        candidates
            .iter()
            .filter(|(stamp, _)| !candidates.iter().any(|(other, _)| other.supersedes(stamp)))
            .max_by(|a, b| a.0.lww_cmp(b.0))
            .map(|&(_, value)| value)
    }
}
