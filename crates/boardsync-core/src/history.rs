//! Operation history containers.
//!
//! - [`OperationLog`]: append-only, deduplicated record of every operation a
//!   replica has applied. Only delete history is ever pruned.
//! - [`RingLog`]: fixed-capacity overwrite buffer used for the transformer's
//!   committed history.

use crate::operation::{OpKind, Operation};
use std::collections::HashSet;

/// Append-only, deduplicated operation history of one replica.
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    entries: Vec<Operation>,
    ids: HashSet<String>,
}

impl OperationLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if an operation with this id has been recorded.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Append an operation.
    ///
    /// Returns `false` (and leaves the log untouched) if the id is already
    /// present.
    pub fn append(&mut self, op: Operation) -> bool {
        if !self.ids.insert(op.id.clone()) {
            return false;
        }
        self.entries.push(op);
        true
    }

    /// Look up an operation by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Operation> {
        if !self.contains(id) {
            return None;
        }
        self.entries.iter().find(|op| op.id == id)
    }

    /// Operations targeting `entity_id`, in append order.
    pub fn for_entity<'a>(&'a self, entity_id: &'a str) -> impl Iterator<Item = &'a Operation> {
        self.entries
            .iter()
            .filter(move |op| op.entity_id() == entity_id)
    }

    /// Remove delete operations whose timestamp is more than `min_age_ms`
    /// older than `now_ms`. Every other kind is retained regardless of age.
    ///
    /// Returns the number of pruned entries.
    pub fn prune_deletes(&mut self, now_ms: u64, min_age_ms: u64) -> usize {
        let before = self.entries.len();
        let ids = &mut self.ids;
        self.entries.retain(|op| {
            let expired =
                op.kind == OpKind::Delete && now_ms.saturating_sub(op.timestamp) > min_age_ms;
            if expired {
                ids.remove(&op.id);
            }
            !expired
        });
        before - self.entries.len()
    }

    /// Iterate in append order.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter()
    }

    /// Number of recorded operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Fixed-capacity ring buffer; pushing into a full buffer overwrites the
/// oldest entry.
#[derive(Debug, Clone)]
pub struct RingLog<T> {
    slots: Vec<T>,
    capacity: usize,
    /// Index of the oldest entry once the buffer is full
    head: usize,
}

impl<T> RingLog<T> {
    /// Create an empty buffer holding at most `capacity` entries.
    ///
    /// A capacity of zero is treated as one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        }
    }

    /// Append an entry, returning the evicted one if the buffer was full.
    pub fn push(&mut self, value: T) -> Option<T> {
        if self.slots.len() < self.capacity {
            self.slots.push(value);
            return None;
        }
        let evicted = std::mem::replace(&mut self.slots[self.head], value);
        self.head = (self.head + 1) % self.capacity;
        Some(evicted)
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let (newer, older) = self.slots.split_at(self.head);
        older.iter().chain(newer.iter())
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// `true` if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Payload;

    fn op(site: &str, seq: u64, kind: OpKind, timestamp: u64) -> Operation {
        Operation {
            id: Operation::make_id(site, seq),
            site_id: site.to_string(),
            kind,
            payload: Payload::new("obj1"),
            timestamp,
            vector_clock: [(site, seq)].into_iter().collect(),
            parent_id: None,
        }
    }

    #[test]
    fn log_deduplicates_by_id() {
        let mut log = OperationLog::new();
        assert!(log.append(op("A", 1, OpKind::Add, 10)));
        assert!(!log.append(op("A", 1, OpKind::Add, 10)));
        assert_eq!(log.len(), 1);
        assert!(log.contains("A-1"));
        assert!(log.get("A-1").is_some());
    }

    #[test]
    fn prune_only_removes_old_deletes() {
        let mut log = OperationLog::new();
        log.append(op("A", 1, OpKind::Add, 0));
        log.append(op("A", 2, OpKind::Delete, 0));
        log.append(op("A", 3, OpKind::Delete, 950));
        log.append(op("A", 4, OpKind::Update, 0));

        assert_eq!(log.prune_deletes(1_000, 100), 1);
        assert!(!log.contains("A-2"));
        assert!(log.contains("A-1"));
        assert!(log.contains("A-3"));
        assert!(log.contains("A-4"));
    }

    #[test]
    fn ring_log_evicts_oldest() {
        let mut ring = RingLog::with_capacity(3);
        for i in 0..3 {
            assert!(ring.push(i).is_none());
        }
        assert_eq!(ring.push(3), Some(0));
        assert_eq!(ring.push(4), Some(1));
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.capacity(), 3);
    }
}
