//! Conflict resolution for concurrent operations on the same entity.
//!
//! # Precedence
//!
//! | Rank | Strategy | Applies when |
//! |------|----------|--------------|
//! | 1 | `causal-ordering` | exactly one operation causally dominates all others |
//! | 2 | `delete-wins` | any operation is a delete (latest delete wins) |
//! | 3 | `merge-non-conflicting` | all operations are updates or moves (per-field LWW) |
//! | 4 | `last-write-wins` | anything else (whole-operation LWW) |
//!
//! Every timestamp comparison goes through [`Operation::lww_cmp`], so equal
//! timestamps are broken by site id and all replicas pick the same winner.

use crate::clock::SiteId;
use crate::operation::{now_ms, EntityId, OpKind, Operation, Payload};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// How a set of concurrent operations was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// One operation happened after all others
    CausalOrdering,
    /// The latest delete beat every concurrent edit
    DeleteWins,
    /// Field maps of concurrent updates were unioned
    MergeNonConflicting,
    /// Latest operation by timestamp won outright
    LastWriteWins,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::CausalOrdering => write!(f, "causal-ordering"),
            Strategy::DeleteWins => write!(f, "delete-wins"),
            Strategy::MergeNonConflicting => write!(f, "merge-non-conflicting"),
            Strategy::LastWriteWins => write!(f, "last-write-wins"),
        }
    }
}

/// Result of [`resolve`].
///
/// Exactly one of `winner` and `merged` is set for a non-empty input.
/// `strategy` is `None` when there was nothing to resolve (zero or one
/// operation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    /// Operation chosen as-is
    pub winner: Option<Operation>,
    /// Synthetic operation combining several inputs
    pub merged: Option<Operation>,
    /// Strategy that produced the outcome
    pub strategy: Option<Strategy>,
    /// Losing operations, kept for last-write-wins audit
    pub conflicts: Vec<Operation>,
}

impl ConflictResolution {
    fn empty() -> Self {
        Self {
            winner: None,
            merged: None,
            strategy: None,
            conflicts: Vec::new(),
        }
    }

    fn winner(op: Operation, strategy: Option<Strategy>) -> Self {
        Self {
            winner: Some(op),
            strategy,
            ..Self::empty()
        }
    }

    /// The operation that should take effect, if any.
    #[must_use]
    pub fn outcome(&self) -> Option<&Operation> {
        self.merged.as_ref().or(self.winner.as_ref())
    }
}

/// Resolve a set of operations targeting one entity.
#[must_use]
pub fn resolve(ops: &[Operation]) -> ConflictResolution {
    match ops {
        [] => return ConflictResolution::empty(),
        [op] => return ConflictResolution::winner(op.clone(), None),
        _ => {}
    }

    if let Some(op) = causal_winner(ops) {
        return ConflictResolution::winner(op.clone(), Some(Strategy::CausalOrdering));
    }

    if let Some(op) = ops
        .iter()
        .filter(|op| op.kind == OpKind::Delete)
        .max_by(|a, b| a.lww_cmp(b))
    {
        return ConflictResolution::winner(op.clone(), Some(Strategy::DeleteWins));
    }

    if ops.iter().all(|op| op.kind.is_field_edit()) {
        return ConflictResolution {
            merged: Some(merge_fields(ops)),
            strategy: Some(Strategy::MergeNonConflicting),
            ..ConflictResolution::empty()
        };
    }

    let mut sorted: Vec<&Operation> = ops.iter().collect();
    sorted.sort_by(|a, b| a.lww_cmp(b));
    let mut conflicts: Vec<Operation> = sorted.into_iter().cloned().collect();
    let Some(winner) = conflicts.pop() else {
        return ConflictResolution::empty();
    };

    ConflictResolution {
        winner: Some(winner),
        strategy: Some(Strategy::LastWriteWins),
        conflicts,
        merged: None,
    }
}

/// The single operation whose clock dominates every other clock in `ops`.
fn causal_winner(ops: &[Operation]) -> Option<&Operation> {
    let mut dominating = ops.iter().enumerate().filter(|(i, op)| {
        ops.iter()
            .enumerate()
            .all(|(j, other)| *i == j || op.vector_clock.dominates(&other.vector_clock))
    });
    match (dominating.next(), dominating.next()) {
        (Some((_, op)), None) => Some(op),
        _ => None,
    }
}

/// Union the fields of concurrent updates, latest writer per field.
fn merge_fields(ops: &[Operation]) -> Operation {
    let mut sorted: Vec<&Operation> = ops.iter().collect();
    sorted.sort_by(|a, b| a.lww_cmp(b));

    let latest = sorted[sorted.len() - 1];
    let mut payload = Payload::new(latest.entity_id());
    let mut vector_clock = latest.vector_clock.clone();
    for op in &sorted {
        payload.fields.extend(op.written_fields());
        vector_clock.merge(&op.vector_clock);
    }

    let kind = if sorted.iter().all(|op| op.kind == OpKind::Move) {
        OpKind::Move
    } else {
        OpKind::Update
    };

    Operation {
        id: format!("merged-{}", latest.id),
        site_id: latest.site_id.clone(),
        kind,
        payload,
        timestamp: latest.timestamp,
        vector_clock,
        parent_id: None,
    }
}

/// Classification of a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// Concurrent edits of the same kind family
    ConcurrentUpdate,
    /// A delete raced with a non-delete edit
    DeleteUpdate,
    /// Whole-state merge found disagreeing field values
    DivergentStates,
}

/// Event surfaced to the UI when a conflict was resolved automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictNotification {
    /// Unique notification id
    pub id: String,
    /// Conflict classification
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    /// Sites whose edits were involved, sorted
    pub affected_users: Vec<SiteId>,
    /// Entities involved, sorted
    pub affected_entities: Vec<EntityId>,
    /// Applied resolution; `None` for whole-state divergence
    pub resolution: Option<ConflictResolution>,
    /// Wall-clock milliseconds at detection
    pub detected_at: u64,
}

impl ConflictNotification {
    /// Build a notification with a fresh id.
    #[must_use]
    pub fn new(
        kind: ConflictKind,
        affected_users: impl IntoIterator<Item = SiteId>,
        affected_entities: impl IntoIterator<Item = EntityId>,
        resolution: Option<ConflictResolution>,
    ) -> Self {
        let users: BTreeSet<SiteId> = affected_users.into_iter().collect();
        let entities: BTreeSet<EntityId> = affected_entities.into_iter().collect();
        Self {
            id: format!("conflict-{}", Uuid::new_v4()),
            kind,
            affected_users: users.into_iter().collect(),
            affected_entities: entities.into_iter().collect(),
            resolution,
            detected_at: now_ms(),
        }
    }

    /// Build the notification for a mutually concurrent set of operations.
    #[must_use]
    pub fn for_concurrent(ops: &[Operation]) -> Self {
        let has_delete = ops.iter().any(|op| op.kind == OpKind::Delete);
        let has_edit = ops.iter().any(|op| op.kind != OpKind::Delete);
        let kind = if has_delete && has_edit {
            ConflictKind::DeleteUpdate
        } else {
            ConflictKind::ConcurrentUpdate
        };
        Self::new(
            kind,
            ops.iter().map(|op| op.site_id.clone()),
            ops.iter().map(|op| op.payload.entity_id.clone()),
            Some(resolve(ops)),
        )
    }
}

/// Find conflicts among `ops`.
///
/// Operations are grouped by target entity; each group yields at most one
/// notification, for its largest subset of mutually concurrent operations.
#[must_use]
pub fn detect_conflicts(ops: &[Operation]) -> Vec<ConflictNotification> {
    let mut groups: BTreeMap<&str, Vec<&Operation>> = BTreeMap::new();
    for op in ops {
        groups.entry(op.entity_id()).or_default().push(op);
    }

    let mut notifications = Vec::new();
    for (entity_id, group) in groups {
        if group.len() < 2 {
            continue;
        }
        let concurrent = largest_concurrent_subset(&group);
        if concurrent.len() < 2 {
            continue;
        }
        let notification = ConflictNotification::for_concurrent(&concurrent);
        tracing::info!(
            entity_id,
            kind = ?notification.kind,
            users = ?notification.affected_users,
            strategy = ?notification.resolution.as_ref().and_then(|r| r.strategy),
            "Detected conflict"
        );
        notifications.push(notification);
    }
    notifications
}

/// Largest subset (in input order) whose members are pairwise concurrent.
///
/// Greedy from every seed; groups are small bursts of edits to one entity.
fn largest_concurrent_subset(group: &[&Operation]) -> Vec<Operation> {
    let mut best: Vec<usize> = Vec::new();
    for seed in 0..group.len() {
        let mut members = vec![seed];
        for candidate in (0..group.len()).filter(|&c| c != seed) {
            let fits = members.iter().all(|&m| {
                group[m]
                    .vector_clock
                    .is_concurrent_with(&group[candidate].vector_clock)
            });
            if fits {
                members.push(candidate);
            }
        }
        if members.len() > best.len() {
            best = members;
        }
    }
    best.sort_unstable();
    best.into_iter().map(|i| group[i].clone()).collect()
}
