//! Per-site replica state store.
//!
//! A [`Replica`] owns the materialized board ([`ReplicaState`]), the causal
//! operation log and the queue of conflict notifications. Local edits are
//! applied optimistically; remote operations pass a dedup check and a strict
//! per-origin FIFO readiness check before they touch state.
//!
//! Every add, update and move is recorded in per-field [`EntityRegisters`],
//! and the visible fields are read back from them. A write that causally
//! follows another always wins; concurrent writes are ordered by
//! [`Operation::lww_cmp`]. Deletes tombstone the entity for good.
//!
//! Remote operations that fail the readiness check are dropped, not
//! buffered. The caller is expected to resync with [`Replica::merge_remote`].

use crate::clock::{CausalGap, SiteId, VectorClock};
use crate::history::OperationLog;
use crate::operation::{now_ms, EntityId, Fields, OpKind, Operation, OperationId, Payload};
use crate::register::EntityRegisters;
use crate::resolver::{detect_conflicts, ConflictKind, ConflictNotification, Strategy};
use crate::transform::{Edit, OperationTransformer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Materialized view of one site.
///
/// Invariant: an id in `tombstones` is never a key of `objects`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaState {
    /// Owning site
    pub site_id: SiteId,
    /// Live entities
    pub objects: BTreeMap<EntityId, Fields>,
    /// Highest counter seen per site
    pub vector_clock: VectorClock,
    /// Permanently deleted entities
    pub tombstones: BTreeSet<EntityId>,
}

impl ReplicaState {
    /// Empty state for `site_id`.
    #[must_use]
    pub fn new(site_id: impl Into<SiteId>) -> Self {
        Self {
            site_id: site_id.into(),
            objects: BTreeMap::new(),
            vector_clock: VectorClock::new(),
            tombstones: BTreeSet::new(),
        }
    }

    /// Current fields of a live entity.
    #[must_use]
    pub fn get(&self, entity_id: &str) -> Option<&Fields> {
        self.objects.get(entity_id)
    }

    /// `true` if the entity has been deleted.
    #[must_use]
    pub fn is_tombstoned(&self, entity_id: &str) -> bool {
        self.tombstones.contains(entity_id)
    }

    /// Apply the per-kind effect of an operation. Returns `true` if state
    /// changed.
    pub fn apply(&mut self, op: &Operation) -> bool {
        let entity_id = op.entity_id();
        match op.kind {
            OpKind::Add => {
                if self.is_tombstoned(entity_id) {
                    return false;
                }
                self.objects
                    .insert(entity_id.to_string(), op.payload.fields.clone());
                true
            }
            OpKind::Update | OpKind::Move => self.write_fields(entity_id, op.written_fields()),
            OpKind::Delete => {
                let removed = self.objects.remove(entity_id).is_some();
                let inserted = self.tombstones.insert(entity_id.to_string());
                removed || inserted
            }
        }
    }

    /// Shallow-merge `fields` into a live entity.
    fn write_fields(&mut self, entity_id: &str, fields: Fields) -> bool {
        match self.objects.get_mut(entity_id) {
            Some(object) if !fields.is_empty() => {
                object.extend(fields);
                true
            }
            _ => false,
        }
    }
}

/// Reconcile two full states.
///
/// Tombstones are unioned and win over live objects. Entities present on
/// both sides have their field maps merged recursively; on overlapping keys
/// `remote` wins. Clocks are merged pointwise. The result keeps `local`'s
/// site id.
#[must_use]
pub fn merge_states(local: &ReplicaState, remote: &ReplicaState) -> ReplicaState {
    let tombstones: BTreeSet<EntityId> = local.tombstones.union(&remote.tombstones).cloned().collect();

    let mut objects = BTreeMap::new();
    let ids: BTreeSet<&EntityId> = local.objects.keys().chain(remote.objects.keys()).collect();
    for id in ids {
        if tombstones.contains(id) {
            continue;
        }
        let fields = match (local.objects.get(id), remote.objects.get(id)) {
            (Some(l), Some(r)) => merge_field_maps(l, r),
            (Some(only), None) | (None, Some(only)) => only.clone(),
            (None, None) => continue,
        };
        objects.insert(id.clone(), fields);
    }

    ReplicaState {
        site_id: local.site_id.clone(),
        objects,
        vector_clock: local.vector_clock.merged(&remote.vector_clock),
        tombstones,
    }
}

fn merge_field_maps(local: &Fields, remote: &Fields) -> Fields {
    let mut merged = local.clone();
    for (key, value) in remote {
        let combined = match (merged.get(key), value) {
            (Some(serde_json::Value::Object(l)), serde_json::Value::Object(r)) => {
                let l: Fields = l.clone().into_iter().collect();
                let r: Fields = r.clone().into_iter().collect();
                serde_json::Value::Object(merge_field_maps(&l, &r).into_iter().collect())
            }
            _ => value.clone(),
        };
        merged.insert(key.clone(), combined);
    }
    merged
}

/// Entities whose overlapping top-level fields disagree between two states.
fn divergent_entities(local: &ReplicaState, remote: &ReplicaState) -> Vec<EntityId> {
    local
        .objects
        .iter()
        .filter_map(|(id, l)| {
            let r = remote.objects.get(id)?;
            l.iter()
                .any(|(k, v)| r.get(k).is_some_and(|rv| rv != v))
                .then(|| id.clone())
        })
        .collect()
}

/// Successful outcome of [`Replica::apply_remote_operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// No concurrent history touched the entity
    Clean,
    /// Concurrent edits existed; the rule that decided the operation's effect
    Resolved(Strategy),
}

/// Reasons a remote operation is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// Already applied or covered by the local clock; an idempotent no-op
    /// for the caller
    #[error("duplicate operation {id}")]
    DuplicateOperation {
        /// Operation id
        id: OperationId,
    },
    /// Dependencies unmet; the operation was dropped and a resync is due
    #[error("operation {id} not causally ready: {gap}")]
    NotCausallyReady {
        /// Operation id
        id: OperationId,
        /// First unmet requirement
        gap: CausalGap,
    },
}

/// One logical replica of the board.
///
/// Not internally synchronized: confine each replica to one task or wrap it
/// in a mutex.
#[derive(Debug, Clone)]
pub struct Replica {
    state: ReplicaState,
    history: OperationLog,
    registers: BTreeMap<EntityId, EntityRegisters>,
    notifications: Vec<ConflictNotification>,
}

impl Replica {
    /// Create an empty replica for `site_id`.
    #[must_use]
    pub fn new(site_id: impl Into<SiteId>) -> Self {
        Self::from_state(ReplicaState::new(site_id))
    }

    /// Resume from a snapshot. History starts empty.
    #[must_use]
    pub fn from_state(state: ReplicaState) -> Self {
        Self {
            state,
            history: OperationLog::new(),
            registers: BTreeMap::new(),
            notifications: Vec::new(),
        }
    }

    /// Local site id.
    #[must_use]
    pub fn site_id(&self) -> &str {
        &self.state.site_id
    }

    /// Materialized state.
    #[must_use]
    pub fn state(&self) -> &ReplicaState {
        &self.state
    }

    /// Local vector clock.
    #[must_use]
    pub fn vector_clock(&self) -> &VectorClock {
        &self.state.vector_clock
    }

    /// Applied operation history.
    #[must_use]
    pub fn history(&self) -> &OperationLog {
        &self.history
    }

    /// Copy of an entity's current fields, for transformer pre-images.
    #[must_use]
    pub fn snapshot_fields(&self, entity_id: &str) -> Option<Fields> {
        self.state.get(entity_id).cloned()
    }

    /// Drain queued conflict notifications.
    pub fn take_notifications(&mut self) -> Vec<ConflictNotification> {
        std::mem::take(&mut self.notifications)
    }

    /// Create a local operation, apply it immediately and record it.
    ///
    /// The returned operation must be broadcast by the transport.
    pub fn create_operation(&mut self, kind: OpKind, payload: Payload) -> Operation {
        self.create_operation_after(kind, payload, None)
    }

    /// Like [`Replica::create_operation`] with an explicit causal predecessor.
    pub fn create_operation_after(
        &mut self,
        kind: OpKind,
        payload: Payload,
        parent_id: Option<OperationId>,
    ) -> Operation {
        let sequence = self.state.vector_clock.increment(&self.state.site_id);
        let op = Operation {
            id: Operation::make_id(&self.state.site_id, sequence),
            site_id: self.state.site_id.clone(),
            kind,
            payload,
            timestamp: now_ms(),
            vector_clock: self.state.vector_clock.clone(),
            parent_id,
        };

        self.integrate(&op, &[]);
        self.history.append(op.clone());
        tracing::debug!(
            site_id = %op.site_id,
            op_id = %op.id,
            kind = %op.kind,
            entity_id = op.entity_id(),
            "Created operation"
        );
        op
    }

    /// Draft an edit against current state without applying it, for
    /// batching through an [`OperationTransformer`].
    #[must_use]
    pub fn stage(&self, kind: OpKind, payload: Payload) -> Edit {
        let old_state = self.snapshot_fields(&payload.entity_id);
        Edit::new(kind, payload, old_state)
    }

    /// Reduce the transformer's queue and stamp every surviving edit as a
    /// local operation. Returns the operations to broadcast.
    pub fn commit_batch(&mut self, transformer: &mut OperationTransformer) -> Vec<Operation> {
        transformer
            .process_queue()
            .into_iter()
            .map(|edit| self.create_operation(edit.kind, edit.payload))
            .collect()
    }

    /// Apply an operation received from another site.
    ///
    /// # Errors
    ///
    /// - [`ApplyError::DuplicateOperation`] if the id is already in history
    ///   or the local clock already covers it (pruned history, snapshot
    ///   merge); state is untouched.
    /// - [`ApplyError::NotCausallyReady`] if the origin counter is not exactly
    ///   one past the local one or another dependency is unseen; the
    ///   operation is dropped.
    pub fn apply_remote_operation(&mut self, op: Operation) -> Result<Applied, ApplyError> {
        if self.history.contains(&op.id) {
            tracing::debug!(site_id = %self.state.site_id, op_id = %op.id, "Duplicate operation");
            return Err(ApplyError::DuplicateOperation { id: op.id });
        }
        if op.sequence() <= self.state.vector_clock.get(&op.site_id) {
            tracing::debug!(
                site_id = %self.state.site_id,
                op_id = %op.id,
                "Operation already covered by local clock"
            );
            return Err(ApplyError::DuplicateOperation { id: op.id });
        }

        if let Some(gap) = self
            .state
            .vector_clock
            .causal_gap(&op.site_id, &op.vector_clock)
        {
            tracing::warn!(
                site_id = %self.state.site_id,
                op_id = %op.id,
                %gap,
                "Dropping operation that is not causally ready"
            );
            return Err(ApplyError::NotCausallyReady { id: op.id, gap });
        }

        let rivals: Vec<Operation> = self
            .history
            .for_entity(op.entity_id())
            .filter(|h| h.vector_clock.is_concurrent_with(&op.vector_clock))
            .cloned()
            .collect();

        let applied = self.integrate(&op, &rivals);
        if !rivals.is_empty() {
            let mut involved = rivals;
            involved.push(op.clone());
            self.notifications.extend(detect_conflicts(&involved));
        }

        self.state.vector_clock.merge(&op.vector_clock);
        tracing::debug!(
            site_id = %self.state.site_id,
            op_id = %op.id,
            kind = %op.kind,
            entity_id = op.entity_id(),
            outcome = ?applied,
            "Applied remote operation"
        );
        self.history.append(op);
        Ok(applied)
    }

    /// Apply the effect of `op` given the concurrent operations already in
    /// history, and report the rule that decided it.
    ///
    /// Deletes tombstone the entity and nothing touches a tombstoned entity
    /// again. Every other write goes through the entity's registers, and the
    /// affected fields are re-read from them, so the outcome depends only on
    /// the set of operations seen and never on their delivery order.
    fn integrate(&mut self, op: &Operation, rivals: &[Operation]) -> Applied {
        let entity_id = op.entity_id();
        let deleted = op.kind == OpKind::Delete || self.state.is_tombstoned(entity_id);

        if op.kind == OpKind::Delete {
            self.registers.remove(entity_id);
            self.state.apply(op);
        } else if !deleted {
            let registers = self.registers.entry(entity_id.to_string()).or_default();
            let keys = registers.record(op);
            if op.kind == OpKind::Add {
                self.state.objects.entry(entity_id.to_string()).or_default();
            }
            if let Some(object) = self.state.objects.get_mut(entity_id) {
                let keys = if op.kind == OpKind::Add {
                    object.keys().cloned().chain(keys).collect()
                } else {
                    keys
                };
                for key in keys {
                    match registers.resolve(&key) {
                        Some(Some(value)) => {
                            object.insert(key, value.clone());
                        }
                        Some(None) => {
                            object.remove(&key);
                        }
                        None => {}
                    }
                }
            }
        }

        if rivals.is_empty() {
            Applied::Clean
        } else if deleted {
            Applied::Resolved(Strategy::DeleteWins)
        } else if op.kind.is_field_edit() && rivals.iter().all(|r| r.kind.is_field_edit()) {
            Applied::Resolved(Strategy::MergeNonConflicting)
        } else {
            Applied::Resolved(Strategy::LastWriteWins)
        }
    }

    /// Merge a remote full-state snapshot into this replica.
    ///
    /// Queues a `divergent-states` notification when overlapping fields
    /// disagreed (remote values were kept). Returns the divergent entity ids.
    pub fn merge_remote(&mut self, remote: &ReplicaState) -> Vec<EntityId> {
        let divergent = divergent_entities(&self.state, remote);
        let merged = merge_states(&self.state, remote);

        tracing::debug!(
            site_id = %self.state.site_id,
            remote_site = %remote.site_id,
            objects = merged.objects.len(),
            tombstones = merged.tombstones.len(),
            divergent = divergent.len(),
            "Merged remote state"
        );

        if !divergent.is_empty() {
            self.notifications.push(ConflictNotification::new(
                ConflictKind::DivergentStates,
                [self.state.site_id.clone(), remote.site_id.clone()],
                divergent.iter().cloned(),
                None,
            ));
        }
        self.registers
            .retain(|id, _| !merged.tombstones.contains(id));
        self.state = merged;
        divergent
    }

    /// Prune delete operations older than `min_age` from history.
    ///
    /// Non-delete history and the tombstone set are never touched.
    pub fn garbage_collect(&mut self, min_age: Duration) -> usize {
        self.garbage_collect_at(now_ms(), min_age)
    }

    /// [`Replica::garbage_collect`] against an explicit current time.
    pub fn garbage_collect_at(&mut self, now_ms: u64, min_age: Duration) -> usize {
        let min_age_ms = u64::try_from(min_age.as_millis()).unwrap_or(u64::MAX);
        let pruned = self.history.prune_deletes(now_ms, min_age_ms);
        tracing::info!(
            site_id = %self.state.site_id,
            pruned,
            retained = self.history.len(),
            "Garbage collected delete history"
        );
        pruned
    }
}
