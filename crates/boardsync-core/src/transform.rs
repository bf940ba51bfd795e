//! Pairwise reduction of a local burst of edits before they are committed.
//!
//! Edits are queued as drafts (kind + payload + pre/post images) and reduced
//! by [`OperationTransformer::transform`] into a minimal batch. Survivors are
//! stamped into real operations by [`Replica::commit_batch`], so dropping a
//! draft never leaves a gap in the origin's sequence numbers.
//!
//! # Transform table
//!
//! Rows are the earlier edit, columns the later one, on the same entity.
//!
//! | earlier \ later | Add | Update | Move | Delete |
//! |-----------------|-----|--------|------|--------|
//! | Add | keep both | keep both | keep both | drop earlier |
//! | Update | keep both | compose | compose | drop earlier |
//! | Move | keep both | compose | compose | drop earlier |
//! | Delete | keep both | drop later | drop later | drop both |
//!
//! [`Replica::commit_batch`]: crate::replica::Replica::commit_batch

use crate::history::RingLog;
use crate::operation::{Fields, OpKind, Payload};
use serde::{Deserialize, Serialize};

/// Default number of committed edits kept in history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// A not-yet-committed edit with its pre- and post-image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edit {
    /// Kind of edit
    pub kind: OpKind,
    /// Target entity and written fields
    pub payload: Payload,
    /// Entity fields before the edit, if the entity existed
    pub old_state: Option<Fields>,
    /// Entity fields after the edit; `None` after a delete
    pub new_state: Option<Fields>,
}

impl Edit {
    /// Create an edit and derive its post-image from `old_state`.
    #[must_use]
    pub fn new(kind: OpKind, payload: Payload, old_state: Option<Fields>) -> Self {
        let mut edit = Self {
            kind,
            payload,
            old_state,
            new_state: None,
        };
        edit.new_state = edit.project();
        edit
    }

    /// Target entity id.
    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.payload.entity_id
    }

    /// Fields this edit writes: positions for a move, nothing for a delete.
    fn written_fields(&self) -> Fields {
        match self.kind {
            OpKind::Add | OpKind::Update => self.payload.fields.clone(),
            OpKind::Move => self.payload.position(),
            OpKind::Delete => Fields::new(),
        }
    }

    fn project(&self) -> Option<Fields> {
        match self.kind {
            OpKind::Add => Some(self.payload.fields.clone()),
            OpKind::Delete => None,
            OpKind::Update | OpKind::Move => {
                let mut fields = self.old_state.clone().unwrap_or_default();
                fields.extend(self.written_fields());
                Some(fields)
            }
        }
    }
}

/// Queue of pending edits plus bounded history of committed ones.
#[derive(Debug, Clone)]
pub struct OperationTransformer {
    queue: Vec<Edit>,
    history: RingLog<Edit>,
}

impl Default for OperationTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationTransformer {
    /// Transformer keeping the last [`DEFAULT_HISTORY_CAPACITY`] commits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Transformer keeping the last `capacity` commits.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Vec::new(),
            history: RingLog::with_capacity(capacity),
        }
    }

    /// Queue an edit for the next [`OperationTransformer::process_queue`].
    pub fn enqueue(&mut self, edit: Edit) {
        self.queue.push(edit);
    }

    /// Number of queued edits.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Committed edits, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Edit> {
        self.history.iter()
    }

    /// Transform an earlier edit against a later one.
    ///
    /// Edits on different entities pass through unchanged. `None` means the
    /// edit is discarded.
    #[must_use]
    pub fn transform(earlier: Edit, later: Edit) -> (Option<Edit>, Option<Edit>) {
        if earlier.entity_id() != later.entity_id() {
            return (Some(earlier), Some(later));
        }

        match (earlier.kind, later.kind) {
            (OpKind::Delete, OpKind::Delete) => (None, None),
            (OpKind::Delete, OpKind::Update | OpKind::Move) => (Some(earlier), None),
            (OpKind::Add | OpKind::Update | OpKind::Move, OpKind::Delete) => (None, Some(later)),
            (OpKind::Update | OpKind::Move, OpKind::Update | OpKind::Move) => {
                (None, Some(compose(&earlier, later)))
            }
            (_, OpKind::Add) | (OpKind::Add, OpKind::Update | OpKind::Move) => {
                (Some(earlier), Some(later))
            }
        }
    }

    /// Drain the queue and reduce it pairwise.
    ///
    /// Each edit is transformed against every later surviving edit in queue
    /// order; an edit discarded by an earlier comparison takes no further
    /// part. Survivors are recorded in history and returned in queue order.
    pub fn process_queue(&mut self) -> Vec<Edit> {
        let mut slots: Vec<Option<Edit>> = self.queue.drain(..).map(Some).collect();
        let queued = slots.len();

        for i in 0..slots.len() {
            for j in (i + 1)..slots.len() {
                if slots[i].is_none() {
                    break;
                }
                if slots[j].is_none() {
                    continue;
                }
                if let (Some(earlier), Some(later)) = (slots[i].take(), slots[j].take()) {
                    let (a, b) = Self::transform(earlier, later);
                    slots[i] = a;
                    slots[j] = b;
                }
            }
        }

        let committed: Vec<Edit> = slots.into_iter().flatten().collect();
        for edit in &committed {
            self.history.push(edit.clone());
        }
        tracing::debug!(queued, committed = committed.len(), "Processed edit queue");
        committed
    }
}

/// Sequential composition: the earlier edit is absorbed into the later one,
/// whose pre-image is rebased onto the earlier post-image.
fn compose(earlier: &Edit, later: Edit) -> Edit {
    let kind = if earlier.kind == later.kind {
        later.kind
    } else {
        OpKind::Update
    };

    let mut fields = earlier.written_fields();
    fields.extend(later.written_fields());
    let payload = Payload {
        entity_id: later.payload.entity_id,
        fields,
    };

    Edit::new(kind, payload, earlier.new_state.clone())
}
