//! # BoardSync Core
//!
//! State-synchronization core of a collaborative whiteboard.
//!
//! This crate provides:
//! - Vector clocks and the causal-readiness check for remote operations
//! - The immutable [`Operation`] record and its interop JSON shape
//! - A per-site [`Replica`] that applies local edits optimistically, gates
//!   remote operations (dedup + strict per-origin FIFO) and merges whole
//!   remote states
//! - Per-field causal registers so replicas converge whatever the delivery
//!   order
//! - A conflict resolver with a fixed precedence
//!   (causal > delete > field-merge > last-write-wins)
//! - An operation transformer reducing local edit bursts before commit
//!
//! Nothing here performs I/O or spawns tasks; transport, persistence and
//! scheduling (resync, garbage collection) belong to the caller.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod history;
pub mod operation;
pub mod register;
pub mod replica;
pub mod resolver;
pub mod transform;

pub use clock::{CausalGap, CausalOrder, SiteId, VectorClock};
pub use history::{OperationLog, RingLog};
pub use operation::{EntityId, Fields, OpKind, Operation, OperationError, OperationId, Payload};
pub use register::{CausalRegister, EntityRegisters, WriteStamp};
pub use replica::{merge_states, Applied, ApplyError, Replica, ReplicaState};
pub use resolver::{
    detect_conflicts, resolve, ConflictKind, ConflictNotification, ConflictResolution, Strategy,
};
pub use transform::{Edit, OperationTransformer, DEFAULT_HISTORY_CAPACITY};
