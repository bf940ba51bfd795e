//! Inbound message handling and the resync contract.

use crate::messages::SyncMessage;
use boardsync_core::{ApplyError, Replica};

/// Apply an inbound message to `replica` and return the reply to send, if
/// any.
///
/// - `Operation`: applied; a duplicate is ignored, an operation that is not
///   causally ready triggers a `SnapshotRequest` to the sender.
/// - `SnapshotRequest`: answered with this replica's `Snapshot`.
/// - `Snapshot`: merged into local state.
pub fn handle(replica: &mut Replica, message: SyncMessage) -> Option<SyncMessage> {
    tracing::debug!(
        site_id = replica.site_id(),
        message = message.kind(),
        "Handling sync message"
    );

    match message {
        SyncMessage::Operation(op) => match replica.apply_remote_operation(op) {
            Ok(_) | Err(ApplyError::DuplicateOperation { .. }) => None,
            Err(err @ ApplyError::NotCausallyReady { .. }) => {
                tracing::info!(
                    site_id = replica.site_id(),
                    error = %err,
                    "Requesting resync"
                );
                Some(SyncMessage::SnapshotRequest {
                    site_id: replica.site_id().to_string(),
                    vector_clock: replica.vector_clock().clone(),
                })
            }
        },
        SyncMessage::SnapshotRequest { .. } => Some(SyncMessage::Snapshot(replica.state().clone())),
        SyncMessage::Snapshot(state) => {
            replica.merge_remote(&state);
            None
        }
    }
}
