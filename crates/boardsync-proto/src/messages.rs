//! Protocol messages exchanged between replicas.

use boardsync_core::{Operation, ReplicaState, SiteId, VectorClock};
use serde::{Deserialize, Serialize};

/// A message carried by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMessage {
    /// Incremental delivery of one operation
    Operation(Operation),
    /// Ask a peer for its full state
    SnapshotRequest {
        /// Requesting site
        site_id: SiteId,
        /// Requester's clock, for diagnostics
        vector_clock: VectorClock,
    },
    /// Full state of the sending site
    Snapshot(ReplicaState),
}

impl SyncMessage {
    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes, validating carried operations.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails or an operation is invalid.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        let message: Self =
            ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))?;
        if let SyncMessage::Operation(op) = &message {
            op.validate()
                .map_err(|e| MessageError::InvalidOperation(e.to_string()))?;
        }
        Ok(message)
    }

    /// Short name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Operation(_) => "operation",
            SyncMessage::SnapshotRequest { .. } => "snapshot-request",
            SyncMessage::Snapshot(_) => "snapshot",
        }
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// Carried operation failed validation
    #[error("{0}")]
    InvalidOperation(String),
}
