//! Multi-site replay scripts.
//!
//! A script lists the local edits of every site and, optionally, operation
//! ids lost in transit:
//!
//! ```json
//! {
//!   "sites": {
//!     "A": [{ "kind": "add", "payload": { "id": "obj1", "x": 100 } }],
//!     "B": [{ "kind": "add", "payload": { "id": "obj1", "x": 200 } }]
//!   },
//!   "drop": ["A-1"],
//!   "batch": false
//! }
//! ```
//!
//! With `batch` set, each site's edits are reduced by an
//! [`OperationTransformer`] before they are stamped.

use crate::config::SyncConfig;
use anyhow::{Context, Result};
use boardsync_core::{
    ConflictNotification, OpKind, Operation, OperationId, OperationTransformer, Payload, Replica,
    ReplicaState, SiteId,
};
use boardsync_proto::SyncMessage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// One local edit in a script.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptEdit {
    /// Kind of edit
    pub kind: OpKind,
    /// Target entity and fields
    pub payload: Payload,
}

/// A replay script.
#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    /// Local edits per site, in creation order
    pub sites: BTreeMap<SiteId, Vec<ScriptEdit>>,
    /// Operation ids never delivered to any peer
    #[serde(default)]
    pub drop: BTreeSet<OperationId>,
    /// Reduce each site's edits through the transformer before commit
    #[serde(default)]
    pub batch: bool,
}

/// Outcome of a replay.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    /// Every site ended with the same objects and tombstones
    pub converged: bool,
    /// Operations stamped across all sites
    pub created: usize,
    /// Deliveries skipped because the script dropped them
    pub lost: usize,
    /// Deliveries rejected as not causally ready
    pub rejected: usize,
    /// Snapshot exchanges performed to heal rejections
    pub resyncs: usize,
    /// Delete operations pruned from history
    pub pruned: usize,
    /// Final state of every site
    pub states: BTreeMap<SiteId, ReplicaState>,
    /// Conflict notifications raised at each site
    pub notifications: BTreeMap<SiteId, Vec<ConflictNotification>>,
}

/// Load a script from a JSON file.
///
/// # Errors
///
/// Returns error if the file cannot be read or is not a valid script.
pub fn load(path: &Path) -> Result<Script> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid script {}", path.display()))
}

/// Run a script: create each site's operations, deliver them to every other
/// site in per-origin FIFO order, then garbage-collect delete history.
///
/// # Errors
///
/// Returns error if a message fails to round-trip through its wire encoding.
pub fn replay(script: &Script, config: &SyncConfig) -> Result<ReplayReport> {
    let mut replicas: BTreeMap<SiteId, Replica> = BTreeMap::new();
    let mut outboxes: BTreeMap<SiteId, Vec<Operation>> = BTreeMap::new();

    for (site, edits) in &script.sites {
        let mut replica = Replica::new(site.clone());
        let ops = if script.batch {
            let mut transformer = OperationTransformer::with_capacity(config.history_capacity);
            for edit in edits {
                transformer.enqueue(replica.stage(edit.kind, edit.payload.clone()));
            }
            replica.commit_batch(&mut transformer)
        } else {
            edits
                .iter()
                .map(|edit| replica.create_operation(edit.kind, edit.payload.clone()))
                .collect()
        };
        tracing::info!(site_id = %site, edits = edits.len(), operations = ops.len(), "Site created operations");
        replicas.insert(site.clone(), replica);
        outboxes.insert(site.clone(), ops);
    }

    let mut report = ReplayReport {
        converged: false,
        created: outboxes.values().map(Vec::len).sum(),
        lost: 0,
        rejected: 0,
        resyncs: 0,
        pruned: 0,
        states: BTreeMap::new(),
        notifications: BTreeMap::new(),
    };

    let sites: Vec<SiteId> = replicas.keys().cloned().collect();
    for receiver_id in &sites {
        let Some(mut receiver) = replicas.remove(receiver_id) else {
            continue;
        };

        for (origin_id, ops) in &outboxes {
            if origin_id == receiver_id {
                continue;
            }
            for op in ops {
                if script.drop.contains(&op.id) {
                    report.lost += 1;
                    continue;
                }
                let message = transmit(SyncMessage::Operation(op.clone()))?;
                let Some(request) = boardsync_proto::handle(&mut receiver, message) else {
                    continue;
                };
                report.rejected += 1;
                if !config.resync_on_drop {
                    continue;
                }

                let Some(origin) = replicas.get_mut(origin_id) else {
                    continue;
                };
                if let Some(snapshot) = boardsync_proto::handle(origin, transmit(request)?) {
                    boardsync_proto::handle(&mut receiver, transmit(snapshot)?);
                    report.resyncs += 1;
                }
            }
        }

        replicas.insert(receiver_id.clone(), receiver);
    }

    for (site, replica) in &mut replicas {
        report.pruned += replica.garbage_collect(config.gc_min_age);
        report
            .notifications
            .insert(site.clone(), replica.take_notifications());
        report.states.insert(site.clone(), replica.state().clone());
    }

    report.converged = is_converged(report.states.values());
    tracing::info!(
        converged = report.converged,
        rejected = report.rejected,
        resyncs = report.resyncs,
        "Replay finished"
    );
    Ok(report)
}

/// Carry a message through its CBOR encoding.
fn transmit(message: SyncMessage) -> Result<SyncMessage> {
    let bytes = message.to_cbor().context("Failed to encode message")?;
    SyncMessage::from_cbor(&bytes).context("Failed to decode message")
}

fn is_converged<'a>(mut states: impl Iterator<Item = &'a ReplicaState>) -> bool {
    let Some(first) = states.next() else {
        return true;
    };
    states.all(|s| s.objects == first.objects && s.tombstones == first.tombstones)
}
