//! In-process replication between two document stores.
//!
//! Reads the source's changes since the last checkpoint and offers each
//! document's winning leaf to the target, which fast-forwards, ignores, or
//! records a conflict. Only the transport is missing compared to a networked
//! replicator; the conflict paths are the same.

use serde::Serialize;

use super::docstore::{ApplyOutcome, DocStore};
use super::error::StoreResult;
use crate::config;

/// What one replication pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationReport {
    pub docs_read: usize,
    pub docs_written: usize,
    pub conflicts: usize,
    pub resolved: usize,
    pub last_seq: i64,
}

/// Push every change in `source` that `target` has not yet seen
pub fn replicate(source: &DocStore, target: &DocStore) -> StoreResult<ReplicationReport> {
    let source_id = source.store_id()?;
    let mut since = target.checkpoint(&source_id)?;
    let mut report = ReplicationReport {
        last_seq: since,
        ..Default::default()
    };

    loop {
        let batch = source.changes_since(since, config::REPLICATION_BATCH_SIZE)?;
        if batch.is_empty() {
            break;
        }

        for change in &batch {
            report.docs_read += 1;
            let Some(leaf) = source.leaf(&change.id)? else {
                continue;
            };
            match target.apply_replicated(leaf)? {
                ApplyOutcome::Unchanged => {}
                ApplyOutcome::FastForward => report.docs_written += 1,
                ApplyOutcome::Conflict { resolved } => {
                    report.docs_written += 1;
                    report.conflicts += 1;
                    if resolved {
                        report.resolved += 1;
                    }
                }
            }
            since = change.seq;
        }
        target.set_checkpoint(&source_id, since)?;
    }

    report.last_seq = since;
    if report.docs_written > 0 {
        tracing::info!(
            "Replicated {} of {} documents ({} conflicts, {} resolved)",
            report.docs_written,
            report.docs_read,
            report.conflicts,
            report.resolved
        );
    }
    Ok(report)
}

/// Replicate in both directions until neither side has anything new
pub fn sync(a: &DocStore, b: &DocStore) -> StoreResult<(ReplicationReport, ReplicationReport)> {
    let pushed = replicate(a, b)?;
    let pulled = replicate(b, a)?;
    // Merged revisions written on `a` while pulling travel back once more
    let settle = replicate(a, b)?;
    Ok((
        ReplicationReport {
            docs_read: pushed.docs_read + settle.docs_read,
            docs_written: pushed.docs_written + settle.docs_written,
            conflicts: pushed.conflicts + settle.conflicts,
            resolved: pushed.resolved + settle.resolved,
            last_seq: settle.last_seq,
        },
        pulled,
    ))
}
