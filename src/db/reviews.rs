//! Review summary persistence.
//!
//! A single `review` document holds the in-progress review so it can be resumed
//! after a restart or picked up on another device.

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::docstore::{DocChange, DocStore};
use super::error::{StoreError, StoreResult};
use crate::domain::ReviewSummary;

pub const REVIEW_ID: &str = "review";

#[derive(Clone)]
pub struct ReviewStore {
    docs: DocStore,
}

impl ReviewStore {
    pub fn new(docs: DocStore) -> Self {
        Self { docs }
    }

    /// The stored review, unless there is none or it has finished
    pub fn get_review(&self) -> StoreResult<Option<ReviewSummary>> {
        let Some(doc) = self.docs.get_any(REVIEW_ID)? else {
            return Ok(None);
        };
        if doc.deleted {
            return Ok(None);
        }
        let summary: ReviewSummary = serde_json::from_value(doc.body)?;
        Ok((!summary.finished).then_some(summary))
    }

    /// Store `summary` as the unfinished review, bumping `modified`
    pub fn put_review(&self, summary: &ReviewSummary) -> StoreResult<ReviewSummary> {
        let mut stored = summary.clone();
        stored.finished = false;
        stored.modified = Utc::now();
        let body = serde_json::to_value(&stored)?;
        self.docs.upsert(REVIEW_ID, |_| Ok(Some(body.clone())))?;
        Ok(stored)
    }

    /// Mark the stored review finished. Returns whether anything was written.
    pub fn finish_review(&self) -> StoreResult<bool> {
        let written = self.docs.upsert(REVIEW_ID, |current| {
            let Some(doc) = current.filter(|doc| !doc.deleted) else {
                return Ok(None);
            };
            let mut summary: ReviewSummary = serde_json::from_value(doc.body.clone())?;
            if summary.finished {
                return Ok(None);
            }
            summary.finished = true;
            summary.modified = Utc::now();
            Ok(Some(serde_json::to_value(&summary)?))
        })?;
        Ok(written.is_some())
    }

    /// Summaries written into this store by replication
    pub fn synced_changes(&self) -> ReviewSyncFeed {
        ReviewSyncFeed {
            rx: self.docs.subscribe(),
        }
    }
}

/// Live subscription to review summaries arriving from sync peers
pub struct ReviewSyncFeed {
    rx: broadcast::Receiver<DocChange>,
}

impl ReviewSyncFeed {
    /// Wait for the next synced summary; `None` once the store is gone
    pub async fn next(&mut self) -> Option<StoreResult<ReviewSummary>> {
        loop {
            let change = match self.rx.recv().await {
                Ok(change) => change,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Review sync feed lagged, {} document changes dropped", skipped);
                    continue;
                }
                Err(RecvError::Closed) => return None,
            };
            if change.id != REVIEW_ID || !change.replicated || change.deleted {
                continue;
            }
            return Some(serde_json::from_value(change.body).map_err(StoreError::from));
        }
    }
}
