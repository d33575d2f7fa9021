//! Coalesced card change feed.
//!
//! Every card is two documents, so one logical edit can show up as two
//! document changes. The normalizer remembers the last revision of each half
//! it has reported and reads the other half from the store when a change
//! arrives; a change whose revision was already covered by an earlier event
//! is swallowed.

use std::collections::HashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use super::cards::{merge_bodies, CARD_PREFIX, PROGRESS_PREFIX};
use super::docstore::{DocChange, DocStore};
use super::error::StoreResult;
use crate::domain::Card;

/// One logical card mutation
#[derive(Debug, Clone, PartialEq)]
pub struct CardChange {
    pub id: String,
    pub deleted: bool,
    /// Merged card; `None` for deletions
    pub card: Option<Card>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Half {
    Card,
    Progress,
}

fn split_doc_id(doc_id: &str) -> Option<(Half, &str)> {
    if let Some(id) = doc_id.strip_prefix(CARD_PREFIX) {
        Some((Half::Card, id))
    } else {
        doc_id
            .strip_prefix(PROGRESS_PREFIX)
            .map(|id| (Half::Progress, id))
    }
}

#[derive(Debug, Default)]
struct Emitted {
    card_rev: Option<String>,
    progress_rev: Option<String>,
    deleted: bool,
}

/// Turns raw document changes into card changes
pub struct CardChangeNormalizer {
    docs: DocStore,
    emitted: HashMap<String, Emitted>,
}

impl CardChangeNormalizer {
    pub fn new(docs: DocStore) -> Self {
        Self {
            docs,
            emitted: HashMap::new(),
        }
    }

    pub fn process(&mut self, change: &DocChange) -> StoreResult<Option<CardChange>> {
        let Some((half, id)) = split_doc_id(&change.id) else {
            return Ok(None);
        };
        if change.deleted {
            // The second half of a delete ends the card; nothing more to track
            if self.emitted.get(id).is_some_and(|entry| entry.deleted) {
                self.emitted.remove(id);
                return Ok(None);
            }
            self.emitted.insert(
                id.to_string(),
                Emitted {
                    deleted: true,
                    ..Default::default()
                },
            );
            return Ok(Some(CardChange {
                id: id.to_string(),
                deleted: true,
                card: None,
            }));
        }

        let entry = self.emitted.entry(id.to_string()).or_default();

        let seen = match half {
            Half::Card => &entry.card_rev,
            Half::Progress => &entry.progress_rev,
        };
        if seen.as_deref() == Some(change.rev.as_str()) {
            return Ok(None);
        }

        let other_id = match half {
            Half::Card => format!("{}{}", PROGRESS_PREFIX, id),
            Half::Progress => format!("{}{}", CARD_PREFIX, id),
        };
        let other = self.docs.get_any(&other_id)?.filter(|doc| !doc.deleted);

        let Some(other) = other else {
            // The other half has not landed yet; its own change will report the card
            match half {
                Half::Card => entry.card_rev = Some(change.rev.clone()),
                Half::Progress => entry.progress_rev = Some(change.rev.clone()),
            }
            return Ok(None);
        };

        let card = match half {
            Half::Card => {
                entry.card_rev = Some(change.rev.clone());
                entry.progress_rev = Some(other.rev.clone());
                merge_bodies(id, &change.body, &other.body)?
            }
            Half::Progress => {
                entry.progress_rev = Some(change.rev.clone());
                entry.card_rev = Some(other.rev.clone());
                merge_bodies(id, &other.body, &change.body)?
            }
        };
        entry.deleted = false;

        Ok(Some(CardChange {
            id: id.to_string(),
            deleted: false,
            card: Some(card),
        }))
    }
}

/// Live subscription to coalesced card changes
pub struct CardChangeFeed {
    rx: broadcast::Receiver<DocChange>,
    normalizer: CardChangeNormalizer,
}

impl CardChangeFeed {
    pub fn new(docs: DocStore) -> Self {
        Self {
            rx: docs.subscribe(),
            normalizer: CardChangeNormalizer::new(docs),
        }
    }

    /// Wait for the next card change; `None` once the store is gone
    pub async fn next(&mut self) -> Option<StoreResult<CardChange>> {
        loop {
            let change = match self.rx.recv().await {
                Ok(change) => change,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Card change feed lagged, {} document changes dropped", skipped);
                    continue;
                }
                Err(RecvError::Closed) => return None,
            };
            match self.normalizer.process(&change) {
                Ok(Some(card_change)) => return Some(Ok(card_change)),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Card changes already queued, without waiting
    pub fn drain(&mut self) -> StoreResult<Vec<CardChange>> {
        let mut changes = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(change) => {
                    if let Some(card_change) = self.normalizer.process(&change)? {
                        changes.push(card_change);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("Card change feed lagged, {} document changes dropped", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return Ok(changes),
            }
        }
    }
}
