//! Card/Progress store.
//!
//! A card lives in two documents, `card-<id>` with its content and
//! `progress-<id>` with its review state, so that content edits and review
//! outcomes never conflict with each other. Callers only ever see the merged
//! `Card`.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::changes::CardChangeFeed;
use super::docstore::{prefix_range, DocStore};
use super::error::{StoreError, StoreResult};
use super::ids::IdGenerator;
use super::keywords::{suggest, TermField};
use crate::config;
use crate::domain::{AvailableCards, Card, CardPatch, Progress};
use crate::srs::overdue::{progress_score, rank_by_overdueness};
use crate::validation::{normalize_terms, normalize_text};

pub const CARD_PREFIX: &str = "card-";
pub const PROGRESS_PREFIX: &str = "progress-";

pub fn card_doc_id(id: &str) -> String {
    format!("{}{}", CARD_PREFIX, id)
}

pub fn progress_doc_id(id: &str) -> String {
    format!("{}{}", PROGRESS_PREFIX, id)
}

/// Content half of a card as persisted. Empty collections and `starred: false`
/// are omitted on write and defaulted on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CardDoc {
    pub front: String,
    pub back: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub starred: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub modified: DateTime<Utc>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Review half of a card as persisted. `due` is derived from `reviewed` and
/// `level` and only exists to back the due index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ProgressDoc {
    pub level: f64,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub reviewed: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub due: Option<DateTime<Utc>>,
}

impl From<Progress> for ProgressDoc {
    fn from(progress: Progress) -> Self {
        Self {
            level: progress.level,
            reviewed: progress.reviewed,
            due: progress.due(),
        }
    }
}

impl ProgressDoc {
    pub fn progress(&self) -> Progress {
        Progress {
            level: self.level,
            reviewed: self.reviewed,
        }
    }
}

pub(crate) fn merge_card(id: &str, card: CardDoc, progress: &ProgressDoc) -> Card {
    Card {
        id: id.to_string(),
        front: card.front,
        back: card.back,
        keywords: card.keywords,
        tags: card.tags,
        starred: card.starred,
        created: card.created,
        modified: card.modified,
        progress: progress.progress(),
    }
}

pub(crate) fn merge_bodies(id: &str, card: &Value, progress: &Value) -> StoreResult<Card> {
    let card: CardDoc = serde_json::from_value(card.clone())?;
    let progress: ProgressDoc = serde_json::from_value(progress.clone())?;
    Ok(merge_card(id, card, &progress))
}

/// Which cards `get_cards` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardKind {
    /// Never reviewed, oldest first
    New,
    /// Due at the review time, most overdue first
    Overdue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CardQuery {
    pub kind: CardKind,
    pub limit: Option<usize>,
    /// Leave out failed (level 0, previously reviewed) cards
    pub skip_failed_cards: bool,
    pub review_time: DateTime<Utc>,
}

impl CardQuery {
    pub fn new(kind: CardKind, review_time: DateTime<Utc>) -> Self {
        Self {
            kind,
            limit: None,
            skip_failed_cards: false,
            review_time,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip_failed_cards(mut self, skip: bool) -> Self {
        self.skip_failed_cards = skip;
        self
    }
}

#[derive(Clone)]
pub struct CardStore {
    docs: DocStore,
    ids: Arc<IdGenerator>,
}

impl CardStore {
    pub fn new(docs: DocStore, ids: Arc<IdGenerator>) -> Self {
        Self { docs, ids }
    }

    pub fn docs(&self) -> &DocStore {
        &self.docs
    }

    // ==================== Writes ====================

    /// Create a card (no `id`) or update the supplied fields of an existing one
    pub fn put_card(&self, patch: &CardPatch) -> StoreResult<Card> {
        match &patch.id {
            None => self.create_card(patch),
            Some(id) => self.update_card(id, patch),
        }
    }

    fn create_card(&self, patch: &CardPatch) -> StoreResult<Card> {
        let now = Utc::now();
        let card = CardDoc {
            front: normalize_text(patch.front.as_deref().unwrap_or_default()),
            back: normalize_text(patch.back.as_deref().unwrap_or_default()),
            keywords: normalize_terms(patch.keywords.as_deref().unwrap_or_default()),
            tags: normalize_terms(patch.tags.as_deref().unwrap_or_default()),
            starred: patch.starred.unwrap_or(false),
            created: now,
            modified: now,
        };
        let body = serde_json::to_value(&card)?;

        let mut attempt = 0;
        let id = loop {
            let id = self.ids.generate();
            match self.docs.put(&card_doc_id(&id), None, &body) {
                Ok(_) => break id,
                Err(StoreError::Conflict { .. }) if attempt + 1 < config::ID_COLLISION_RETRIES => {
                    tracing::debug!("Card id {} collided, generating another", id);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let progress = patch
            .progress
            .map(|p| p.apply_to(Progress::default()))
            .unwrap_or_default();
        let progress = ProgressDoc::from(progress);
        self.put_progress_or_roll_back(&id, &serde_json::to_value(&progress)?)?;

        tracing::debug!("Created card {}", id);
        self.get_card(&id)
    }

    /// Write the progress half of a freshly created card, deleting the card
    /// half again when that fails
    fn put_progress_or_roll_back(&self, id: &str, progress: &Value) -> StoreResult<()> {
        if let Err(e) = self.docs.put(&progress_doc_id(id), None, progress) {
            tracing::warn!("Rolling back card {} after progress write failed: {}", id, e);
            if let Err(rollback) = self.docs.stubborn_remove(&card_doc_id(id)) {
                tracing::error!("Failed to roll back card {}: {}", id, rollback);
            }
            return Err(e);
        }
        Ok(())
    }

    fn update_card(&self, id: &str, patch: &CardPatch) -> StoreResult<Card> {
        if patch.touches_card() {
            let doc_id = card_doc_id(id);
            self.docs.upsert(&doc_id, |current| {
                let current = match current {
                    None => return Err(StoreError::missing(&doc_id)),
                    Some(doc) if doc.deleted => return Err(StoreError::deleted(&doc_id)),
                    Some(doc) => doc,
                };
                let mut card: CardDoc = serde_json::from_value(current.body.clone())?;
                if !apply_content_patch(&mut card, patch) {
                    return Ok(None);
                }
                card.modified = Utc::now();
                Ok(Some(serde_json::to_value(&card)?))
            })?;
        }

        if let Some(progress_patch) = patch.progress {
            let doc_id = progress_doc_id(id);
            self.docs.upsert(&doc_id, |current| {
                let current = match current {
                    None => return Err(StoreError::missing(&doc_id)),
                    Some(doc) if doc.deleted => return Err(StoreError::deleted(&doc_id)),
                    Some(doc) => doc,
                };
                let stored: ProgressDoc = serde_json::from_value(current.body.clone())?;
                let updated = progress_patch.apply_to(stored.progress());
                if updated == stored.progress() {
                    return Ok(None);
                }
                Ok(Some(serde_json::to_value(ProgressDoc::from(updated))?))
            })?;
        }

        self.get_card(id)
    }

    /// Delete both halves of a card. Deleting a missing card succeeds.
    pub fn delete_card(&self, id: &str) -> StoreResult<()> {
        self.docs.stubborn_remove(&card_doc_id(id))?;
        self.docs.stubborn_remove(&progress_doc_id(id))?;
        tracing::debug!("Deleted card {}", id);
        Ok(())
    }

    // ==================== Reads ====================

    pub fn get_card(&self, id: &str) -> StoreResult<Card> {
        let card = self.docs.get(&card_doc_id(id))?;
        let progress = self.docs.get(&progress_doc_id(id))?;
        merge_bodies(id, &card.body, &progress.body)
    }

    /// Cards in the order requested; ids that do not resolve are dropped
    pub fn get_cards_by_id(&self, ids: &[String]) -> StoreResult<Vec<Card>> {
        let mut cards = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_card(id) {
                Ok(card) => cards.push(card),
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(cards)
    }

    pub fn get_cards(&self, query: &CardQuery) -> StoreResult<Vec<Card>> {
        match query.kind {
            CardKind::New => self.new_cards(query.limit),
            CardKind::Overdue => self.overdue_cards(query),
        }
    }

    fn new_cards(&self, limit: Option<usize>) -> StoreResult<Vec<Card>> {
        let (start, end) = prefix_range(CARD_PREFIX);
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let rows = self.docs.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT c.id, c.body, p.body
                FROM documents c
                JOIN documents p ON p.id = ?3 || substr(c.id, ?4)
                WHERE c.id >= ?1 AND c.id < ?2
                  AND c.deleted = 0 AND p.deleted = 0
                  AND json_extract(p.body, '$.reviewed') IS NULL
                  AND json_extract(p.body, '$.level') = 0
                ORDER BY json_extract(c.body, '$.created'), c.id
                LIMIT ?5
                "#,
            )?;
            let rows = stmt
                .query_map(
                    params![start, end, PROGRESS_PREFIX, (CARD_PREFIX.len() + 1) as i64, limit],
                    read_pair,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(doc_id, card, progress)| {
                merge_bodies(strip_card_prefix(&doc_id), &parse(&card)?, &parse(&progress)?)
            })
            .collect()
    }

    fn overdue_cards(&self, query: &CardQuery) -> StoreResult<Vec<Card>> {
        let mut ranked: Vec<(f64, Card)> = self
            .due_pairs(query.review_time)?
            .into_iter()
            .filter(|card| !(query.skip_failed_cards && card.progress.is_failed()))
            .filter_map(|card| progress_score(query.review_time, &card.progress).map(|s| (s, card)))
            .collect();

        rank_by_overdueness(&mut ranked);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(ranked.into_iter().take(limit).map(|(_, card)| card).collect())
    }

    /// Cards whose due time is at or before `review_time`, in due order
    fn due_pairs(&self, review_time: DateTime<Utc>) -> StoreResult<Vec<Card>> {
        let (start, end) = prefix_range(PROGRESS_PREFIX);
        let rows = self.docs.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT c.id, c.body, p.body
                FROM documents p
                JOIN documents c ON c.id = ?3 || substr(p.id, ?4)
                WHERE p.id >= ?1 AND p.id < ?2
                  AND p.deleted = 0 AND c.deleted = 0
                  AND json_extract(p.body, '$.due') IS NOT NULL
                  AND json_extract(p.body, '$.due') <= ?5
                ORDER BY json_extract(p.body, '$.due'), p.id
                "#,
            )?;
            let rows = stmt
                .query_map(
                    params![
                        start,
                        end,
                        CARD_PREFIX,
                        (PROGRESS_PREFIX.len() + 1) as i64,
                        review_time.timestamp_millis()
                    ],
                    read_pair,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(doc_id, card, progress)| {
                merge_bodies(strip_card_prefix(&doc_id), &parse(&card)?, &parse(&progress)?)
            })
            .collect()
    }

    /// Badge counts, independent of any review limit
    pub fn get_available_cards(&self, review_time: DateTime<Utc>) -> StoreResult<AvailableCards> {
        let (start, end) = prefix_range(PROGRESS_PREFIX);
        self.docs.with_conn(|conn| {
            let (new_cards, overdue_cards): (i64, i64) = conn.query_row(
                r#"
                SELECT
                  COALESCE(SUM(json_extract(p.body, '$.reviewed') IS NULL
                               AND json_extract(p.body, '$.level') = 0), 0),
                  COALESCE(SUM(json_extract(p.body, '$.due') IS NOT NULL
                               AND json_extract(p.body, '$.due') <= ?5), 0)
                FROM documents p
                JOIN documents c ON c.id = ?3 || substr(p.id, ?4)
                WHERE p.id >= ?1 AND p.id < ?2
                  AND p.deleted = 0 AND c.deleted = 0
                "#,
                params![
                    start,
                    end,
                    CARD_PREFIX,
                    (PROGRESS_PREFIX.len() + 1) as i64,
                    review_time.timestamp_millis()
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(AvailableCards {
                new_cards: new_cards as usize,
                overdue_cards: overdue_cards as usize,
            })
        })
    }

    /// All cards in creation order, for listings
    pub fn get_cards_page(&self, skip: usize, limit: usize) -> StoreResult<Vec<Card>> {
        let (start, end) = prefix_range(CARD_PREFIX);
        let rows = self.docs.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT c.id, c.body, p.body
                FROM documents c
                JOIN documents p ON p.id = ?3 || substr(c.id, ?4)
                WHERE c.id >= ?1 AND c.id < ?2
                  AND c.deleted = 0 AND p.deleted = 0
                ORDER BY json_extract(c.body, '$.created'), c.id
                LIMIT ?5 OFFSET ?6
                "#,
            )?;
            let rows = stmt
                .query_map(
                    params![
                        start,
                        end,
                        PROGRESS_PREFIX,
                        (CARD_PREFIX.len() + 1) as i64,
                        limit as i64,
                        skip as i64
                    ],
                    read_pair,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(doc_id, card, progress)| {
                merge_bodies(strip_card_prefix(&doc_id), &parse(&card)?, &parse(&progress)?)
            })
            .collect()
    }

    // ==================== Suggestions ====================

    pub fn get_keywords(&self, prefix: &str, limit: usize) -> StoreResult<Vec<String>> {
        Ok(suggest(&self.docs, TermField::Keywords, prefix, limit)?
            .into_iter()
            .map(|term| term.term)
            .collect())
    }

    pub fn get_tags(&self, prefix: &str, limit: usize) -> StoreResult<Vec<String>> {
        Ok(suggest(&self.docs, TermField::Tags, prefix, limit)?
            .into_iter()
            .map(|term| term.term)
            .collect())
    }

    // ==================== Change feed ====================

    /// Coalesced card changes from this point on
    pub fn changes(&self) -> CardChangeFeed {
        CardChangeFeed::new(self.docs.clone())
    }
}

/// Copy the supplied content fields into `card`; returns whether anything changed
fn apply_content_patch(card: &mut CardDoc, patch: &CardPatch) -> bool {
    let mut changed = false;

    if let Some(front) = &patch.front {
        let front = normalize_text(front);
        if card.front != front {
            card.front = front;
            changed = true;
        }
    }
    if let Some(back) = &patch.back {
        let back = normalize_text(back);
        if card.back != back {
            card.back = back;
            changed = true;
        }
    }
    if let Some(keywords) = &patch.keywords {
        let keywords = normalize_terms(keywords);
        if card.keywords != keywords {
            card.keywords = keywords;
            changed = true;
        }
    }
    if let Some(tags) = &patch.tags {
        let tags = normalize_terms(tags);
        if card.tags != tags {
            card.tags = tags;
            changed = true;
        }
    }
    if let Some(starred) = patch.starred {
        if card.starred != starred {
            card.starred = starred;
            changed = true;
        }
    }

    changed
}

fn read_pair(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn parse(body: &str) -> StoreResult<Value> {
    Ok(serde_json::from_str(body)?)
}

fn strip_card_prefix(doc_id: &str) -> &str {
    doc_id.strip_prefix(CARD_PREFIX).unwrap_or(doc_id)
}
