//! Keyword and tag suggestions.
//!
//! Terms are aggregated across live card documents by lower-cased key. The
//! aggregate is range-scanned by prefix, so it cannot also be ordered by
//! frequency; instead a generous slice is fetched and re-ranked in memory:
//!
//! 1. exact (case-sensitive) match
//! 2. exact case-insensitive match
//! 3. any other prefix match
//!
//! then by usage count, then shorter terms, then lexicographically. With very
//! large vocabularies the top results may be approximate.

use rusqlite::params;
use std::collections::{HashMap, VecDeque};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use super::cards::CARD_PREFIX;
use super::docstore::{prefix_range, DocChange, DocStore};
use super::error::{StoreError, StoreResult};
use crate::config;

/// Which card field suggestions are drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermField {
    Keywords,
    Tags,
}

impl TermField {
    fn json_path(&self) -> &'static str {
        match self {
            Self::Keywords => "$.keywords",
            Self::Tags => "$.tags",
        }
    }
}

/// A term and the number of cards using it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermCount {
    pub term: String,
    pub count: usize,
}

/// Ranked suggestions for `prefix`, at most `limit` of them
pub fn suggest(
    docs: &DocStore,
    field: TermField,
    prefix: &str,
    limit: usize,
) -> StoreResult<Vec<TermCount>> {
    let fetch = if prefix.is_empty() {
        limit.max(config::SUGGESTION_MIN_FETCH_ALL)
    } else {
        limit.max(config::SUGGESTION_MIN_FETCH)
    };
    let (start, end) = prefix_range(CARD_PREFIX);

    let mut terms = docs.with_conn(|conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT term.value, COUNT(*)
            FROM documents AS d, json_each(d.body, ?3) AS term
            WHERE d.id >= ?1 AND d.id < ?2 AND d.deleted = 0
              AND lower(term.value) >= lower(?4)
              AND lower(term.value) < lower(?4) || ?5
            GROUP BY term.value
            ORDER BY lower(term.value), term.value
            LIMIT ?6
            "#,
        )?;
        let rows = stmt
            .query_map(
                params![start, end, field.json_path(), prefix, "\u{fff0}", fetch as i64],
                |row| {
                    Ok(TermCount {
                        term: row.get(0)?,
                        count: row.get::<_, i64>(1)? as usize,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok::<_, StoreError>(rows)
    })?;

    rank_terms(&mut terms, prefix);
    terms.truncate(limit);
    Ok(terms)
}

fn match_tier(term: &str, prefix: &str) -> u8 {
    if term == prefix {
        0
    } else if term.to_lowercase() == prefix.to_lowercase() {
        1
    } else {
        2
    }
}

fn rank_terms(terms: &mut [TermCount], prefix: &str) {
    terms.sort_by(|a, b| {
        match_tier(&a.term, prefix)
            .cmp(&match_tier(&b.term, prefix))
            .then_with(|| b.count.cmp(&a.count))
            .then_with(|| a.term.chars().count().cmp(&b.term.chars().count()))
            .then_with(|| a.term.cmp(&b.term))
    });
}

fn matches_prefix(term: &str, prefix: &str) -> bool {
    term.to_lowercase().starts_with(&prefix.to_lowercase())
}

struct CachedLookup {
    terms: Vec<TermCount>,
    /// Fewer results than the limit came back, so every match is known
    complete: bool,
}

/// Suggestions seeded synchronously from what was typed this session
#[derive(Debug, Clone, PartialEq)]
pub struct InitialSuggestions {
    pub terms: Vec<String>,
    /// The store still needs to be asked
    pub needs_lookup: bool,
}

/// Suggestion source for one editing session.
///
/// Terms added during the session are returned first. Store lookups are
/// cached per prefix; a cached lookup also answers narrower prefixes when it
/// held every match. Any card write, local or replicated, empties the cache.
pub struct TagSuggester {
    docs: DocStore,
    field: TermField,
    changes: broadcast::Receiver<DocChange>,
    recent: Vec<String>,
    cache: HashMap<String, CachedLookup>,
    /// Cached prefixes, oldest first
    cached_order: VecDeque<String>,
    lookups: usize,
}

impl TagSuggester {
    pub fn new(docs: DocStore, field: TermField) -> Self {
        Self {
            changes: docs.subscribe(),
            docs,
            field,
            recent: Vec::new(),
            cache: HashMap::new(),
            cached_order: VecDeque::new(),
            lookups: 0,
        }
    }

    /// Drop cached lookups if any card changed since the last call
    fn discard_stale(&mut self) {
        let mut stale = false;
        loop {
            match self.changes.try_recv() {
                Ok(change) => stale |= change.id.starts_with(CARD_PREFIX),
                Err(TryRecvError::Lagged(_)) => stale = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        if stale && !self.cache.is_empty() {
            tracing::debug!("Card changes invalidated {} cached lookups", self.cache.len());
            self.cache.clear();
            self.cached_order.clear();
        }
    }

    fn remember(&mut self, prefix: &str, lookup: CachedLookup) {
        if self.cache.insert(prefix.to_string(), lookup).is_none() {
            self.cached_order.push_back(prefix.to_string());
        }
        while self.cached_order.len() > config::SUGGESTION_CACHE_ENTRIES {
            if let Some(oldest) = self.cached_order.pop_front() {
                self.cache.remove(&oldest);
            }
        }
    }

    /// Remember a term the user just entered
    pub fn record_added(&mut self, term: &str) {
        let term = term.trim();
        if term.is_empty() {
            return;
        }
        self.recent.retain(|t| t != term);
        self.recent.insert(0, term.to_string());
        self.recent.truncate(config::RECENT_SUGGESTIONS);
    }

    /// Number of times the store has been queried
    pub fn lookups(&self) -> usize {
        self.lookups
    }

    fn recent_matching(&self, prefix: &str) -> impl Iterator<Item = &String> {
        self.recent
            .iter()
            .filter(move |term| matches_prefix(term, prefix))
    }

    /// Cached terms that fully answer `prefix`, if any
    fn cached(&self, prefix: &str, limit: usize) -> Option<Vec<TermCount>> {
        if let Some(hit) = self.cache.get(prefix) {
            if hit.complete || hit.terms.len() >= limit {
                return Some(hit.terms.clone());
            }
        }

        let lowered = prefix.to_lowercase();
        let (_, covering) = self
            .cache
            .iter()
            .filter(|(cached_prefix, lookup)| {
                lookup.complete && lowered.starts_with(&cached_prefix.to_lowercase())
            })
            .max_by_key(|(cached_prefix, _)| cached_prefix.len())?;

        let mut terms: Vec<TermCount> = covering
            .terms
            .iter()
            .filter(|t| matches_prefix(&t.term, prefix))
            .cloned()
            .collect();
        rank_terms(&mut terms, prefix);
        terms.truncate(limit);
        Some(terms)
    }

    fn combine(&self, prefix: &str, persisted: &[TermCount], limit: usize) -> Vec<String> {
        let mut terms: Vec<String> = self.recent_matching(prefix).cloned().collect();
        for term in persisted {
            if !terms.contains(&term.term) {
                terms.push(term.term.clone());
            }
        }
        terms.truncate(limit);
        terms
    }

    /// Everything answerable without touching the store
    pub fn initial(&mut self, prefix: &str, limit: usize) -> InitialSuggestions {
        self.discard_stale();
        match self.cached(prefix, limit) {
            Some(persisted) => InitialSuggestions {
                terms: self.combine(prefix, &persisted, limit),
                needs_lookup: false,
            },
            None => InitialSuggestions {
                terms: self.combine(prefix, &[], limit),
                needs_lookup: true,
            },
        }
    }

    /// Full suggestions, querying the store when the cache cannot answer
    pub async fn lookup(&mut self, prefix: &str, limit: usize) -> StoreResult<Vec<String>> {
        self.discard_stale();
        if let Some(persisted) = self.cached(prefix, limit) {
            return Ok(self.combine(prefix, &persisted, limit));
        }

        let docs = self.docs.clone();
        let field = self.field;
        let query = prefix.to_string();
        self.lookups += 1;
        let terms = tokio::task::spawn_blocking(move || suggest(&docs, field, &query, limit))
            .await
            .map_err(|e| {
                tracing::error!("Suggestion lookup task failed: {}", e);
                StoreError::Lock
            })??;

        let result = self.combine(prefix, &terms, limit);
        self.remember(
            prefix,
            CachedLookup {
                complete: terms.len() < limit,
                terms,
            },
        );
        Ok(result)
    }
}
