//! Conflict policies for diverged replicated documents.
//!
//! Each policy is a pure function of the two bodies. A body that cannot be
//! read as the expected shape always loses against one that can.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::cards::{CARD_PREFIX, PROGRESS_PREFIX};
use super::docstore::{DocStore, Winner};
use super::reviews::REVIEW_ID;
use crate::domain::ReviewSummary;

#[derive(Deserialize)]
struct Modified {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    modified: DateTime<Utc>,
}

#[derive(Deserialize)]
struct Reviewed {
    #[serde(default)]
    level: f64,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    reviewed: Option<DateTime<Utc>>,
}

fn parse_pair<'a, T: Deserialize<'a>>(a: &'a Value, b: &'a Value) -> Result<(T, T), Winner> {
    match (T::deserialize(a), T::deserialize(b)) {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (Ok(_), Err(_)) => Err(Winner::First),
        (Err(_), Ok(_)) => Err(Winner::Second),
        (Err(_), Err(_)) => Err(Winner::First),
    }
}

fn later(a: DateTime<Utc>, b: DateTime<Utc>) -> Winner {
    if b > a { Winner::Second } else { Winner::First }
}

/// Finished beats unfinished, then a non-empty history beats an empty one,
/// then the most recently modified wins
pub fn resolve_review(a: &Value, b: &Value) -> Winner {
    let (a, b) = match parse_pair::<ReviewSummary>(a, b) {
        Ok(pair) => pair,
        Err(winner) => return winner,
    };

    if a.finished != b.finished {
        return if a.finished { Winner::First } else { Winner::Second };
    }
    if a.history.is_empty() != b.history.is_empty() {
        return if a.history.is_empty() { Winner::Second } else { Winner::First };
    }
    later(a.modified, b.modified)
}

/// Most recently modified card content wins
pub fn resolve_card(a: &Value, b: &Value) -> Winner {
    match parse_pair::<Modified>(a, b) {
        Ok((a, b)) => later(a.modified, b.modified),
        Err(winner) => winner,
    }
}

/// The most recent review wins, then the higher level
pub fn resolve_progress(a: &Value, b: &Value) -> Winner {
    let (a, b) = match parse_pair::<Reviewed>(a, b) {
        Ok(pair) => pair,
        Err(winner) => return winner,
    };
    if a.reviewed != b.reviewed {
        return if b.reviewed > a.reviewed { Winner::Second } else { Winner::First };
    }
    if b.level > a.level { Winner::Second } else { Winner::First }
}

/// Install every policy on `docs`
pub fn register_resolvers(docs: &DocStore) {
    docs.register_resolver(REVIEW_ID, Arc::new(resolve_review));
    docs.register_resolver(CARD_PREFIX, Arc::new(resolve_card));
    docs.register_resolver(PROGRESS_PREFIX, Arc::new(resolve_progress));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn review(finished: bool, history: usize, modified: i64) -> Value {
        let history: Vec<Value> = (0..history)
            .map(|i| json!({"card_id": format!("c{}", i), "outcome": "pass"}))
            .collect();
        json!({
            "max_cards": 10,
            "max_new_cards": 2,
            "history": history,
            "finished": finished,
            "modified": modified,
        })
    }

    #[test]
    fn test_finished_review_wins() {
        let finished = review(true, 0, 1);
        let unfinished = review(false, 5, 100);
        assert_eq!(resolve_review(&finished, &unfinished), Winner::First);
        assert_eq!(resolve_review(&unfinished, &finished), Winner::Second);
    }

    #[test]
    fn test_review_with_history_wins() {
        let empty = review(false, 0, 100);
        let busy = review(false, 2, 1);
        assert_eq!(resolve_review(&empty, &busy), Winner::Second);
        assert_eq!(resolve_review(&busy, &empty), Winner::First);
    }

    #[test]
    fn test_latest_review_wins() {
        let old = review(false, 1, 1);
        let new = review(false, 1, 2);
        assert_eq!(resolve_review(&old, &new), Winner::Second);
        assert_eq!(resolve_review(&new, &old), Winner::First);
    }

    #[test]
    fn test_unreadable_review_loses() {
        let good = review(false, 0, 1);
        let bad = json!({"nonsense": true});
        assert_eq!(resolve_review(&bad, &good), Winner::Second);
        assert_eq!(resolve_review(&good, &bad), Winner::First);
    }

    #[test]
    fn test_card_and_progress_policies() {
        let a = json!({"front": "a", "back": "", "created": 0, "modified": 5});
        let b = json!({"front": "b", "back": "", "created": 0, "modified": 9});
        assert_eq!(resolve_card(&a, &b), Winner::Second);

        let reviewed_early = json!({"level": 8.0, "reviewed": 100});
        let reviewed_late = json!({"level": 0.0, "reviewed": 200});
        assert_eq!(resolve_progress(&reviewed_early, &reviewed_late), Winner::Second);

        let low = json!({"level": 1.0, "reviewed": 100});
        let high = json!({"level": 2.0, "reviewed": 100});
        assert_eq!(resolve_progress(&high, &low), Winner::First);
        assert_eq!(resolve_progress(&low, &high), Winner::Second);
    }
}
