use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::card::Progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
  Pass,
  Fail,
}

/// One answered card in a review summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
  pub card_id: String,
  pub outcome: ReviewOutcome,
  /// Progress before the answer was recorded
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub previous_progress: Option<Progress>,
}

/// Persisted snapshot of a review, used to resume it and to merge it
/// across devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSummary {
  pub max_cards: u32,
  pub max_new_cards: u32,
  #[serde(default)]
  pub history: Vec<HistoryEntry>,
  #[serde(default)]
  pub finished: bool,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub modified: DateTime<Utc>,
}

/// Session queues rebuilt from a summary's history
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayedReview {
  pub completed: u32,
  /// Answered card ids, most recent last, each id once
  pub history: Vec<String>,
  pub failed_cards_level1: Vec<String>,
  pub failed_cards_level2: Vec<String>,
}

impl ReplayedReview {
  /// Every card id the resumed session needs to fetch
  pub fn card_ids(&self) -> Vec<String> {
    let mut ids = self.history.clone();
    for id in self.failed_cards_level1.iter().chain(&self.failed_cards_level2) {
      if !ids.contains(id) {
        ids.push(id.clone());
      }
    }
    ids
  }
}

impl ReviewSummary {
  pub fn new(max_cards: u32, max_new_cards: u32) -> Self {
    Self {
      max_cards,
      max_new_cards,
      history: Vec::new(),
      finished: false,
      modified: Utc::now(),
    }
  }

  pub fn record(&mut self, card_id: &str, outcome: ReviewOutcome, previous_progress: Progress) {
    self.history.push(HistoryEntry {
      card_id: card_id.to_string(),
      outcome,
      previous_progress: Some(previous_progress),
    });
  }

  /// Walk the history applying the same failed-queue rules as a live session
  pub fn replay(&self) -> ReplayedReview {
    let mut replayed = ReplayedReview::default();

    for entry in &self.history {
      let id = &entry.card_id;
      match entry.outcome {
        ReviewOutcome::Fail => {
          replayed.failed_cards_level1.retain(|c| c != id);
          replayed.failed_cards_level2.retain(|c| c != id);
          replayed.failed_cards_level2.push(id.clone());
        }
        ReviewOutcome::Pass => {
          if let Some(pos) = replayed.failed_cards_level2.iter().position(|c| c == id) {
            replayed.failed_cards_level2.remove(pos);
            replayed.failed_cards_level1.push(id.clone());
          } else if let Some(pos) = replayed.failed_cards_level1.iter().position(|c| c == id) {
            replayed.failed_cards_level1.remove(pos);
            replayed.completed += 1;
          } else {
            replayed.completed += 1;
          }
        }
      }
      replayed.history.retain(|c| c != id);
      replayed.history.push(id.clone());
    }

    replayed
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn summary(entries: &[(&str, ReviewOutcome)]) -> ReviewSummary {
    let mut summary = ReviewSummary::new(10, 2);
    for (id, outcome) in entries {
      summary.record(id, *outcome, Progress::default());
    }
    summary
  }

  #[test]
  fn test_replay_pass_completes() {
    let replayed = summary(&[("a", ReviewOutcome::Pass), ("b", ReviewOutcome::Pass)]).replay();
    assert_eq!(replayed.completed, 2);
    assert_eq!(replayed.history, vec!["a", "b"]);
    assert!(replayed.failed_cards_level1.is_empty());
    assert!(replayed.failed_cards_level2.is_empty());
  }

  #[test]
  fn test_replay_failed_card_needs_two_passes() {
    let replayed = summary(&[
      ("a", ReviewOutcome::Fail),
      ("b", ReviewOutcome::Pass),
      ("a", ReviewOutcome::Pass),
    ])
    .replay();
    assert_eq!(replayed.completed, 1);
    assert_eq!(replayed.failed_cards_level1, vec!["a"]);
    assert!(replayed.failed_cards_level2.is_empty());
    assert_eq!(replayed.history, vec!["b", "a"]);

    let replayed = summary(&[
      ("a", ReviewOutcome::Fail),
      ("a", ReviewOutcome::Pass),
      ("a", ReviewOutcome::Pass),
    ])
    .replay();
    assert_eq!(replayed.completed, 1);
    assert!(replayed.failed_cards_level1.is_empty());
  }

  #[test]
  fn test_replay_fail_from_level1_returns_to_level2() {
    let replayed = summary(&[
      ("a", ReviewOutcome::Fail),
      ("a", ReviewOutcome::Pass),
      ("a", ReviewOutcome::Fail),
    ])
    .replay();
    assert!(replayed.failed_cards_level1.is_empty());
    assert_eq!(replayed.failed_cards_level2, vec!["a"]);
    assert_eq!(replayed.card_ids(), vec!["a"]);
  }

  #[test]
  fn test_summary_round_trips_through_json() {
    let original = summary(&[("a", ReviewOutcome::Fail)]);
    let json = serde_json::to_string(&original).unwrap();
    let parsed: ReviewSummary = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.history[0].outcome, ReviewOutcome::Fail);
    assert_eq!(parsed.modified.timestamp_millis(), original.modified.timestamp_millis());
  }
}
