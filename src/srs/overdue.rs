//! Overdueness ranking for due cards.
//!
//! `score = days_overdue / level + (e^(k * days_overdue) - 1)`
//!
//! The linear term favours small-interval cards that are proportionally very
//! overdue. The exponential term lets extremely stale high-level cards catch up
//! regardless of level: with `k = 0.00225` a level-365 card half a year overdue
//! barely exceeds a level-1 card one day overdue.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use crate::domain::{Progress, MS_PER_DAY};

/// Growth rate of the exponential term
pub const OVERDUE_GROWTH: f64 = 0.00225;

/// Days between `due` and `review_time` (negative when not yet due)
pub fn days_overdue(review_time: DateTime<Utc>, due: DateTime<Utc>) -> f64 {
  (review_time - due).num_milliseconds() as f64 / MS_PER_DAY as f64
}

/// Urgency of a due card. A failed card (level 0) is maximally urgent.
pub fn overdueness(review_time: DateTime<Utc>, due: DateTime<Utc>, level: f64) -> f64 {
  if level <= 0.0 {
    return f64::INFINITY;
  }
  let days = days_overdue(review_time, due);
  days / level + ((OVERDUE_GROWTH * days).exp() - 1.0)
}

/// Score of a progress record, `None` for new or not-yet-due cards
pub fn progress_score(review_time: DateTime<Utc>, progress: &Progress) -> Option<f64> {
  let due = progress.due()?;
  if due > review_time {
    return None;
  }
  Some(overdueness(review_time, due, progress.level))
}

/// Stable descending sort by score
pub fn rank_by_overdueness<T>(items: &mut [(f64, T)]) {
  items.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration, TimeZone};

  fn now() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
  }

  fn days_ago(days: f64) -> DateTime<Utc> {
    now() - Duration::milliseconds((days * MS_PER_DAY as f64) as i64)
  }

  #[test]
  fn test_score_monotonic_in_elapsed_time() {
    let mut previous = f64::NEG_INFINITY;
    for days in [0.0, 0.5, 1.0, 2.0, 10.0, 100.0, 1000.0] {
      let score = overdueness(now(), days_ago(days), 3.0);
      assert!(score > previous, "score not increasing at {} days", days);
      previous = score;
    }
  }

  #[test]
  fn test_same_level_more_overdue_ranks_higher() {
    let two_days = overdueness(now(), days_ago(2.0), 1.0);
    let two_hundred_days = overdueness(now(), days_ago(200.0), 1.0);
    assert!(two_hundred_days > two_days);
  }

  #[test]
  fn test_exponential_term_calibration() {
    // A level-365 card half a year overdue barely beats a level-1 card one day overdue
    let stale = overdueness(now(), days_ago(182.5), 365.0);
    let fresh = overdueness(now(), days_ago(1.0), 1.0);
    assert!(stale > fresh);
    assert!(stale - fresh < 0.1);
  }

  #[test]
  fn test_ranking_example() {
    let mut cards = vec![
      (overdueness(now(), days_ago(1.0), 1.0), "1d/1"),
      (overdueness(now(), days_ago(2.1), 2.0), "2.1d/2"),
      (overdueness(now(), days_ago(12.0), 8.0), "12d/8"),
      (overdueness(now(), days_ago(200.0), 20.0), "200d/20"),
    ];
    rank_by_overdueness(&mut cards);
    let order: Vec<&str> = cards.iter().map(|(_, name)| *name).collect();
    assert_eq!(order, vec!["200d/20", "12d/8", "2.1d/2", "1d/1"]);
  }

  #[test]
  fn test_failed_card_is_most_urgent() {
    assert_eq!(overdueness(now(), now(), 0.0), f64::INFINITY);
  }

  #[test]
  fn test_progress_score_skips_new_and_future() {
    assert!(progress_score(now(), &Progress::default()).is_none());

    let future = Progress {
      level: 10.0,
      reviewed: Some(days_ago(1.0)),
    };
    assert!(progress_score(now(), &future).is_none());

    let due = Progress {
      level: 1.0,
      reviewed: Some(days_ago(3.0)),
    };
    let score = progress_score(now(), &due).unwrap();
    assert!((score - (2.0 + ((OVERDUE_GROWTH * 2.0).exp() - 1.0))).abs() < 1e-6);
  }
}
