//! Progress updates for review answers.
//!
//! A pass sets the interval to at least double the time since the last review,
//! never shrinking it and never going below half a day. A failure resets the
//! interval to zero.

use chrono::{DateTime, Utc};

use crate::domain::{Progress, MS_PER_DAY};

/// Shortest interval granted by a pass
pub const MIN_INTERVAL_DAYS: f64 = 0.5;

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
  (to - from).num_milliseconds() as f64 / MS_PER_DAY as f64
}

/// Progress after a card is passed for good
pub fn passed(previous: Progress, review_time: DateTime<Utc>) -> Progress {
  let level = match previous.reviewed {
    None => MIN_INTERVAL_DAYS,
    Some(reviewed) => {
      let elapsed = days_between(reviewed, review_time);
      previous.level.max(2.0 * elapsed).max(MIN_INTERVAL_DAYS)
    }
  };
  Progress {
    level,
    reviewed: Some(review_time),
  }
}

/// Progress after a failed card is passed once; it still needs another pass
pub fn passed_once_after_failure(previous: Progress, review_time: DateTime<Utc>) -> Progress {
  Progress {
    level: previous.level,
    reviewed: Some(review_time),
  }
}

/// Progress after a card is failed
pub fn failed(review_time: DateTime<Utc>) -> Progress {
  Progress {
    level: 0.0,
    reviewed: Some(review_time),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration, TimeZone};

  fn now() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
  }

  #[test]
  fn test_never_reviewed_gets_half_day() {
    let progress = passed(Progress::default(), now());
    assert_eq!(progress.level, 0.5);
    assert_eq!(progress.reviewed, Some(now()));
  }

  #[test]
  fn test_pass_doubles_elapsed_time() {
    let previous = Progress {
      level: 2.0,
      reviewed: Some(now() - Duration::days(3)),
    };
    assert_eq!(passed(previous, now()).level, 6.0);
  }

  #[test]
  fn test_pass_never_shrinks_level() {
    let previous = Progress {
      level: 10.0,
      reviewed: Some(now() - Duration::days(1)),
    };
    assert_eq!(passed(previous, now()).level, 10.0);
  }

  #[test]
  fn test_pass_soon_after_failure_gets_minimum() {
    let previous = Progress {
      level: 0.0,
      reviewed: Some(now() - Duration::minutes(5)),
    };
    assert_eq!(passed(previous, now()).level, MIN_INTERVAL_DAYS);
  }

  #[test]
  fn test_fail_resets_level() {
    let progress = failed(now());
    assert_eq!(progress.level, 0.0);
    assert!(progress.is_failed());
  }

  #[test]
  fn test_first_pass_after_failure_keeps_level() {
    let progress = passed_once_after_failure(failed(now() - Duration::minutes(1)), now());
    assert_eq!(progress.level, 0.0);
    assert_eq!(progress.reviewed, Some(now()));
  }
}
