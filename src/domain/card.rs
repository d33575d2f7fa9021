use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const MS_PER_DAY: i64 = 86_400_000;

/// Review progress of a card
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
  /// Interval in days before the card is due again (0 = new or failed)
  pub level: f64,
  /// When the card was last answered
  #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
  pub reviewed: Option<DateTime<Utc>>,
}

impl Default for Progress {
  fn default() -> Self {
    Self {
      level: 0.0,
      reviewed: None,
    }
  }
}

impl Progress {
  /// Never successfully reviewed and never answered
  pub fn is_new(&self) -> bool {
    self.level == 0.0 && self.reviewed.is_none()
  }

  /// Answered at least once but reset to level 0
  pub fn is_failed(&self) -> bool {
    self.level == 0.0 && self.reviewed.is_some()
  }

  /// `reviewed + level days`; new cards have no due time
  pub fn due(&self) -> Option<DateTime<Utc>> {
    self
      .reviewed
      .map(|reviewed| reviewed + Duration::milliseconds((self.level * MS_PER_DAY as f64).round() as i64))
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
  pub id: String,
  pub front: String,
  pub back: String,
  #[serde(default)]
  pub keywords: Vec<String>,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default)]
  pub starred: bool,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub created: DateTime<Utc>,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub modified: DateTime<Utc>,
  #[serde(default)]
  pub progress: Progress,
}

/// Partial card used for creation (no `id`) and field-wise updates
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CardPatch {
  #[serde(default)]
  pub id: Option<String>,
  #[serde(default)]
  pub front: Option<String>,
  #[serde(default)]
  pub back: Option<String>,
  #[serde(default)]
  pub keywords: Option<Vec<String>>,
  #[serde(default)]
  pub tags: Option<Vec<String>>,
  #[serde(default)]
  pub starred: Option<bool>,
  #[serde(default)]
  pub progress: Option<ProgressPatch>,
}

impl CardPatch {
  /// True when any field stored in the card document is supplied
  pub fn touches_card(&self) -> bool {
    self.front.is_some()
      || self.back.is_some()
      || self.keywords.is_some()
      || self.tags.is_some()
      || self.starred.is_some()
  }
}

impl From<&Card> for CardPatch {
  fn from(card: &Card) -> Self {
    Self {
      id: Some(card.id.clone()),
      front: Some(card.front.clone()),
      back: Some(card.back.clone()),
      keywords: Some(card.keywords.clone()),
      tags: Some(card.tags.clone()),
      starred: Some(card.starred),
      progress: Some(ProgressPatch::from(card.progress)),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct ProgressPatch {
  #[serde(default)]
  pub level: Option<f64>,
  /// `Some(None)` clears the review time; absent leaves it alone
  #[serde(default, deserialize_with = "deserialize_reviewed")]
  pub reviewed: Option<Option<DateTime<Utc>>>,
}

impl From<Progress> for ProgressPatch {
  fn from(progress: Progress) -> Self {
    Self {
      level: Some(progress.level),
      reviewed: Some(progress.reviewed),
    }
  }
}

impl ProgressPatch {
  pub fn apply_to(&self, progress: Progress) -> Progress {
    Progress {
      level: self.level.unwrap_or(progress.level).max(0.0),
      reviewed: self.reviewed.unwrap_or(progress.reviewed),
    }
  }
}

fn deserialize_reviewed<'de, D>(deserializer: D) -> Result<Option<Option<DateTime<Utc>>>, D::Error>
where
  D: Deserializer<'de>,
{
  let millis = Option::<i64>::deserialize(deserializer)?;
  Ok(Some(millis.and_then(DateTime::from_timestamp_millis)))
}

/// Counts shown on the review badge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableCards {
  pub new_cards: usize,
  pub overdue_cards: usize,
}
