use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form note linked to cards through shared keywords
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
  pub id: String,
  pub content: String,
  #[serde(default)]
  pub keywords: Vec<String>,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub created: DateTime<Utc>,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub modified: DateTime<Utc>,
}

/// Partial note; no `id` means "create"
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NotePatch {
  #[serde(default)]
  pub id: Option<String>,
  #[serde(default)]
  pub content: Option<String>,
  #[serde(default)]
  pub keywords: Option<Vec<String>>,
}

impl Note {
  /// Case-insensitive keyword overlap with a card
  pub fn matches_keywords(&self, keywords: &[String]) -> bool {
    self.keywords.iter().any(|own| {
      let own = own.to_lowercase();
      keywords.iter().any(|k| k.to_lowercase() == own)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_matches_keywords_case_insensitive() {
    let now = Utc::now();
    let note = Note {
      id: "n1".into(),
      content: "About 犬".into(),
      keywords: vec!["Dog".into(), "犬".into()],
      created: now,
      modified: now,
    };
    assert!(note.matches_keywords(&["dog".to_string()]));
    assert!(note.matches_keywords(&["犬".to_string()]));
    assert!(!note.matches_keywords(&["cat".to_string()]));
    assert!(!note.matches_keywords(&[]));
  }
}
