//! Input normalization for card and note fields.
//!
//! Malformed input is normalized rather than rejected:
//! - text is converted to Unicode NFC so visually identical strings compare equal
//! - keyword and tag lists are trimmed, emptied entries dropped, duplicates removed
//!   (first occurrence wins, order otherwise kept)

use std::collections::HashSet;
use unicode_normalization::UnicodeNormalization;

/// Canonical (NFC) form of a text field
pub fn normalize_text(s: &str) -> String {
  s.nfc().collect()
}

/// Canonical form of a keyword/tag set
pub fn normalize_terms(terms: &[String]) -> Vec<String> {
  let mut seen = HashSet::new();
  terms
    .iter()
    .map(|term| normalize_text(term.trim()))
    .filter(|term| !term.is_empty())
    .filter(|term| seen.insert(term.clone()))
    .collect()
}
