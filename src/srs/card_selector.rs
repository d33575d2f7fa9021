//! Card selection for review sessions.
//!
//! The candidate pool is the concatenation `failed level 2 ++ failed level 1 ++
//! heap`. A seed in `[0, 1)` picks an index in that space. Failed cards are
//! not weighted explicitly; as the heap drains they simply take up a growing
//! share of the index space and so come back more often.
//!
//! When the pick lands on the card that is currently shown, the neighbouring
//! index is used instead (the previous one when at the end of the pool). A
//! pool holding only the current card yields nothing.

use crate::domain::Card;

/// Index picked by `seed` in a pool of `len` cards
pub fn seed_index(seed: f64, len: usize) -> usize {
  if len == 0 {
    return 0;
  }
  // Negative and NaN seeds saturate to 0
  ((seed * len as f64).floor() as usize).min(len - 1)
}

/// Pick a card from `pool`, avoiding the card with id `avoid`
pub fn select_card<'a>(pool: &[&'a Card], seed: f64, avoid: Option<&str>) -> Option<&'a Card> {
  if pool.is_empty() {
    return None;
  }

  let mut index = seed_index(seed, pool.len());
  if avoid == Some(pool[index].id.as_str()) {
    if pool.len() == 1 {
      return None;
    }
    index = if index == pool.len() - 1 { index - 1 } else { index + 1 };
  }
  Some(pool[index])
}
