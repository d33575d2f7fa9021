//! Review session state machine.
//!
//! `review_reducer` is a pure function from state and action to the next
//! state. Everything random (card selection seeds) and everything time based
//! (the review time) arrives inside the actions, so replaying the same actions
//! always yields the same session.
//!
//! Phases: `Idle -> Loading -> Question <-> Answer -> Complete`. Changing the
//! review time or limits during or after a review goes back to `Loading`, so
//! a finished review can be extended.
//!
//! The card being shown stays in its queue (heap or one of the failed queues)
//! until it is answered. Failed cards need two more passes: a fail puts the
//! card in failed level 2, a pass from there moves it to failed level 1, and a
//! pass from level 1 completes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::card_selector::select_card;
use super::interval;
use crate::domain::{AvailableCards, Card};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPhase {
  #[default]
  Idle,
  Loading,
  Question,
  Answer,
  Complete,
}

impl ReviewPhase {
  /// A review is under way (cards loading or being shown)
  pub fn is_active(&self) -> bool {
    matches!(self, Self::Loading | Self::Question | Self::Answer)
  }

  pub fn is_showing_card(&self) -> bool {
    matches!(self, Self::Question | Self::Answer)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewState {
  pub phase: ReviewPhase,
  /// Instant used for overdueness and recorded as the review time of answers
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub review_time: DateTime<Utc>,
  pub max_cards: u32,
  pub max_new_cards: u32,
  pub completed: u32,
  pub new_cards_in_play: u32,
  /// Fetched cards not yet answered
  pub heap: Vec<Card>,
  /// Failed, then passed once; one more pass completes them
  pub failed_cards_level1: Vec<Card>,
  /// Most recently failed
  pub failed_cards_level2: Vec<Card>,
  /// Answered cards, most recent last
  pub history: Vec<Card>,
  pub current_card: Option<Card>,
  pub next_card: Option<Card>,
  pub available_cards: Option<AvailableCards>,
  pub loading_available_cards: bool,
  pub saving_progress: bool,
}

impl ReviewState {
  pub fn new(max_cards: u32, max_new_cards: u32, review_time: DateTime<Utc>) -> Self {
    Self {
      phase: ReviewPhase::Idle,
      review_time,
      max_cards,
      max_new_cards,
      completed: 0,
      new_cards_in_play: 0,
      heap: Vec::new(),
      failed_cards_level1: Vec::new(),
      failed_cards_level2: Vec::new(),
      history: Vec::new(),
      current_card: None,
      next_card: None,
      available_cards: None,
      loading_available_cards: false,
      saving_progress: false,
    }
  }

  /// Selection candidates in priority order
  pub fn pool(&self) -> Vec<&Card> {
    self
      .failed_cards_level2
      .iter()
      .chain(&self.failed_cards_level1)
      .chain(&self.heap)
      .collect()
  }

  pub fn current_id(&self) -> Option<&str> {
    self.current_card.as_ref().map(|c| c.id.as_str())
  }

  /// Whether the card appears anywhere in the session
  pub fn contains_card(&self, id: &str) -> bool {
    self.current_id() == Some(id)
      || self.next_card.as_ref().is_some_and(|c| c.id == id)
      || self.heap.iter().any(|c| c.id == id)
      || self.failed_cards_level1.iter().any(|c| c.id == id)
      || self.failed_cards_level2.iter().any(|c| c.id == id)
      || self.history.iter().any(|c| c.id == id)
  }

  /// Heap size the review has room for
  fn heap_capacity(&self) -> u32 {
    self
      .max_cards
      .saturating_sub(self.completed)
      .saturating_sub(self.failed_cards_level1.len() as u32)
      .saturating_sub(self.failed_cards_level2.len() as u32)
  }

  fn current_in_heap(&self) -> Option<&Card> {
    let id = self.current_id()?;
    self.heap.iter().find(|c| c.id == id)
  }

  /// Unfilled heap slots
  pub fn cards_needed(&self) -> u32 {
    self.heap_capacity().saturating_sub(self.heap.len() as u32)
  }

  /// Cards to fetch when rebuilding the heap around the current card
  pub fn heap_fetch_limit(&self) -> u32 {
    self
      .heap_capacity()
      .saturating_sub(self.current_in_heap().is_some() as u32)
  }

  /// New cards to fetch when rebuilding the heap around the current card
  pub fn new_card_fetch_limit(&self) -> u32 {
    let queued = count_new(&self.heap) as u32;
    let answered = self.new_cards_in_play.saturating_sub(queued);
    let current_new = self.current_in_heap().is_some_and(|c| c.progress.is_new());
    self
      .max_new_cards
      .saturating_sub(answered)
      .saturating_sub(current_new as u32)
  }
}

fn random_seed() -> f64 {
  rand::random()
}

fn now() -> DateTime<Utc> {
  Utc::now()
}

/// Everything that can change a review session. Seeds default to fresh random
/// values when omitted from serialized input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewAction {
  NewReview {
    max_cards: u32,
    max_new_cards: u32,
    #[serde(default = "now", with = "chrono::serde::ts_milliseconds")]
    review_time: DateTime<Utc>,
  },
  ReviewLoaded {
    cards: Vec<Card>,
    /// Replacement queues when resuming a stored review
    #[serde(default)]
    history: Option<Vec<Card>>,
    #[serde(default)]
    failed_cards_level1: Option<Vec<Card>>,
    #[serde(default)]
    failed_cards_level2: Option<Vec<Card>>,
    #[serde(default)]
    completed: Option<u32>,
    #[serde(default = "random_seed")]
    next_card_seed: f64,
    #[serde(default = "random_seed")]
    current_card_seed: f64,
    /// First load of a session; an empty result means "nothing to review"
    #[serde(default)]
    initial_review: bool,
  },
  ShowAnswer,
  PassCard {
    #[serde(default = "random_seed")]
    next_card_seed: f64,
  },
  FailCard {
    #[serde(default = "random_seed")]
    next_card_seed: f64,
  },
  UpdateReviewCard {
    card: Card,
    #[serde(default = "random_seed")]
    next_card_seed: f64,
  },
  DeleteReviewCard {
    id: String,
    #[serde(default = "random_seed")]
    next_card_seed: f64,
  },
  SetReviewTime {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    review_time: DateTime<Utc>,
  },
  SetReviewLimit {
    max_cards: u32,
    max_new_cards: u32,
  },
  CancelReview,
  FinishSave,
  QueryAvailableCards,
  UpdateAvailableCards {
    available_cards: AvailableCards,
  },
}

impl ReviewAction {
  pub fn name(&self) -> &'static str {
    match self {
      Self::NewReview { .. } => "NEW_REVIEW",
      Self::ReviewLoaded { .. } => "REVIEW_LOADED",
      Self::ShowAnswer => "SHOW_ANSWER",
      Self::PassCard { .. } => "PASS_CARD",
      Self::FailCard { .. } => "FAIL_CARD",
      Self::UpdateReviewCard { .. } => "UPDATE_REVIEW_CARD",
      Self::DeleteReviewCard { .. } => "DELETE_REVIEW_CARD",
      Self::SetReviewTime { .. } => "SET_REVIEW_TIME",
      Self::SetReviewLimit { .. } => "SET_REVIEW_LIMIT",
      Self::CancelReview => "CANCEL_REVIEW",
      Self::FinishSave => "FINISH_SAVE",
      Self::QueryAvailableCards => "QUERY_AVAILABLE_CARDS",
      Self::UpdateAvailableCards { .. } => "UPDATE_AVAILABLE_CARDS",
    }
  }

  /// Actions a user may dispatch; the rest come from the store side
  pub fn is_user_action(&self) -> bool {
    matches!(
      self,
      Self::NewReview { .. }
        | Self::ShowAnswer
        | Self::PassCard { .. }
        | Self::FailCard { .. }
        | Self::SetReviewTime { .. }
        | Self::SetReviewLimit { .. }
        | Self::CancelReview
        | Self::QueryAvailableCards
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Answer {
  Pass,
  Fail,
}

pub fn review_reducer(state: ReviewState, action: &ReviewAction) -> ReviewState {
  match action {
    ReviewAction::NewReview {
      max_cards,
      max_new_cards,
      review_time,
    } => ReviewState {
      phase: ReviewPhase::Loading,
      available_cards: state.available_cards,
      loading_available_cards: state.loading_available_cards,
      ..ReviewState::new(*max_cards, *max_new_cards, *review_time)
    },

    ReviewAction::ReviewLoaded {
      cards,
      history,
      failed_cards_level1,
      failed_cards_level2,
      completed,
      next_card_seed,
      current_card_seed,
      initial_review,
    } => review_loaded(
      state,
      LoadedCards {
        cards,
        history: history.as_deref(),
        failed_cards_level1: failed_cards_level1.as_deref(),
        failed_cards_level2: failed_cards_level2.as_deref(),
        completed: *completed,
      },
      *next_card_seed,
      *current_card_seed,
      *initial_review,
    ),

    ReviewAction::ShowAnswer => {
      let mut state = state;
      if state.phase == ReviewPhase::Question {
        state.phase = ReviewPhase::Answer;
      }
      state
    }

    ReviewAction::PassCard { next_card_seed } => answer_card(state, Answer::Pass, *next_card_seed),
    ReviewAction::FailCard { next_card_seed } => answer_card(state, Answer::Fail, *next_card_seed),

    ReviewAction::UpdateReviewCard { card, .. } => update_review_card(state, card),
    ReviewAction::DeleteReviewCard { id, next_card_seed } => {
      delete_review_card(state, id, *next_card_seed)
    }

    ReviewAction::SetReviewTime { review_time } => {
      let mut state = state;
      state.review_time = *review_time;
      reload_if_started(state)
    }

    ReviewAction::SetReviewLimit {
      max_cards,
      max_new_cards,
    } => {
      let mut state = state;
      state.max_cards = *max_cards;
      state.max_new_cards = *max_new_cards;
      reload_if_started(state)
    }

    ReviewAction::CancelReview => {
      if !state.phase.is_active() {
        return state;
      }
      ReviewState {
        available_cards: state.available_cards,
        loading_available_cards: state.loading_available_cards,
        ..ReviewState::new(state.max_cards, state.max_new_cards, state.review_time)
      }
    }

    ReviewAction::FinishSave => ReviewState {
      saving_progress: false,
      ..state
    },

    ReviewAction::QueryAvailableCards => ReviewState {
      loading_available_cards: true,
      ..state
    },

    ReviewAction::UpdateAvailableCards { available_cards } => ReviewState {
      available_cards: Some(*available_cards),
      loading_available_cards: false,
      ..state
    },
  }
}

struct LoadedCards<'a> {
  cards: &'a [Card],
  history: Option<&'a [Card]>,
  failed_cards_level1: Option<&'a [Card]>,
  failed_cards_level2: Option<&'a [Card]>,
  completed: Option<u32>,
}

fn review_loaded(
  mut state: ReviewState,
  loaded: LoadedCards<'_>,
  next_card_seed: f64,
  current_card_seed: f64,
  initial_review: bool,
) -> ReviewState {
  if !state.phase.is_active() {
    return state;
  }

  if let Some(history) = loaded.history {
    state.history = history.to_vec();
  }
  if let Some(failed) = loaded.failed_cards_level1 {
    state.failed_cards_level1 = failed.to_vec();
  }
  if let Some(failed) = loaded.failed_cards_level2 {
    state.failed_cards_level2 = failed.to_vec();
  }
  if let Some(completed) = loaded.completed {
    state.completed = completed;
  }

  // Cards already in play are never queued twice
  let current_id = state.current_id().map(str::to_string);
  let in_play: HashSet<String> = state
    .failed_cards_level1
    .iter()
    .chain(&state.failed_cards_level2)
    .chain(&state.history)
    .map(|c| c.id.clone())
    .chain(current_id.clone())
    .collect();

  // The shown card keeps its place in the heap
  let mut heap: Vec<Card> = state
    .heap
    .iter()
    .filter(|c| Some(&c.id) == current_id.as_ref())
    .cloned()
    .collect();
  for card in loaded.cards {
    if !in_play.contains(&card.id) && !heap.iter().any(|c| c.id == card.id) {
      heap.push(card.clone());
    }
  }
  replace_heap(&mut state, heap);

  let had_current = state.current_card.is_some();
  if !had_current {
    state.current_card = select_card(&state.pool(), current_card_seed, None).cloned();
  }
  state.next_card = select_card(&state.pool(), next_card_seed, state.current_id()).cloned();

  if state.current_card.is_some() {
    if !had_current || !state.phase.is_showing_card() {
      state.phase = ReviewPhase::Question;
    }
  } else {
    state.next_card = None;
    state.phase = if initial_review {
      ReviewPhase::Idle
    } else {
      ReviewPhase::Complete
    };
  }
  state
}

fn answer_card(mut state: ReviewState, answer: Answer, next_card_seed: f64) -> ReviewState {
  if !state.phase.is_showing_card() {
    return state;
  }
  let Some(mut card) = state.current_card.clone() else {
    return state;
  };
  let id = card.id.clone();
  let review_time = state.review_time;

  match answer {
    Answer::Pass => {
      if remove_by_id(&mut state.failed_cards_level2, &id).is_some() {
        card.progress = interval::passed_once_after_failure(card.progress, review_time);
        state.failed_cards_level1.push(card.clone());
      } else {
        if remove_by_id(&mut state.failed_cards_level1, &id).is_none() {
          remove_by_id(&mut state.heap, &id);
        }
        card.progress = interval::passed(card.progress, review_time);
        state.completed += 1;
      }
    }
    Answer::Fail => {
      remove_by_id(&mut state.failed_cards_level1, &id);
      remove_by_id(&mut state.failed_cards_level2, &id);
      remove_by_id(&mut state.heap, &id);
      card.progress = interval::failed(review_time);
      state.failed_cards_level2.push(card.clone());
    }
  }

  remove_by_id(&mut state.history, &id);
  state.history.push(card);
  state.saving_progress = true;

  state.current_card = state.next_card.take();
  update_next_card(&mut state, next_card_seed);
  if state.current_card.is_some() {
    state.phase = ReviewPhase::Question;
  }
  state
}

/// Pick a fresh next card. Without a current card the pick is promoted to
/// current (and another next is picked); with nothing left the review is
/// complete.
fn update_next_card(state: &mut ReviewState, seed: f64) {
  state.next_card = select_card(&state.pool(), seed, state.current_id()).cloned();

  if state.current_card.is_none() {
    match state.next_card.take() {
      Some(next) => {
        state.current_card = Some(next);
        state.next_card = select_card(&state.pool(), seed, state.current_id()).cloned();
      }
      None => state.phase = ReviewPhase::Complete,
    }
  }
}

fn update_review_card(mut state: ReviewState, card: &Card) -> ReviewState {
  let replace = |slot: &mut Card| {
    if slot.id == card.id {
      *slot = card.clone();
    }
  };

  state.current_card.iter_mut().for_each(replace);
  state.next_card.iter_mut().for_each(replace);
  state.heap.iter_mut().for_each(replace);
  state.failed_cards_level1.iter_mut().for_each(replace);
  state.failed_cards_level2.iter_mut().for_each(replace);
  state.history.iter_mut().for_each(replace);
  state
}

fn delete_review_card(mut state: ReviewState, id: &str, next_card_seed: f64) -> ReviewState {
  remove_by_id(&mut state.heap, id);
  remove_by_id(&mut state.failed_cards_level1, id);
  remove_by_id(&mut state.failed_cards_level2, id);
  remove_by_id(&mut state.history, id);

  let was_current = state.current_id() == Some(id);
  let was_next = state.next_card.as_ref().is_some_and(|c| c.id == id);
  if !was_current && !was_next {
    return state;
  }

  if state.phase == ReviewPhase::Loading {
    // Selection happens once the cards arrive
    if was_current {
      state.current_card = None;
    }
    state.next_card = None;
    return state;
  }

  if was_current {
    state.current_card = state.next_card.take();
    update_next_card(&mut state, next_card_seed);
    if state.current_card.is_some() {
      state.phase = ReviewPhase::Question;
    }
  } else {
    update_next_card(&mut state, next_card_seed);
  }
  state
}

/// Go back to loading with an emptied heap once a review has been started
fn reload_if_started(mut state: ReviewState) -> ReviewState {
  if state.phase == ReviewPhase::Idle {
    return state;
  }
  let current_id = state.current_id().map(str::to_string);
  let kept: Vec<Card> = state
    .heap
    .iter()
    .filter(|c| Some(&c.id) == current_id.as_ref())
    .cloned()
    .collect();
  replace_heap(&mut state, kept);
  state.next_card = None;
  state.phase = ReviewPhase::Loading;
  state
}

/// Swap the heap, keeping `new_cards_in_play` in step with the new cards it holds
fn replace_heap(state: &mut ReviewState, heap: Vec<Card>) {
  let before = count_new(&state.heap) as i64;
  let after = count_new(&heap) as i64;
  state.new_cards_in_play = (state.new_cards_in_play as i64 + after - before).max(0) as u32;
  state.heap = heap;
}

fn count_new(cards: &[Card]) -> usize {
  cards.iter().filter(|c| c.progress.is_new()).count()
}

fn remove_by_id(cards: &mut Vec<Card>, id: &str) -> Option<Card> {
  let index = cards.iter().position(|c| c.id == id)?;
  Some(cards.remove(index))
}
