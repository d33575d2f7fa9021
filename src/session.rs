//! Review session runner.
//!
//! A tokio task owns the `ReviewState`. User actions and card change events
//! share one channel and are reduced strictly in arrival order; each new state
//! is published on a watch channel. Store reads and progress saves run on
//! blocking tasks and report back as further actions.
//!
//! Progress saves are optimistic: a failed write is logged and the session
//! carries on as if it had succeeded.
//!
//! The running review is mirrored into the stored summary so it can be resumed
//! after a restart. Summaries that arrive from a sync peer take over the local
//! review: a finished one cancels it, an unfinished one is replayed.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config;
use crate::db::{
  CardChange, CardChangeFeed, CardKind, CardQuery, CardStore, LogOnError, ReviewSyncFeed,
  StoreResult, Stores,
};
use crate::domain::{Card, CardPatch, ReplayedReview, ReviewOutcome, ReviewSummary};
use crate::srs::{review_reducer, ReviewAction, ReviewPhase, ReviewState};

enum SessionEvent {
  Action(ReviewAction),
  CardChanged(CardChange),
  Refresh(RefreshKind),
  /// Unfinished summary found in the store at startup
  Resume(ReviewSummary),
  ReviewSynced(ReviewSummary),
}

enum SummaryWrite {
  Put(ReviewSummary),
  Finish,
}

/// Background fetches that are debounced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshKind {
  /// Badge counts shown while no review is running
  AvailableCards,
  /// Top up the heap of a running review
  ReviewCards,
}

impl RefreshKind {
  fn relevant(&self, state: &ReviewState) -> bool {
    match self {
      Self::AvailableCards => matches!(state.phase, ReviewPhase::Idle | ReviewPhase::Complete),
      Self::ReviewCards => state.phase.is_showing_card() && state.cards_needed() > 0,
    }
  }
}

/// Single pending refresh, restarted by every new trigger
#[derive(Default)]
struct Debouncer {
  pending: Option<(RefreshKind, JoinHandle<()>)>,
}

impl Debouncer {
  fn schedule(&mut self, kind: RefreshKind, delay: Duration, events: mpsc::WeakSender<SessionEvent>) {
    self.cancel();
    let handle = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      send_event(&events, SessionEvent::Refresh(kind)).await;
    });
    self.pending = Some((kind, handle));
  }

  fn pending(&self) -> Option<RefreshKind> {
    self.pending.as_ref().map(|(kind, _)| *kind)
  }

  fn cancel(&mut self) {
    if let Some((kind, handle)) = self.pending.take() {
      handle.abort();
      tracing::debug!("Cancelled pending {:?} refresh", kind);
    }
  }

  fn cancel_kind(&mut self, kind: RefreshKind) {
    if self.pending() == Some(kind) {
      self.cancel();
    }
  }

  /// The timer for `kind` fired
  fn fired(&mut self, kind: RefreshKind) {
    if self.pending() == Some(kind) {
      self.pending = None;
    }
  }
}

async fn send_event(events: &mpsc::WeakSender<SessionEvent>, event: SessionEvent) {
  if let Some(tx) = events.upgrade() {
    let _ = tx.send(event).await;
  }
}

/// Cards to fetch for (re)building a review heap
struct LoadRequest {
  review_time: DateTime<Utc>,
  limit: usize,
  new_limit: usize,
  exclude: HashSet<String>,
  resume: Option<ReplayedReview>,
  initial_review: bool,
}

impl LoadRequest {
  fn for_state(state: &ReviewState, initial_review: bool) -> Self {
    Self {
      review_time: state.review_time,
      limit: state.heap_fetch_limit() as usize,
      new_limit: state.new_card_fetch_limit() as usize,
      exclude: cards_in_play(state),
      resume: None,
      initial_review,
    }
  }

  fn for_resume(state: &ReviewState, summary: &ReviewSummary) -> Self {
    let replayed = summary.replay();
    let answered_new: HashSet<&str> = summary
      .history
      .iter()
      .filter(|entry| entry.previous_progress.is_some_and(|p| p.is_new()))
      .map(|entry| entry.card_id.as_str())
      .collect();

    let limit = summary
      .max_cards
      .saturating_sub(replayed.completed)
      .saturating_sub(replayed.failed_cards_level1.len() as u32)
      .saturating_sub(replayed.failed_cards_level2.len() as u32);
    let new_limit = summary.max_new_cards.saturating_sub(answered_new.len() as u32);

    let mut exclude = cards_in_play(state);
    exclude.extend(replayed.card_ids());

    Self {
      review_time: state.review_time,
      limit: limit as usize,
      new_limit: new_limit as usize,
      exclude,
      resume: Some(replayed),
      initial_review: true,
    }
  }

  fn fetch(&self, cards: &CardStore, kind: CardKind, limit: usize) -> StoreResult<Vec<Card>> {
    if limit == 0 {
      return Ok(Vec::new());
    }
    // Over-fetch so cards already in play don't eat into the limit
    let query = CardQuery::new(kind, self.review_time).limit(limit + self.exclude.len());
    Ok(
      cards
        .get_cards(&query)?
        .into_iter()
        .filter(|c| !self.exclude.contains(&c.id))
        .take(limit)
        .collect(),
    )
  }

  fn run(self, cards: &CardStore) -> StoreResult<ReviewAction> {
    let mut loaded = self.fetch(cards, CardKind::Overdue, self.limit)?;
    let new_limit = self.new_limit.min(self.limit - loaded.len());
    loaded.extend(self.fetch(cards, CardKind::New, new_limit)?);

    let (history, failed_cards_level1, failed_cards_level2, completed) = match &self.resume {
      Some(replayed) => (
        Some(cards.get_cards_by_id(&replayed.history)?),
        Some(cards.get_cards_by_id(&replayed.failed_cards_level1)?),
        Some(cards.get_cards_by_id(&replayed.failed_cards_level2)?),
        Some(replayed.completed),
      ),
      None => (None, None, None, None),
    };

    tracing::debug!("Loaded {} review cards", loaded.len());
    Ok(ReviewAction::ReviewLoaded {
      cards: loaded,
      history,
      failed_cards_level1,
      failed_cards_level2,
      completed,
      next_card_seed: rand::random(),
      current_card_seed: rand::random(),
      initial_review: self.initial_review,
    })
  }
}

fn cards_in_play(state: &ReviewState) -> HashSet<String> {
  state
    .history
    .iter()
    .chain(&state.failed_cards_level1)
    .chain(&state.failed_cards_level2)
    .chain(state.current_card.as_ref())
    .map(|c| c.id.clone())
    .collect()
}

fn empty_load(initial_review: bool) -> ReviewAction {
  ReviewAction::ReviewLoaded {
    cards: Vec::new(),
    history: None,
    failed_cards_level1: None,
    failed_cards_level2: None,
    completed: None,
    next_card_seed: rand::random(),
    current_card_seed: rand::random(),
    initial_review,
  }
}

struct SessionActor {
  stores: Stores,
  state: ReviewState,
  summary: Option<ReviewSummary>,
  events: mpsc::WeakSender<SessionEvent>,
  published: watch::Sender<ReviewState>,
  refresh: Debouncer,
  debounce: Duration,
  last_save: Option<JoinHandle<()>>,
  last_summary_write: Option<JoinHandle<()>>,
}

impl SessionActor {
  async fn run(mut self, mut rx: mpsc::Receiver<SessionEvent>) {
    self.resume();
    if self.state.phase == ReviewPhase::Idle {
      self.refresh_now(RefreshKind::AvailableCards);
    }
    self.publish();

    while let Some(event) = rx.recv().await {
      match event {
        SessionEvent::Action(action) => self.dispatch(action),
        SessionEvent::CardChanged(change) => self.card_changed(change),
        SessionEvent::Refresh(kind) => {
          self.refresh.fired(kind);
          if kind.relevant(&self.state) {
            self.refresh_now(kind);
          }
        }
        SessionEvent::Resume(summary) => {
          if self.state.phase == ReviewPhase::Idle {
            tracing::info!("Resuming review with {} answers", summary.history.len());
            self.start_from_summary(summary);
          }
        }
        SessionEvent::ReviewSynced(summary) => self.review_synced(summary),
      }
      self.publish();
    }

    self.refresh.cancel();
    tracing::debug!("Review session stopped");
  }

  fn publish(&self) {
    self.published.send_replace(self.state.clone());
  }

  fn dispatch(&mut self, action: ReviewAction) {
    let previous = self.state.clone();
    self.state = review_reducer(previous.clone(), &action);
    if self.state.phase != previous.phase {
      tracing::debug!("{}: {:?} -> {:?}", action.name(), previous.phase, self.state.phase);
    }

    match &action {
      ReviewAction::NewReview {
        max_cards,
        max_new_cards,
        ..
      } => {
        self.summary = Some(ReviewSummary::new(*max_cards, *max_new_cards));
        self.save_summary();
      }
      ReviewAction::PassCard { .. } => self.record_answer(&previous, ReviewOutcome::Pass),
      ReviewAction::FailCard { .. } => self.record_answer(&previous, ReviewOutcome::Fail),
      ReviewAction::SetReviewLimit {
        max_cards,
        max_new_cards,
      } if self.state.phase.is_active() => {
        if let Some(summary) = self.summary.as_mut() {
          summary.max_cards = *max_cards;
          summary.max_new_cards = *max_new_cards;
        }
        self.save_summary();
      }
      ReviewAction::SetReviewTime { .. } if self.state.phase == ReviewPhase::Idle => {
        self.refresh_now(RefreshKind::AvailableCards);
      }
      _ => {}
    }

    let reload = matches!(
      action,
      ReviewAction::NewReview { .. }
        | ReviewAction::SetReviewTime { .. }
        | ReviewAction::SetReviewLimit { .. }
    );
    if self.state.phase == ReviewPhase::Loading && reload {
      let initial_review = matches!(action, ReviewAction::NewReview { .. });
      self.load(LoadRequest::for_state(&self.state, initial_review));
    } else if self.state.phase != previous.phase {
      match self.state.phase {
        ReviewPhase::Complete => {
          self.finish_summary();
          self.refresh_now(RefreshKind::AvailableCards);
        }
        ReviewPhase::Idle => {
          // Cancelled, or the first load found nothing to review
          self.close_summary();
          self.refresh_now(RefreshKind::AvailableCards);
        }
        _ => {}
      }
    }

    if let Some(kind) = self.refresh.pending() {
      if !kind.relevant(&self.state) {
        self.refresh.cancel();
      }
    }
  }

  fn card_changed(&mut self, change: CardChange) {
    if self.state.contains_card(&change.id) {
      let action = match change.card {
        Some(card) if !change.deleted => ReviewAction::UpdateReviewCard {
          card,
          next_card_seed: rand::random(),
        },
        _ => ReviewAction::DeleteReviewCard {
          id: change.id,
          next_card_seed: rand::random(),
        },
      };
      self.dispatch(action);
    } else if !change.deleted && RefreshKind::ReviewCards.relevant(&self.state) {
      self.schedule_refresh(RefreshKind::ReviewCards);
    }

    if RefreshKind::AvailableCards.relevant(&self.state) {
      self.schedule_refresh(RefreshKind::AvailableCards);
    }
  }

  fn schedule_refresh(&mut self, kind: RefreshKind) {
    self.refresh.schedule(kind, self.debounce, self.events.clone());
  }

  fn refresh_now(&mut self, kind: RefreshKind) {
    self.refresh.cancel_kind(kind);
    match kind {
      RefreshKind::AvailableCards => {
        self.state = review_reducer(self.state.clone(), &ReviewAction::QueryAvailableCards);
        let cards = self.stores.cards.clone();
        let review_time = self.state.review_time;
        let events = self.events.clone();
        tokio::spawn(async move {
          let available_cards = tokio::task::spawn_blocking(move || {
            cards
              .get_available_cards(review_time)
              .log_warn_default("Failed to count available cards")
          })
          .await
          .log_warn_default("Available cards query panicked");
          send_event(
            &events,
            SessionEvent::Action(ReviewAction::UpdateAvailableCards { available_cards }),
          )
          .await;
        });
      }
      RefreshKind::ReviewCards => self.load(LoadRequest::for_state(&self.state, false)),
    }
  }

  fn load(&mut self, request: LoadRequest) {
    self.refresh.cancel_kind(RefreshKind::ReviewCards);
    let cards = self.stores.cards.clone();
    let events = self.events.clone();
    let initial_review = request.initial_review;
    tokio::spawn(async move {
      let action = tokio::task::spawn_blocking(move || request.run(&cards))
        .await
        .log_warn("Review card load panicked")
        .and_then(|result| result.log_warn("Failed to load review cards"))
        .unwrap_or_else(|| empty_load(initial_review));
      send_event(&events, SessionEvent::Action(action)).await;
    });
  }

  /// Look for an unfinished review left in the store
  fn resume(&self) {
    let reviews = self.stores.reviews.clone();
    let events = self.events.clone();
    tokio::spawn(async move {
      let stored = tokio::task::spawn_blocking(move || reviews.get_review())
        .await
        .log_warn("Stored review read panicked")
        .and_then(|result| result.log_warn("Failed to read stored review"))
        .flatten();
      if let Some(summary) = stored {
        send_event(&events, SessionEvent::Resume(summary)).await;
      }
    });
  }

  /// Replace the running review with the one `summary` describes
  fn start_from_summary(&mut self, summary: ReviewSummary) {
    self.refresh.cancel();
    self.state = review_reducer(
      self.state.clone(),
      &ReviewAction::NewReview {
        max_cards: summary.max_cards,
        max_new_cards: summary.max_new_cards,
        review_time: Utc::now(),
      },
    );
    let request = LoadRequest::for_resume(&self.state, &summary);
    self.summary = Some(summary);
    self.load(request);
  }

  fn review_synced(&mut self, synced: ReviewSummary) {
    if synced.finished {
      if self.state.phase.is_active() {
        tracing::info!("Review was finished on another device");
        self.summary = None;
        self.dispatch(ReviewAction::CancelReview);
      }
      return;
    }

    let in_step = self.summary.as_ref().is_some_and(|ours| {
      ours.history == synced.history
        && ours.max_cards == synced.max_cards
        && ours.max_new_cards == synced.max_new_cards
    });
    if !in_step {
      tracing::info!("Picking up synced review with {} answers", synced.history.len());
      self.start_from_summary(synced);
    }
  }

  fn record_answer(&mut self, previous: &ReviewState, outcome: ReviewOutcome) {
    if !previous.phase.is_showing_card() {
      return;
    }
    let (Some(answered), Some(updated)) = (previous.current_card.as_ref(), self.state.history.last()) else {
      return;
    };

    let updated = updated.clone();
    if let Some(summary) = self.summary.as_mut() {
      summary.record(&answered.id, outcome, answered.progress);
    }
    self.save_summary();
    self.save_progress(updated);
  }

  /// Write the answered card's progress, after any earlier save has finished
  fn save_progress(&mut self, card: Card) {
    let cards = self.stores.cards.clone();
    let events = self.events.clone();
    let earlier = self.last_save.take();

    let handle = tokio::spawn(async move {
      if let Some(earlier) = earlier {
        let _ = earlier.await;
      }
      let context = format!("Failed to save progress for card {}", card.id);
      let patch = CardPatch {
        id: Some(card.id),
        progress: Some(card.progress.into()),
        ..Default::default()
      };
      tokio::task::spawn_blocking(move || cards.put_card(&patch))
        .await
        .log_warn("Progress save panicked")
        .and_then(|result| result.log_warn(&context));
      send_event(&events, SessionEvent::Action(ReviewAction::FinishSave)).await;
    });
    self.last_save = Some(handle);
  }

  fn save_summary(&mut self) {
    if let Some(summary) = self.summary.clone() {
      self.write_summary(SummaryWrite::Put(summary));
    }
  }

  /// Mark the stored summary finished. The summary stays in memory so a
  /// completed review can still be extended.
  fn finish_summary(&mut self) {
    self.write_summary(SummaryWrite::Finish);
  }

  /// Drop the running summary and finish the stored one
  fn close_summary(&mut self) {
    if self.summary.take().is_some() {
      self.finish_summary();
    }
  }

  /// Write to the stored summary, after any earlier write has finished
  fn write_summary(&mut self, write: SummaryWrite) {
    let reviews = self.stores.reviews.clone();
    let earlier = self.last_summary_write.take();

    let handle = tokio::spawn(async move {
      if let Some(earlier) = earlier {
        let _ = earlier.await;
      }
      tokio::task::spawn_blocking(move || match write {
        SummaryWrite::Put(summary) => reviews.put_review(&summary).map(drop),
        SummaryWrite::Finish => reviews.finish_review().map(drop),
      })
      .await
      .log_warn("Review summary write panicked")
      .and_then(|result| result.log_warn("Failed to write review summary"));
    });
    self.last_summary_write = Some(handle);
  }
}

fn forward_card_changes(mut feed: CardChangeFeed, events: mpsc::WeakSender<SessionEvent>) {
  tokio::spawn(async move {
    while let Some(change) = feed.next().await {
      let Some(tx) = events.upgrade() else {
        break;
      };
      match change {
        Ok(change) => {
          if tx.send(SessionEvent::CardChanged(change)).await.is_err() {
            break;
          }
        }
        Err(e) => tracing::warn!("Skipping unreadable card change: {}", e),
      }
    }
  });
}

fn forward_synced_reviews(mut feed: ReviewSyncFeed, events: mpsc::WeakSender<SessionEvent>) {
  tokio::spawn(async move {
    while let Some(synced) = feed.next().await {
      let Some(tx) = events.upgrade() else {
        break;
      };
      match synced {
        Ok(summary) => {
          if tx.send(SessionEvent::ReviewSynced(summary)).await.is_err() {
            break;
          }
        }
        Err(e) => tracing::warn!("Skipping unreadable synced review: {}", e),
      }
    }
  });
}

#[derive(Debug, thiserror::Error)]
#[error("Review session has stopped")]
pub struct SessionClosed;

/// Handle to a running review session
#[derive(Clone)]
pub struct ReviewSession {
  events: mpsc::Sender<SessionEvent>,
  state: watch::Receiver<ReviewState>,
}

impl ReviewSession {
  /// Start a session over `stores`, resuming any unfinished stored review
  pub fn spawn(stores: Stores, max_cards: u32, max_new_cards: u32) -> Self {
    Self::spawn_with_debounce(stores, max_cards, max_new_cards, config::REFRESH_DEBOUNCE)
  }

  pub fn spawn_with_debounce(
    stores: Stores,
    max_cards: u32,
    max_new_cards: u32,
    debounce: Duration,
  ) -> Self {
    let (tx, rx) = mpsc::channel(config::SESSION_QUEUE_CAPACITY);
    let initial = ReviewState::new(max_cards, max_new_cards, Utc::now());
    let (published, state) = watch::channel(initial.clone());

    forward_card_changes(stores.cards.changes(), tx.downgrade());
    forward_synced_reviews(stores.reviews.synced_changes(), tx.downgrade());

    let actor = SessionActor {
      stores,
      state: initial,
      summary: None,
      events: tx.downgrade(),
      published,
      refresh: Debouncer::default(),
      debounce,
      last_save: None,
      last_summary_write: None,
    };
    tokio::spawn(actor.run(rx));

    Self { events: tx, state }
  }

  pub async fn dispatch(&self, action: ReviewAction) -> Result<(), SessionClosed> {
    self
      .events
      .send(SessionEvent::Action(action))
      .await
      .map_err(|_| SessionClosed)
  }

  /// Latest published state
  pub fn snapshot(&self) -> ReviewState {
    self.state.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<ReviewState> {
    self.state.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::reviews::REVIEW_ID;
  use crate::db::{replicate, DocStore};
  use crate::domain::{AvailableCards, Progress, ProgressPatch};

  const WAIT: Duration = Duration::from_secs(5);

  fn stores() -> Stores {
    Stores::new(DocStore::open_in_memory().unwrap())
  }

  fn add_card(stores: &Stores, front: &str) -> Card {
    stores
      .cards
      .put_card(&CardPatch {
        front: Some(front.into()),
        back: Some(format!("{} back", front)),
        ..Default::default()
      })
      .unwrap()
  }

  fn add_overdue_card(stores: &Stores, front: &str) -> Card {
    stores
      .cards
      .put_card(&CardPatch {
        front: Some(front.into()),
        progress: Some(ProgressPatch {
          level: Some(1.0),
          reviewed: Some(Some(Utc::now() - chrono::Duration::days(3))),
        }),
        ..Default::default()
      })
      .unwrap()
  }

  async fn wait_for(session: &ReviewSession, done: impl FnMut(&ReviewState) -> bool) -> ReviewState {
    let mut rx = session.subscribe();
    let result = tokio::time::timeout(WAIT, rx.wait_for(done))
      .await
      .expect("timed out waiting for review state");
    ReviewState::clone(&result.expect("session stopped"))
  }

  /// Poll the store until `check` holds
  async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
      while !check() {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .expect("timed out waiting for the store");
  }

  fn stored_review_finished(stores: &Stores) -> bool {
    stores
      .docs
      .get_any(REVIEW_ID)
      .unwrap()
      .is_some_and(|doc| doc.body["finished"] == true)
  }

  fn new_review(max_cards: u32, max_new_cards: u32) -> ReviewAction {
    ReviewAction::NewReview {
      max_cards,
      max_new_cards,
      review_time: Utc::now(),
    }
  }

  #[tokio::test]
  async fn test_idle_session_counts_available_cards() {
    let stores = stores();
    add_card(&stores, "new one");
    add_card(&stores, "new two");
    add_overdue_card(&stores, "overdue");

    let session = ReviewSession::spawn(stores, 10, 5);
    let state = wait_for(&session, |s| s.available_cards.is_some()).await;
    assert_eq!(
      state.available_cards,
      Some(AvailableCards {
        new_cards: 2,
        overdue_cards: 1,
      })
    );
    assert!(!state.loading_available_cards);
  }

  #[tokio::test]
  async fn test_empty_store_review_returns_to_idle() {
    let session = ReviewSession::spawn(stores(), 10, 5);
    session.dispatch(new_review(7, 3)).await.unwrap();
    let state = wait_for(&session, |s| s.phase == ReviewPhase::Idle && s.max_cards == 7).await;
    assert!(state.current_card.is_none());
  }

  #[tokio::test]
  async fn test_empty_review_is_not_resumed() {
    let stores = stores();
    let session = ReviewSession::spawn(stores.clone(), 10, 5);
    session.dispatch(new_review(7, 3)).await.unwrap();
    wait_for(&session, |s| s.phase == ReviewPhase::Idle && s.max_cards == 7).await;
    eventually(|| stored_review_finished(&stores)).await;
    assert!(stores.reviews.get_review().unwrap().is_none());

    add_card(&stores, "added later");
    let restarted = ReviewSession::spawn(stores, 10, 5);
    wait_for(&restarted, |s| s.available_cards.is_some()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(restarted.snapshot().phase, ReviewPhase::Idle);
  }

  #[tokio::test]
  async fn test_review_passes_card_and_saves_progress() {
    let stores = stores();
    let card = add_card(&stores, "hello");
    let session = ReviewSession::spawn(stores.clone(), 10, 5);

    session.dispatch(new_review(10, 5)).await.unwrap();
    let state = wait_for(&session, |s| s.phase == ReviewPhase::Question).await;
    assert_eq!(state.current_id(), Some(card.id.as_str()));
    assert_eq!(state.new_cards_in_play, 1);

    session.dispatch(ReviewAction::ShowAnswer).await.unwrap();
    session
      .dispatch(ReviewAction::PassCard {
        next_card_seed: 0.0,
      })
      .await
      .unwrap();
    let state = wait_for(&session, |s| s.phase == ReviewPhase::Complete && !s.saving_progress).await;
    assert_eq!(state.completed, 1);

    let saved = stores.cards.get_card(&card.id).unwrap();
    assert_eq!(saved.progress.level, 0.5);
    assert!(saved.progress.reviewed.is_some());
    eventually(|| stored_review_finished(&stores)).await;
  }

  #[tokio::test]
  async fn test_raising_limit_extends_complete_review() {
    let stores = stores();
    add_card(&stores, "first");
    add_card(&stores, "second");
    let session = ReviewSession::spawn(stores.clone(), 10, 5);

    session.dispatch(new_review(1, 1)).await.unwrap();
    let state = wait_for(&session, |s| s.phase == ReviewPhase::Question).await;
    let first = state.current_card.unwrap();
    session
      .dispatch(ReviewAction::PassCard {
        next_card_seed: 0.0,
      })
      .await
      .unwrap();
    wait_for(&session, |s| s.phase == ReviewPhase::Complete).await;

    session
      .dispatch(ReviewAction::SetReviewLimit {
        max_cards: 2,
        max_new_cards: 2,
      })
      .await
      .unwrap();
    let state = wait_for(&session, |s| s.phase == ReviewPhase::Question).await;
    assert_eq!(state.completed, 1);
    assert_ne!(state.current_id(), Some(first.id.as_str()));

    eventually(|| {
      stores
        .reviews
        .get_review()
        .unwrap()
        .is_some_and(|summary| summary.max_cards == 2 && summary.history.len() == 1)
    })
    .await;
  }

  #[tokio::test]
  async fn test_failed_card_is_saved_and_recorded() {
    let stores = stores();
    let card = add_overdue_card(&stores, "tricky");
    let session = ReviewSession::spawn(stores.clone(), 10, 5);

    session.dispatch(new_review(10, 5)).await.unwrap();
    wait_for(&session, |s| s.phase == ReviewPhase::Question).await;
    session
      .dispatch(ReviewAction::FailCard {
        next_card_seed: 0.0,
      })
      .await
      .unwrap();
    let state = wait_for(&session, |s| !s.saving_progress && !s.failed_cards_level2.is_empty()).await;
    assert_eq!(state.current_id(), Some(card.id.as_str()));

    let saved = stores.cards.get_card(&card.id).unwrap();
    assert_eq!(saved.progress.level, 0.0);

    eventually(|| {
      stores
        .reviews
        .get_review()
        .unwrap()
        .is_some_and(|summary| !summary.history.is_empty())
    })
    .await;
    let summary = stores.reviews.get_review().unwrap().unwrap();
    assert_eq!(summary.history.len(), 1);
    assert_eq!(summary.history[0].outcome, ReviewOutcome::Fail);
    assert_eq!(summary.history[0].previous_progress.map(|p| p.level), Some(1.0));
  }

  #[tokio::test]
  async fn test_edit_during_review_updates_current_card() {
    let stores = stores();
    let card = add_card(&stores, "before");
    let session = ReviewSession::spawn(stores.clone(), 10, 5);
    session.dispatch(new_review(10, 5)).await.unwrap();
    wait_for(&session, |s| s.phase == ReviewPhase::Question).await;

    stores
      .cards
      .put_card(&CardPatch {
        id: Some(card.id.clone()),
        front: Some("after".into()),
        ..Default::default()
      })
      .unwrap();
    let state = wait_for(&session, |s| {
      s.current_card.as_ref().is_some_and(|c| c.front == "after")
    })
    .await;
    assert_eq!(state.heap[0].front, "after");
  }

  #[tokio::test]
  async fn test_delete_during_review_completes() {
    let stores = stores();
    let card = add_card(&stores, "doomed");
    let session = ReviewSession::spawn(stores.clone(), 10, 5);
    session.dispatch(new_review(10, 5)).await.unwrap();
    wait_for(&session, |s| s.phase == ReviewPhase::Question).await;

    stores.cards.delete_card(&card.id).unwrap();
    let state = wait_for(&session, |s| s.phase == ReviewPhase::Complete).await;
    assert!(state.heap.is_empty());
  }

  #[tokio::test]
  async fn test_resumes_stored_review() {
    let stores = stores();
    let failed = add_overdue_card(&stores, "failed earlier");
    add_overdue_card(&stores, "still due");

    let mut summary = ReviewSummary::new(10, 5);
    summary.record(&failed.id, ReviewOutcome::Fail, failed.progress);
    stores.reviews.put_review(&summary).unwrap();

    let session = ReviewSession::spawn(stores, 1, 1);
    let state = wait_for(&session, |s| s.phase == ReviewPhase::Question).await;
    assert_eq!(state.max_cards, 10);
    assert_eq!(state.failed_cards_level2.len(), 1);
    assert_eq!(state.failed_cards_level2[0].id, failed.id);
    assert_eq!(state.history.len(), 1);
    assert_eq!(state.heap.len(), 1);
    assert_ne!(state.heap[0].id, failed.id);
  }

  #[tokio::test]
  async fn test_new_cards_respect_limit() {
    let stores = stores();
    for front in ["a", "b", "c"] {
      add_card(&stores, front);
    }
    add_overdue_card(&stores, "due");

    let session = ReviewSession::spawn(stores, 10, 5);
    session.dispatch(new_review(10, 1)).await.unwrap();
    let state = wait_for(&session, |s| s.phase == ReviewPhase::Question).await;
    assert_eq!(state.heap.len(), 2);
    assert_eq!(state.new_cards_in_play, 1);
    assert_eq!(state.heap[0].front, "due");
  }

  #[tokio::test]
  async fn test_synced_review_is_picked_up() {
    let here = stores();
    let there = stores();
    let failed = add_overdue_card(&there, "failed elsewhere");
    add_overdue_card(&there, "due");
    replicate(&there.docs, &here.docs).unwrap();

    let session = ReviewSession::spawn(here.clone(), 10, 5);
    wait_for(&session, |s| s.available_cards.is_some()).await;

    let mut summary = ReviewSummary::new(10, 5);
    summary.record(&failed.id, ReviewOutcome::Fail, failed.progress);
    there.reviews.put_review(&summary).unwrap();
    replicate(&there.docs, &here.docs).unwrap();

    let state = wait_for(&session, |s| s.phase == ReviewPhase::Question).await;
    assert_eq!(state.failed_cards_level2.len(), 1);
    assert_eq!(state.failed_cards_level2[0].id, failed.id);
    assert_eq!(state.history.len(), 1);
  }

  #[tokio::test]
  async fn test_review_finished_elsewhere_is_cancelled() {
    let here = stores();
    let there = stores();
    add_overdue_card(&here, "shared");
    let session = ReviewSession::spawn(here.clone(), 10, 5);

    session.dispatch(new_review(10, 5)).await.unwrap();
    wait_for(&session, |s| s.phase == ReviewPhase::Question).await;
    eventually(|| here.reviews.get_review().unwrap().is_some()).await;

    replicate(&here.docs, &there.docs).unwrap();
    assert!(there.reviews.finish_review().unwrap());
    replicate(&there.docs, &here.docs).unwrap();

    let state = wait_for(&session, |s| s.phase == ReviewPhase::Idle).await;
    assert!(state.current_card.is_none());
    assert!(here.reviews.get_review().unwrap().is_none());
  }

  fn actor(stores: Stores, tx: &mpsc::Sender<SessionEvent>) -> SessionActor {
    let state = ReviewState::new(10, 5, Utc::now());
    let (published, _) = watch::channel(state.clone());
    SessionActor {
      stores,
      state,
      summary: None,
      events: tx.downgrade(),
      published,
      refresh: Debouncer::default(),
      debounce: Duration::from_secs(60),
      last_save: None,
      last_summary_write: None,
    }
  }

  fn changed(card: Card) -> CardChange {
    CardChange {
      id: card.id.clone(),
      deleted: false,
      card: Some(card),
    }
  }

  #[tokio::test]
  async fn test_refresh_cancelled_when_leaving_idle() {
    let stores = stores();
    let card = add_card(&stores, "new");
    let (tx, _rx) = mpsc::channel(8);
    let mut actor = actor(stores, &tx);

    actor.card_changed(changed(card.clone()));
    actor.card_changed(changed(card));
    assert_eq!(actor.refresh.pending(), Some(RefreshKind::AvailableCards));

    actor.dispatch(new_review(10, 5));
    assert_eq!(actor.state.phase, ReviewPhase::Loading);
    assert_eq!(actor.refresh.pending(), None);
  }

  #[tokio::test]
  async fn test_debounced_refresh_fires_once() {
    let (tx, mut rx) = mpsc::channel(8);
    let mut debouncer = Debouncer::default();
    for _ in 0..3 {
      debouncer.schedule(RefreshKind::AvailableCards, Duration::from_millis(20), tx.downgrade());
    }

    let event = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(event, SessionEvent::Refresh(RefreshKind::AvailableCards)));
    debouncer.fired(RefreshKind::AvailableCards);
    assert_eq!(debouncer.pending(), None);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn test_review_cards_refresh_needs_room() {
    let mut state = ReviewState::new(1, 1, Utc::now());
    state.phase = ReviewPhase::Question;
    assert!(RefreshKind::ReviewCards.relevant(&state));

    let card = Card {
      id: "a".into(),
      front: String::new(),
      back: String::new(),
      keywords: vec![],
      tags: vec![],
      starred: false,
      created: Utc::now(),
      modified: Utc::now(),
      progress: Progress::default(),
    };
    state.heap = vec![card];
    assert!(!RefreshKind::ReviewCards.relevant(&state));
    assert!(!RefreshKind::AvailableCards.relevant(&state));
  }
}
