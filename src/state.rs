//! Application state passed to all handlers.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db::{Stores, TagSuggester, TermField};
use crate::session::ReviewSession;

/// Suggestion session shared by concurrent requests
pub type SharedSuggester = Arc<Mutex<TagSuggester>>;

#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    /// The running review session for this database
    pub session: ReviewSession,
    pub keywords: SharedSuggester,
    pub tags: SharedSuggester,
}

impl AppState {
    /// Build the state and start the review session. Must run inside a tokio runtime.
    pub fn new(stores: Stores, max_cards: u32, max_new_cards: u32) -> Self {
        let session = ReviewSession::spawn(stores.clone(), max_cards, max_new_cards);
        Self::with_session(stores, session)
    }

    pub fn with_session(stores: Stores, session: ReviewSession) -> Self {
        let suggester = |field| Arc::new(Mutex::new(TagSuggester::new(stores.docs.clone(), field)));
        Self {
            keywords: suggester(TermField::Keywords),
            tags: suggester(TermField::Tags),
            stores,
            session,
        }
    }

    pub fn suggester(&self, field: TermField) -> &SharedSuggester {
        match field {
            TermField::Keywords => &self.keywords,
            TermField::Tags => &self.tags,
        }
    }
}
