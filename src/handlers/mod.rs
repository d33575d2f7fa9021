//! JSON API over the stores and the review session.

pub mod cards;
pub mod notes;
pub mod review;
pub mod suggestions;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::db::StoreError;
use crate::state::AppState;

/// Store failure rendered as a JSON error response
#[derive(Debug)]
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            StoreError::NotFound { id, reason } => (
                StatusCode::NOT_FOUND,
                json!({ "error": self.0.to_string(), "id": id, "reason": reason }),
            ),
            StoreError::Conflict { id } => (
                StatusCode::CONFLICT,
                json!({ "error": self.0.to_string(), "id": id }),
            ),
            other => {
                tracing::error!("Request failed: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal storage error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/cards", get(cards::list_cards).post(cards::create_card))
        .route("/cards/available", get(cards::available_cards))
        .route(
            "/cards/{id}",
            get(cards::get_card)
                .put(cards::update_card)
                .delete(cards::delete_card),
        )
        .route("/keywords", get(suggestions::keywords))
        .route("/tags", get(suggestions::tags))
        .route("/notes", get(notes::notes_for_keywords).post(notes::create_note))
        .route(
            "/notes/{id}",
            get(notes::get_note)
                .put(notes::update_note)
                .delete(notes::delete_note),
        )
        .route("/review", get(review::snapshot))
        .route("/review/actions", post(review::dispatch))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        let status = |e: StoreError| ApiError::from(e).into_response().status();
        assert_eq!(status(StoreError::missing("card-1")), StatusCode::NOT_FOUND);
        assert_eq!(status(StoreError::deleted("card-1")), StatusCode::NOT_FOUND);
        assert_eq!(
            status(StoreError::Conflict { id: "card-1".into() }),
            StatusCode::CONFLICT
        );
        assert_eq!(status(StoreError::Lock), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
