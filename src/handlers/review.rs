use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::srs::{ReviewAction, ReviewState};
use crate::state::AppState;

/// GET /review
pub async fn snapshot(State(state): State<AppState>) -> Json<ReviewState> {
    Json(state.session.snapshot())
}

/// POST /review/actions
///
/// Accepts user actions only; omitted selection seeds are drawn at random.
/// The action is queued and applied in order, so the response does not carry
/// the resulting state.
pub async fn dispatch(
    State(state): State<AppState>,
    Json(action): Json<ReviewAction>,
) -> impl IntoResponse {
    if !action.is_user_action() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("{} cannot be dispatched by clients", action.name()) })),
        );
    }

    match state.session.dispatch(action).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "queued": true }))),
        Err(e) => {
            tracing::error!("{}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}
