//! Keyword and tag suggestions.
//!
//! Both endpoints go through the shared suggestion sessions, so terms saved
//! on cards through this server come first and repeated prefixes are served
//! from the lookup cache.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use super::ApiResult;
use crate::config;
use crate::db::TermField;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct SuggestionParams {
    #[serde(default)]
    pub prefix: String,
    pub limit: Option<usize>,
}

async fn suggest(
    state: &AppState,
    field: TermField,
    params: SuggestionParams,
) -> ApiResult<Json<Vec<String>>> {
    let limit = params.limit.unwrap_or(config::DEFAULT_SUGGESTION_LIMIT);
    let mut suggester = state.suggester(field).lock().await;

    let initial = suggester.initial(&params.prefix, limit);
    if !initial.needs_lookup {
        return Ok(Json(initial.terms));
    }
    Ok(Json(suggester.lookup(&params.prefix, limit).await?))
}

/// GET /keywords?prefix=&limit=
pub async fn keywords(
    State(state): State<AppState>,
    Query(params): Query<SuggestionParams>,
) -> ApiResult<Json<Vec<String>>> {
    suggest(&state, TermField::Keywords, params).await
}

/// GET /tags?prefix=&limit=
pub async fn tags(
    State(state): State<AppState>,
    Query(params): Query<SuggestionParams>,
) -> ApiResult<Json<Vec<String>>> {
    suggest(&state, TermField::Tags, params).await
}
