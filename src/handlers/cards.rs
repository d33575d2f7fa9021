//! Card endpoints.
//!
//! Cards are always returned merged with their progress.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::ApiResult;
use crate::config;
use crate::db::{CardKind, CardQuery};
use crate::domain::{AvailableCards, Card, CardPatch};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct CardListParams {
    /// `new` or `overdue`; without it cards are paged by creation time
    #[serde(default, rename = "type")]
    pub kind: Option<CardKind>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    #[serde(default)]
    pub skip_failed: bool,
    /// Epoch millis; defaults to now
    pub review_time: Option<i64>,
}

fn review_time(millis: Option<i64>) -> DateTime<Utc> {
    millis
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

/// GET /cards
pub async fn list_cards(
    State(state): State<AppState>,
    Query(params): Query<CardListParams>,
) -> ApiResult<Json<Vec<Card>>> {
    let cards = match params.kind {
        Some(kind) => {
            let mut query =
                CardQuery::new(kind, review_time(params.review_time)).skip_failed_cards(params.skip_failed);
            if let Some(limit) = params.limit {
                query = query.limit(limit);
            }
            state.stores.cards.get_cards(&query)?
        }
        None => state.stores.cards.get_cards_page(
            params.skip.unwrap_or(0),
            params.limit.unwrap_or(config::DEFAULT_CARD_LIMIT),
        )?,
    };
    Ok(Json(cards))
}

/// Remember the terms on a saved card for the suggestion sessions
async fn record_terms(state: &AppState, patch: &CardPatch) {
    if let Some(keywords) = &patch.keywords {
        let mut suggester = state.keywords.lock().await;
        keywords.iter().for_each(|k| suggester.record_added(k));
    }
    if let Some(tags) = &patch.tags {
        let mut suggester = state.tags.lock().await;
        tags.iter().for_each(|t| suggester.record_added(t));
    }
}

/// POST /cards
pub async fn create_card(
    State(state): State<AppState>,
    Json(mut patch): Json<CardPatch>,
) -> ApiResult<(StatusCode, Json<Card>)> {
    patch.id = None;
    let card = state.stores.cards.put_card(&patch)?;
    record_terms(&state, &patch).await;
    tracing::debug!("Created card {}", card.id);
    Ok((StatusCode::CREATED, Json(card)))
}

/// GET /cards/{id}
pub async fn get_card(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Card>> {
    Ok(Json(state.stores.cards.get_card(&id)?))
}

/// PUT /cards/{id}
pub async fn update_card(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut patch): Json<CardPatch>,
) -> ApiResult<Json<Card>> {
    patch.id = Some(id);
    let card = state.stores.cards.put_card(&patch)?;
    record_terms(&state, &patch).await;
    Ok(Json(card))
}

/// DELETE /cards/{id}
pub async fn delete_card(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.stores.cards.delete_card(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct AvailableParams {
    pub review_time: Option<i64>,
}

/// GET /cards/available
pub async fn available_cards(
    State(state): State<AppState>,
    Query(params): Query<AvailableParams>,
) -> ApiResult<Json<AvailableCards>> {
    let counts = state
        .stores
        .cards
        .get_available_cards(review_time(params.review_time))?;
    Ok(Json(counts))
}

#[cfg(test)]
mod tests {
    use crate::domain::Card;
    use crate::testing::TestEnv;
    use axum::http::StatusCode;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_create_and_fetch_card() {
        let env = TestEnv::new().unwrap();
        let server = env.server();

        let response = server
            .post("/cards")
            .json(&json!({ "front": "犬", "back": "dog", "keywords": ["犬"], "tags": [] }))
            .await;
        response.assert_status(StatusCode::CREATED);
        let created: Card = response.json();
        assert_eq!(created.progress.level, 0.0);
        assert!(created.progress.reviewed.is_none());

        let fetched: Value = server.get(&format!("/cards/{}", created.id)).await.json();
        assert_eq!(fetched["front"], "犬");
        assert_eq!(fetched["keywords"], json!(["犬"]));
        assert_eq!(fetched["tags"], json!([]));
    }

    #[tokio::test]
    async fn test_update_and_delete_card() {
        let env = TestEnv::new().unwrap();
        let server = env.server();
        let created: Card = server.post("/cards").json(&json!({ "front": "a" })).await.json();
        let path = format!("/cards/{}", created.id);

        let updated: Card = server
            .put(&path)
            .json(&json!({ "back": "b", "progress": { "level": 3.0 } }))
            .await
            .json();
        assert_eq!(updated.front, "a");
        assert_eq!(updated.back, "b");
        assert_eq!(updated.progress.level, 3.0);

        server.delete(&path).await.assert_status(StatusCode::NO_CONTENT);
        server.delete(&path).await.assert_status(StatusCode::NO_CONTENT);

        let response = server.get(&path).await;
        response.assert_status(StatusCode::NOT_FOUND);
        assert_eq!(response.json::<Value>()["reason"], "deleted");
    }

    #[tokio::test]
    async fn test_update_missing_card_is_not_found() {
        let env = TestEnv::new().unwrap();
        let response = env.server().put("/cards/nope").json(&json!({ "front": "x" })).await;
        response.assert_status(StatusCode::NOT_FOUND);
        assert_eq!(response.json::<Value>()["reason"], "missing");
    }

    #[tokio::test]
    async fn test_list_new_and_paged_cards() {
        let env = TestEnv::new().unwrap();
        let server = env.server();
        for front in ["one", "two", "three"] {
            server.post("/cards").json(&json!({ "front": front })).await;
        }

        let new_cards: Vec<Card> = server.get("/cards?type=new&limit=2").await.json();
        let fronts: Vec<&str> = new_cards.iter().map(|c| c.front.as_str()).collect();
        assert_eq!(fronts, vec!["one", "two"]);

        let page: Vec<Card> = server.get("/cards?skip=1&limit=5").await.json();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].front, "two");

        let overdue: Vec<Card> = server.get("/cards?type=overdue").await.json();
        assert!(overdue.is_empty());

        let available: Value = server.get("/cards/available").await.json();
        assert_eq!(available, json!({ "new_cards": 3, "overdue_cards": 0 }));
    }
}
