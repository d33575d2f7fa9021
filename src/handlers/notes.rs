use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use super::ApiResult;
use crate::domain::{Note, NotePatch};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct NoteSearchParams {
    /// Comma-separated keywords
    #[serde(default)]
    pub keywords: String,
}

/// GET /notes?keywords=a,b
pub async fn notes_for_keywords(
    State(state): State<AppState>,
    Query(params): Query<NoteSearchParams>,
) -> ApiResult<Json<Vec<Note>>> {
    let keywords: Vec<String> = params
        .keywords
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect();
    Ok(Json(state.stores.notes.get_notes_for_keywords(&keywords)?))
}

/// POST /notes
pub async fn create_note(
    State(state): State<AppState>,
    Json(mut patch): Json<NotePatch>,
) -> ApiResult<(StatusCode, Json<Note>)> {
    patch.id = None;
    let note = state.stores.notes.put_note(&patch)?;
    Ok((StatusCode::CREATED, Json(note)))
}

/// GET /notes/{id}
pub async fn get_note(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Note>> {
    Ok(Json(state.stores.notes.get_note(&id)?))
}

/// PUT /notes/{id}
pub async fn update_note(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut patch): Json<NotePatch>,
) -> ApiResult<Json<Note>> {
    patch.id = Some(id);
    Ok(Json(state.stores.notes.put_note(&patch)?))
}

/// DELETE /notes/{id}
pub async fn delete_note(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.stores.notes.delete_note(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use crate::domain::Note;
    use crate::testing::TestEnv;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_note_lifecycle() {
        let env = TestEnv::new().unwrap();
        let server = env.server();

        let response = server
            .post("/notes")
            .json(&json!({ "content": "Counters for animals", "keywords": ["匹", "Animal"] }))
            .await;
        response.assert_status(StatusCode::CREATED);
        let note: Note = response.json();
        let path = format!("/notes/{}", note.id);

        let updated: Note = server.put(&path).json(&json!({ "content": "Edited" })).await.json();
        assert_eq!(updated.content, "Edited");
        assert_eq!(updated.keywords, note.keywords);

        let found: Vec<Note> = server.get("/notes?keywords=animal,other").await.json();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, note.id);

        server.delete(&path).await.assert_status(StatusCode::NO_CONTENT);
        server.get(&path).await.assert_status(StatusCode::NOT_FOUND);

        let found: Vec<Note> = server.get("/notes?keywords=animal").await.json();
        assert!(found.is_empty());
    }
}
