//! Note CRUD. Notes attach to cards only through shared keywords.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::docstore::DocStore;
use super::error::{StoreError, StoreResult};
use super::ids::IdGenerator;
use crate::config;
use crate::domain::{Note, NotePatch};
use crate::validation::{normalize_terms, normalize_text};

pub const NOTE_PREFIX: &str = "note-";

pub fn note_doc_id(id: &str) -> String {
    format!("{}{}", NOTE_PREFIX, id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NoteDoc {
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    keywords: Vec<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    created: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    modified: DateTime<Utc>,
}

impl NoteDoc {
    fn into_note(self, id: &str) -> Note {
        Note {
            id: id.to_string(),
            content: self.content,
            keywords: self.keywords,
            created: self.created,
            modified: self.modified,
        }
    }
}

#[derive(Clone)]
pub struct NoteStore {
    docs: DocStore,
    ids: Arc<IdGenerator>,
}

impl NoteStore {
    pub fn new(docs: DocStore, ids: Arc<IdGenerator>) -> Self {
        Self { docs, ids }
    }

    /// Create a note (no `id`) or update the supplied fields of an existing one
    pub fn put_note(&self, patch: &NotePatch) -> StoreResult<Note> {
        match &patch.id {
            None => self.create_note(patch),
            Some(id) => self.update_note(id, patch),
        }
    }

    fn create_note(&self, patch: &NotePatch) -> StoreResult<Note> {
        let now = Utc::now();
        let body = serde_json::to_value(NoteDoc {
            content: normalize_text(patch.content.as_deref().unwrap_or_default()),
            keywords: normalize_terms(patch.keywords.as_deref().unwrap_or_default()),
            created: now,
            modified: now,
        })?;

        for _ in 0..config::ID_COLLISION_RETRIES {
            let id = self.ids.generate();
            match self.docs.put(&note_doc_id(&id), None, &body) {
                Ok(_) => {
                    tracing::debug!("Created note {}", id);
                    return self.get_note(&id);
                }
                Err(StoreError::Conflict { .. }) => {
                    tracing::debug!("Note id {} collided, generating another", id);
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Conflict {
            id: NOTE_PREFIX.to_string(),
        })
    }

    fn update_note(&self, id: &str, patch: &NotePatch) -> StoreResult<Note> {
        let doc_id = note_doc_id(id);
        self.docs.upsert(&doc_id, |current| {
            let current = match current {
                None => return Err(StoreError::missing(&doc_id)),
                Some(doc) if doc.deleted => return Err(StoreError::deleted(&doc_id)),
                Some(doc) => doc,
            };
            let mut note: NoteDoc = serde_json::from_value(current.body.clone())?;
            let mut changed = false;

            if let Some(content) = &patch.content {
                let content = normalize_text(content);
                if note.content != content {
                    note.content = content;
                    changed = true;
                }
            }
            if let Some(keywords) = &patch.keywords {
                let keywords = normalize_terms(keywords);
                if note.keywords != keywords {
                    note.keywords = keywords;
                    changed = true;
                }
            }

            if !changed {
                return Ok(None);
            }
            note.modified = Utc::now();
            Ok(Some(serde_json::to_value(&note)?))
        })?;

        self.get_note(id)
    }

    pub fn get_note(&self, id: &str) -> StoreResult<Note> {
        let doc = self.docs.get(&note_doc_id(id))?;
        let note: NoteDoc = serde_json::from_value(doc.body)?;
        Ok(note.into_note(id))
    }

    /// Delete a note; deleting a missing note succeeds
    pub fn delete_note(&self, id: &str) -> StoreResult<()> {
        self.docs.stubborn_remove(&note_doc_id(id))
    }

    /// Notes sharing any of `keywords` (case-insensitive), most recently
    /// modified first
    pub fn get_notes_for_keywords(&self, keywords: &[String]) -> StoreResult<Vec<Note>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let mut notes = Vec::new();
        for doc in self.docs.all_docs(NOTE_PREFIX)? {
            let id = doc.id.strip_prefix(NOTE_PREFIX).unwrap_or(&doc.id).to_string();
            let note: NoteDoc = serde_json::from_value(doc.body)?;
            let note = note.into_note(&id);
            if note.matches_keywords(keywords) {
                notes.push(note);
            }
        }
        notes.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(notes)
    }
}
