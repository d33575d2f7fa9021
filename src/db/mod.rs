pub mod cards;
pub mod changes;
pub mod conflicts;
pub mod docstore;
pub mod error;
pub mod ids;
pub mod keywords;
pub mod notes;
pub mod replication;
pub mod reviews;
pub mod schema;

use std::path::Path;
use std::sync::Arc;

// Re-export the public surface of the submodules
pub use cards::{CardKind, CardQuery, CardStore};
pub use changes::{CardChange, CardChangeFeed};
pub use docstore::{ApplyOutcome, DocChange, DocStore, Document, RevisionLeaf, Winner};
pub use error::{NotFoundReason, StoreError, StoreResult};
pub use ids::IdGenerator;
pub use keywords::{InitialSuggestions, TagSuggester, TermField};
pub use notes::NoteStore;
pub use replication::{replicate, sync, ReplicationReport};
pub use reviews::{ReviewStore, ReviewSyncFeed};
pub use schema::run_migrations;

/// Extension trait for logging errors before discarding them
pub trait LogOnError<T> {
    /// Log the error at warn level and return None
    fn log_warn(self, context: &str) -> Option<T>;
    /// Log the error at warn level and return the default
    fn log_warn_default(self, context: &str) -> T
    where
        T: Default;
}

impl<T, E: std::fmt::Display> LogOnError<T> for std::result::Result<T, E> {
    fn log_warn(self, context: &str) -> Option<T> {
        match self {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("{}: {}", context, e);
                None
            }
        }
    }

    fn log_warn_default(self, context: &str) -> T
    where
        T: Default,
    {
        match self {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("{}: {}", context, e);
                T::default()
            }
        }
    }
}

/// The stores of one database, sharing a document store and an id generator
#[derive(Clone)]
pub struct Stores {
    pub docs: DocStore,
    pub cards: CardStore,
    pub notes: NoteStore,
    pub reviews: ReviewStore,
}

impl Stores {
    pub fn new(docs: DocStore) -> Self {
        conflicts::register_resolvers(&docs);
        let ids = Arc::new(IdGenerator::new());
        Self {
            cards: CardStore::new(docs.clone(), Arc::clone(&ids)),
            notes: NoteStore::new(docs.clone(), ids),
            reviews: ReviewStore::new(docs.clone()),
            docs,
        }
    }
}

/// Open the database at `path`, migrating it after taking a backup
pub fn init_store(path: &Path) -> StoreResult<Stores> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    // Create backup before migrations if database exists
    if path.exists() {
        let backup_path = path.with_extension("db.backup");
        if let Err(e) = std::fs::copy(path, &backup_path) {
            tracing::warn!("Could not create database backup: {}", e);
        }
    }

    let docs = DocStore::open(path)?;
    tracing::info!("Opened document store {}", docs.store_id()?);
    Ok(Stores::new(docs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CardPatch;

    #[test]
    fn test_log_warn() {
        let ok: Result<u32, String> = Ok(3);
        assert_eq!(ok.log_warn("ctx"), Some(3));
        let err: Result<u32, String> = Err("boom".into());
        assert_eq!(err.log_warn("ctx"), None);
        let err: Result<u32, String> = Err("boom".into());
        assert_eq!(err.log_warn_default("ctx"), 0);
    }

    #[test]
    fn test_init_store_backs_up_existing_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("reviewdeck.db");

        let stores = init_store(&path).unwrap();
        let card = stores
            .cards
            .put_card(&CardPatch {
                front: Some("persisted".into()),
                ..Default::default()
            })
            .unwrap();
        drop(stores);

        let reopened = init_store(&path).unwrap();
        assert_eq!(reopened.cards.get_card(&card.id).unwrap().front, "persisted");
        assert!(path.with_extension("db.backup").exists());
    }
}
