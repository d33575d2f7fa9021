//! Revisioned document store on top of SQLite.
//!
//! Documents are JSON bodies keyed by id. Every write produces a new revision
//! `<generation>-<hash>` and bumps the store's update sequence, which doubles
//! as the change feed. Writes against a stale revision fail with
//! `StoreError::Conflict`. Revisions arriving from another store through
//! replication may diverge from the local leaf; those are recorded as
//! conflicts and handed to a registered resolver when one matches the id.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::broadcast;

use super::error::{StoreError, StoreResult};
use super::schema::run_migrations;
use crate::config;

/// A live or deleted document as seen by callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub rev: String,
    pub deleted: bool,
    pub body: Value,
}

/// One entry of the change feed: the state of a document after a write
#[derive(Debug, Clone, PartialEq)]
pub struct DocChange {
    pub seq: i64,
    pub id: String,
    pub rev: String,
    pub deleted: bool,
    pub body: Value,
    /// Written by `apply_replicated` rather than a local edit
    pub replicated: bool,
}

/// A revision leaf together with its ancestry, as exchanged by replication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionLeaf {
    pub id: String,
    pub rev: String,
    /// Ancestor revisions, newest first
    pub revs: Vec<String>,
    pub deleted: bool,
    pub body: Value,
}

/// What `apply_replicated` did with an incoming leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Already known (same revision, or an ancestor of the local leaf)
    Unchanged,
    /// Incoming revision descends from the local leaf (or is new) and replaced it
    FastForward,
    /// Diverged revisions; `resolved` is true when a resolver merged them
    Conflict { resolved: bool },
}

/// Which side of a conflict a resolver keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    First,
    Second,
}

/// Pure conflict policy: given the current winning body and a losing body,
/// pick the one to keep.
pub type ConflictResolver = Arc<dyn Fn(&Value, &Value) -> Winner + Send + Sync>;

struct StoredDoc {
    rev: String,
    revs: Vec<String>,
    deleted: bool,
    body: Value,
}

#[derive(Clone)]
pub struct DocStore {
    conn: Arc<Mutex<Connection>>,
    changes: broadcast::Sender<DocChange>,
    resolvers: Arc<RwLock<Vec<(String, ConflictResolver)>>>,
}

impl DocStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> StoreResult<Self> {
        run_migrations(&conn)?;
        let (changes, _) = broadcast::channel(config::CHANGE_FEED_CAPACITY);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            changes,
            resolvers: Arc::new(RwLock::new(Vec::new())),
        })
    }

    /// Acquire the connection, mapping a poisoned mutex to `StoreError::Lock`
    pub(crate) fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| {
            tracing::error!("Document store mutex poisoned");
            StoreError::Lock
        })
    }

    /// Run a read-only query against the underlying connection
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Unique identity of this store, used as the replication checkpoint key
    pub fn store_id(&self) -> StoreResult<String> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT value FROM store_meta WHERE key = 'store_id'",
                [],
                |row| row.get(0),
            )?)
        })
    }

    /// Subscribe to the live change feed
    pub fn subscribe(&self) -> broadcast::Receiver<DocChange> {
        self.changes.subscribe()
    }

    /// Register a conflict policy for every id starting with `prefix`
    pub fn register_resolver(&self, prefix: &str, resolver: ConflictResolver) {
        if let Ok(mut resolvers) = self.resolvers.write() {
            resolvers.retain(|(p, _)| p != prefix);
            resolvers.push((prefix.to_string(), resolver));
        }
    }

    fn resolver_for(&self, id: &str) -> Option<ConflictResolver> {
        let resolvers = self.resolvers.read().ok()?;
        resolvers
            .iter()
            .find(|(prefix, _)| id.starts_with(prefix.as_str()))
            .map(|(_, resolver)| Arc::clone(resolver))
    }

    // ==================== Reads ====================

    /// Fetch a live document
    pub fn get(&self, id: &str) -> StoreResult<Document> {
        let conn = self.lock()?;
        match read_stored(&conn, id)? {
            None => Err(StoreError::missing(id)),
            Some(doc) if doc.deleted => Err(StoreError::deleted(id)),
            Some(doc) => Ok(Document {
                id: id.to_string(),
                rev: doc.rev,
                deleted: false,
                body: doc.body,
            }),
        }
    }

    /// Fetch a document including tombstones; `None` when never written
    pub fn get_any(&self, id: &str) -> StoreResult<Option<Document>> {
        let conn = self.lock()?;
        Ok(read_stored(&conn, id)?.map(|doc| Document {
            id: id.to_string(),
            rev: doc.rev,
            deleted: doc.deleted,
            body: doc.body,
        }))
    }

    /// Live documents whose id starts with `prefix`, in id order
    pub fn all_docs(&self, prefix: &str) -> StoreResult<Vec<Document>> {
        let (start, end) = prefix_range(prefix);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, rev, body FROM documents
            WHERE id >= ?1 AND id < ?2 AND deleted = 0
            ORDER BY id
            "#,
        )?;
        let rows = stmt
            .query_map(params![start, end], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, rev, body)| {
                Ok(Document {
                    id,
                    rev,
                    deleted: false,
                    body: serde_json::from_str(&body)?,
                })
            })
            .collect()
    }

    /// Current update sequence
    pub fn update_seq(&self) -> StoreResult<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM documents", [], |row| {
                row.get(0)
            })?)
        })
    }

    /// Documents changed after `since`, oldest change first. Like a CouchDB
    /// changes feed, only the latest state of each document is reported.
    pub fn changes_since(&self, since: i64, limit: usize) -> StoreResult<Vec<DocChange>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT seq, id, rev, deleted, body FROM documents
            WHERE seq > ?1
            ORDER BY seq ASC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![since, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(seq, id, rev, deleted, body)| {
                Ok(DocChange {
                    seq,
                    id,
                    rev,
                    deleted,
                    body: serde_json::from_str(&body)?,
                    replicated: false,
                })
            })
            .collect()
    }

    /// Losing revisions recorded for a document
    pub fn conflicts(&self, id: &str) -> StoreResult<Vec<Document>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT rev, deleted, body FROM conflicts WHERE id = ?1 ORDER BY rev")?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(rev, deleted, body)| {
                Ok(Document {
                    id: id.to_string(),
                    rev,
                    deleted,
                    body: serde_json::from_str(&body)?,
                })
            })
            .collect()
    }

    /// The winning leaf with its ancestry, for replication
    pub fn leaf(&self, id: &str) -> StoreResult<Option<RevisionLeaf>> {
        let conn = self.lock()?;
        Ok(read_stored(&conn, id)?.map(|doc| RevisionLeaf {
            id: id.to_string(),
            rev: doc.rev,
            revs: doc.revs,
            deleted: doc.deleted,
            body: doc.body,
        }))
    }

    // ==================== Writes ====================

    /// Create or update a document.
    ///
    /// `rev` must name the current leaf when the document is live. Creating a
    /// document over a tombstone is allowed without a revision.
    pub fn put(&self, id: &str, rev: Option<&str>, body: &Value) -> StoreResult<String> {
        let mut conn = self.lock()?;
        let existing = read_stored(&conn, id)?;

        match (&existing, rev) {
            (None, None) => {}
            (None, Some(_)) => return Err(StoreError::Conflict { id: id.to_string() }),
            (Some(doc), None) if doc.deleted => {}
            (Some(doc), Some(rev)) if doc.rev == rev => {}
            _ => return Err(StoreError::Conflict { id: id.to_string() }),
        }

        let change = write_successor(&mut conn, id, existing.as_ref(), false, body)?;
        let new_rev = change.rev.clone();
        drop(conn);

        let _ = self.changes.send(change);
        Ok(new_rev)
    }

    /// Delete a live document at the given revision
    pub fn remove(&self, id: &str, rev: &str) -> StoreResult<String> {
        let mut conn = self.lock()?;
        let existing = match read_stored(&conn, id)? {
            None => return Err(StoreError::missing(id)),
            Some(doc) if doc.deleted => return Err(StoreError::deleted(id)),
            Some(doc) => doc,
        };
        if existing.rev != rev {
            return Err(StoreError::Conflict { id: id.to_string() });
        }

        let tombstone = Value::Object(Default::default());
        let change = write_successor(&mut conn, id, Some(&existing), true, &tombstone)?;
        let new_rev = change.rev.clone();
        drop(conn);

        let _ = self.changes.send(change);
        Ok(new_rev)
    }

    /// Delete a document, re-reading its revision whenever a concurrent write
    /// wins the race. Missing and already-deleted documents succeed silently.
    pub fn stubborn_remove(&self, id: &str) -> StoreResult<()> {
        for attempt in 0..config::STUBBORN_RETRIES {
            let doc = match self.get(id) {
                Ok(doc) => doc,
                Err(StoreError::NotFound { .. }) => return Ok(()),
                Err(e) => return Err(e),
            };
            match self.remove(id, &doc.rev) {
                Ok(_) | Err(StoreError::NotFound { .. }) => return Ok(()),
                Err(StoreError::Conflict { .. }) => {
                    tracing::debug!("Retrying delete of {} (attempt {})", id, attempt + 1);
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Conflict { id: id.to_string() })
    }

    /// Read-modify-write with retry on conflict.
    ///
    /// `diff` receives the current document (tombstones included, `None` when
    /// never written) and returns the new body, or `None` to leave the
    /// document untouched. Returns the new revision when something was written.
    pub fn upsert<F>(&self, id: &str, mut diff: F) -> StoreResult<Option<String>>
    where
        F: FnMut(Option<&Document>) -> StoreResult<Option<Value>>,
    {
        for attempt in 0..config::UPSERT_RETRIES {
            let current = self.get_any(id)?;
            let Some(body) = diff(current.as_ref())? else {
                return Ok(None);
            };
            let rev = current.as_ref().filter(|doc| !doc.deleted).map(|doc| doc.rev.as_str());
            match self.put(id, rev, &body) {
                Ok(rev) => return Ok(Some(rev)),
                Err(StoreError::Conflict { .. }) => {
                    tracing::debug!("Retrying upsert of {} (attempt {})", id, attempt + 1);
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Conflict { id: id.to_string() })
    }

    // ==================== Replication ====================

    /// Merge a leaf received from another store.
    ///
    /// Deleted leaves never win against live ones. Between two live leaves the
    /// higher generation wins, then the greater revision string, so every peer
    /// picks the same winner. The loser is kept in `conflicts` unless a
    /// resolver registered for the id settles it.
    pub fn apply_replicated(&self, incoming: RevisionLeaf) -> StoreResult<ApplyOutcome> {
        let mut conn = self.lock()?;
        let id = incoming.id.clone();
        let local = read_stored(&conn, &id)?;

        let local = match local {
            None => {
                let change = write_leaf(&mut conn, &incoming)?;
                drop(conn);
                self.announce_replicated(change);
                return Ok(ApplyOutcome::FastForward);
            }
            Some(local) => local,
        };

        if local.rev == incoming.rev || local.revs.contains(&incoming.rev) {
            return Ok(ApplyOutcome::Unchanged);
        }

        if incoming.revs.contains(&local.rev) || (local.deleted && !incoming.deleted) {
            let change = write_leaf(&mut conn, &incoming)?;
            drop(conn);
            self.announce_replicated(change);
            return Ok(ApplyOutcome::FastForward);
        }

        if incoming.deleted {
            // A deleted branch never displaces a live leaf
            return Ok(ApplyOutcome::Unchanged);
        }

        let local_leaf = RevisionLeaf {
            id: id.clone(),
            rev: local.rev,
            revs: local.revs,
            deleted: false,
            body: local.body,
        };
        let (winner, loser) = if rev_outranks(&incoming.rev, &local_leaf.rev) {
            (incoming, local_leaf)
        } else {
            (local_leaf, incoming)
        };

        let Some(resolver) = self.resolver_for(&id) else {
            tracing::info!("Recorded conflict on {}: {} beats {}", id, winner.rev, loser.rev);
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO conflicts (id, rev, deleted, body) VALUES (?1, ?2, 0, ?3)",
                params![id, loser.rev, serde_json::to_string(&loser.body)?],
            )?;
            tx.commit()?;
            let change = write_leaf(&mut conn, &winner)?;
            drop(conn);
            self.announce_replicated(change);
            return Ok(ApplyOutcome::Conflict { resolved: false });
        };

        let keep = match resolver(&winner.body, &loser.body) {
            Winner::First => winner.body.clone(),
            Winner::Second => loser.body.clone(),
        };
        tracing::info!("Resolved conflict on {} between {} and {}", id, winner.rev, loser.rev);

        // The merged revision descends from both leaves so neither replicates back
        // as a new conflict.
        let mut revs = vec![winner.rev.clone()];
        revs.extend(winner.revs.iter().cloned());
        revs.push(loser.rev.clone());
        revs.extend(loser.revs.iter().cloned());
        dedup_preserving_order(&mut revs);
        revs.truncate(config::REV_HISTORY_LIMIT);

        let merged = RevisionLeaf {
            id: id.clone(),
            rev: next_rev(Some(&winner.rev), false, &keep)?,
            revs,
            deleted: false,
            body: keep,
        };
        let change = write_leaf(&mut conn, &merged)?;
        drop(conn);
        self.announce_replicated(change);
        Ok(ApplyOutcome::Conflict { resolved: true })
    }

    fn announce_replicated(&self, mut change: DocChange) {
        change.replicated = true;
        let _ = self.changes.send(change);
    }

    /// Last sequence of `source` already replicated into this store
    pub fn checkpoint(&self, source: &str) -> StoreResult<i64> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT seq FROM replication_checkpoints WHERE source = ?1",
                    params![source],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0))
        })
    }

    pub fn set_checkpoint(&self, source: &str, seq: i64) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO replication_checkpoints (source, seq) VALUES (?1, ?2)",
                params![source, seq],
            )?;
            Ok(())
        })
    }
}

/// Id range `[prefix, prefix + U+FFF0)` covering every id with that prefix
pub fn prefix_range(prefix: &str) -> (String, String) {
    (prefix.to_string(), format!("{}\u{fff0}", prefix))
}

fn read_stored(conn: &Connection, id: &str) -> StoreResult<Option<StoredDoc>> {
    let row = conn
        .query_row(
            "SELECT rev, revs, deleted, body FROM documents WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((rev, revs, deleted, body)) => Ok(Some(StoredDoc {
            rev,
            revs: serde_json::from_str(&revs)?,
            deleted,
            body: serde_json::from_str(&body)?,
        })),
    }
}

/// Write a new revision on top of `parent`
fn write_successor(
    conn: &mut Connection,
    id: &str,
    parent: Option<&StoredDoc>,
    deleted: bool,
    body: &Value,
) -> StoreResult<DocChange> {
    let rev = next_rev(parent.map(|p| p.rev.as_str()), deleted, body)?;
    let mut revs = Vec::new();
    if let Some(parent) = parent {
        revs.push(parent.rev.clone());
        revs.extend(parent.revs.iter().cloned());
        revs.truncate(config::REV_HISTORY_LIMIT);
    }
    write_leaf(
        conn,
        &RevisionLeaf {
            id: id.to_string(),
            rev,
            revs,
            deleted,
            body: body.clone(),
        },
    )
}

/// Store `leaf` as the winning revision and allocate its change sequence
fn write_leaf(conn: &mut Connection, leaf: &RevisionLeaf) -> StoreResult<DocChange> {
    let tx = conn.transaction()?;
    tx.execute("INSERT INTO changes (id) VALUES (?1)", params![leaf.id])?;
    let seq = tx.last_insert_rowid();
    tx.execute(
        r#"
        INSERT OR REPLACE INTO documents (id, rev, revs, deleted, body, seq)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            leaf.id,
            leaf.rev,
            serde_json::to_string(&leaf.revs)?,
            leaf.deleted,
            serde_json::to_string(&leaf.body)?,
            seq,
        ],
    )?;
    tx.commit()?;

    Ok(DocChange {
        seq,
        id: leaf.id.clone(),
        rev: leaf.rev.clone(),
        deleted: leaf.deleted,
        body: leaf.body.clone(),
        replicated: false,
    })
}

/// Next revision id: generation + 1 and a content hash chained to the parent
fn next_rev(parent: Option<&str>, deleted: bool, body: &Value) -> StoreResult<String> {
    let generation = parent.map(rev_generation).unwrap_or(0) + 1;
    let mut hasher = Sha256::new();
    hasher.update(parent.unwrap_or("").as_bytes());
    hasher.update([deleted as u8]);
    hasher.update(serde_json::to_string(body)?.as_bytes());
    let digest = hasher.finalize();
    Ok(format!("{}-{}", generation, hex::encode(&digest[..16])))
}

pub fn rev_generation(rev: &str) -> u64 {
    rev.split('-')
        .next()
        .and_then(|g| g.parse().ok())
        .unwrap_or(0)
}

/// Deterministic winner between two diverged revisions
fn rev_outranks(a: &str, b: &str) -> bool {
    (rev_generation(a), a) > (rev_generation(b), b)
}

fn dedup_preserving_order(revs: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    revs.retain(|rev| seen.insert(rev.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::error::NotFoundReason;
    use serde_json::json;

    fn store() -> DocStore {
        DocStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_put_and_get() {
        let store = store();
        let rev = store.put("card-1", None, &json!({"front": "a"})).unwrap();
        assert!(rev.starts_with("1-"));

        let doc = store.get("card-1").unwrap();
        assert_eq!(doc.rev, rev);
        assert_eq!(doc.body["front"], "a");
    }

    #[test]
    fn test_get_missing_and_deleted() {
        let store = store();
        match store.get("card-x") {
            Err(StoreError::NotFound { reason, .. }) => assert_eq!(reason, NotFoundReason::Missing),
            other => panic!("unexpected {:?}", other),
        }

        let rev = store.put("card-1", None, &json!({})).unwrap();
        store.remove("card-1", &rev).unwrap();
        match store.get("card-1") {
            Err(StoreError::NotFound { reason, .. }) => assert_eq!(reason, NotFoundReason::Deleted),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stale_revision_conflicts() {
        let store = store();
        let first = store.put("doc", None, &json!({"n": 1})).unwrap();
        store.put("doc", Some(&first), &json!({"n": 2})).unwrap();

        let err = store.put("doc", Some(&first), &json!({"n": 3})).unwrap_err();
        assert!(err.is_conflict());

        let err = store.put("doc", None, &json!({"n": 3})).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_recreate_over_tombstone() {
        let store = store();
        let rev = store.put("doc", None, &json!({"n": 1})).unwrap();
        store.remove("doc", &rev).unwrap();

        let rev = store.put("doc", None, &json!({"n": 2})).unwrap();
        assert!(rev.starts_with("3-"));
        assert_eq!(store.get("doc").unwrap().body["n"], 2);
    }

    #[test]
    fn test_stubborn_remove_is_idempotent() {
        let store = store();
        store.put("doc", None, &json!({})).unwrap();
        store.stubborn_remove("doc").unwrap();
        store.stubborn_remove("doc").unwrap();
        store.stubborn_remove("never-written").unwrap();
        assert!(store.get("doc").unwrap_err().is_not_found());
    }

    #[test]
    fn test_upsert_no_change_skips_write() {
        let store = store();
        store.put("doc", None, &json!({"n": 1})).unwrap();
        let seq = store.update_seq().unwrap();

        let result = store.upsert("doc", |_| Ok(None)).unwrap();
        assert!(result.is_none());
        assert_eq!(store.update_seq().unwrap(), seq);
    }

    #[test]
    fn test_upsert_retries_after_concurrent_write() {
        let store = store();
        store.put("doc", None, &json!({"n": 1})).unwrap();

        let mut calls = 0;
        let rev = store
            .upsert("doc", |doc| {
                calls += 1;
                let doc = doc.unwrap();
                if calls == 1 {
                    // Sneak in a write so the first attempt is stale
                    store.put("doc", Some(&doc.rev), &json!({"n": 10})).unwrap();
                }
                let n = doc.body["n"].as_i64().unwrap();
                Ok(Some(json!({"n": n + 1})))
            })
            .unwrap();

        assert!(rev.is_some());
        assert_eq!(calls, 2);
        assert_eq!(store.get("doc").unwrap().body["n"], 11);
    }

    #[test]
    fn test_all_docs_respects_prefix() {
        let store = store();
        store.put("card-1", None, &json!({})).unwrap();
        store.put("card-2", None, &json!({})).unwrap();
        store.put("progress-1", None, &json!({})).unwrap();

        let ids: Vec<String> = store.all_docs("card-").unwrap().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["card-1", "card-2"]);
    }

    #[test]
    fn test_changes_since_reports_latest_state_only() {
        let store = store();
        let rev = store.put("a", None, &json!({"n": 1})).unwrap();
        store.put("b", None, &json!({})).unwrap();
        store.put("a", Some(&rev), &json!({"n": 2})).unwrap();

        let changes = store.changes_since(0, 100).unwrap();
        let ids: Vec<&str> = changes.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(changes[1].body["n"], 2);
    }

    #[test]
    fn test_subscribe_receives_writes() {
        let store = store();
        let mut rx = store.subscribe();
        store.put("a", None, &json!({"n": 1})).unwrap();

        let change = rx.try_recv().unwrap();
        assert_eq!(change.id, "a");
        assert!(!change.deleted);
        assert!(!change.replicated);
    }

    #[test]
    fn test_replicated_writes_are_flagged() {
        let a = store();
        let b = store();
        a.put("doc", None, &json!({"n": 1})).unwrap();
        let mut rx = b.subscribe();
        b.apply_replicated(a.leaf("doc").unwrap().unwrap()).unwrap();

        let change = rx.try_recv().unwrap();
        assert_eq!(change.id, "doc");
        assert!(change.replicated);
    }

    #[test]
    fn test_replicated_fast_forward_and_ancestor() {
        let a = store();
        let b = store();
        let rev1 = a.put("doc", None, &json!({"n": 1})).unwrap();
        b.apply_replicated(a.leaf("doc").unwrap().unwrap()).unwrap();

        a.put("doc", Some(&rev1), &json!({"n": 2})).unwrap();
        let outcome = b.apply_replicated(a.leaf("doc").unwrap().unwrap()).unwrap();
        assert_eq!(outcome, ApplyOutcome::FastForward);
        assert_eq!(b.get("doc").unwrap().body["n"], 2);

        // Re-applying an ancestor is a no-op
        let stale = RevisionLeaf {
            id: "doc".into(),
            rev: rev1,
            revs: vec![],
            deleted: false,
            body: json!({"n": 1}),
        };
        assert_eq!(b.apply_replicated(stale).unwrap(), ApplyOutcome::Unchanged);
    }

    #[test]
    fn test_diverged_leaves_record_conflict_without_resolver() {
        let a = store();
        let b = store();
        let rev1 = a.put("doc", None, &json!({"n": 1})).unwrap();
        b.apply_replicated(a.leaf("doc").unwrap().unwrap()).unwrap();

        a.put("doc", Some(&rev1), &json!({"side": "a"})).unwrap();
        b.put("doc", Some(&rev1), &json!({"side": "b"})).unwrap();

        let outcome = b.apply_replicated(a.leaf("doc").unwrap().unwrap()).unwrap();
        assert_eq!(outcome, ApplyOutcome::Conflict { resolved: false });
        assert_eq!(b.conflicts("doc").unwrap().len(), 1);
    }

    #[test]
    fn test_resolver_settles_conflict() {
        let a = store();
        let b = store();
        b.register_resolver(
            "doc",
            Arc::new(|first: &Value, second: &Value| {
                if first["n"].as_i64() >= second["n"].as_i64() {
                    Winner::First
                } else {
                    Winner::Second
                }
            }),
        );
        let rev1 = a.put("doc", None, &json!({"n": 1})).unwrap();
        b.apply_replicated(a.leaf("doc").unwrap().unwrap()).unwrap();

        a.put("doc", Some(&rev1), &json!({"n": 5})).unwrap();
        b.put("doc", Some(&rev1), &json!({"n": 3})).unwrap();

        let outcome = b.apply_replicated(a.leaf("doc").unwrap().unwrap()).unwrap();
        assert_eq!(outcome, ApplyOutcome::Conflict { resolved: true });
        assert_eq!(b.get("doc").unwrap().body["n"], 5);
        assert!(b.conflicts("doc").unwrap().is_empty());

        // The merged leaf descends from a's leaf, so a fast-forwards
        let outcome = a.apply_replicated(b.leaf("doc").unwrap().unwrap()).unwrap();
        assert_eq!(outcome, ApplyOutcome::FastForward);
    }

    #[test]
    fn test_live_leaf_beats_deleted_branch() {
        let a = store();
        let b = store();
        let rev1 = a.put("doc", None, &json!({"n": 1})).unwrap();
        b.apply_replicated(a.leaf("doc").unwrap().unwrap()).unwrap();

        a.remove("doc", &rev1).unwrap();
        b.put("doc", Some(&rev1), &json!({"n": 2})).unwrap();

        let outcome = b.apply_replicated(a.leaf("doc").unwrap().unwrap()).unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert_eq!(b.get("doc").unwrap().body["n"], 2);
    }

    #[test]
    fn test_rev_generation() {
        assert_eq!(rev_generation("12-abc"), 12);
        assert_eq!(rev_generation("garbage"), 0);
    }

}
