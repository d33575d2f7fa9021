//! Document store schema.
//!
//! Version-gated migrations: each step checks the recorded schema version,
//! runs once, and records itself in `db_version`. New databases run every
//! step in order.

use chrono::Utc;
use rusqlite::{params, Connection, Result};

/// Current schema version. Increment when adding a migration.
pub const STORE_DB_VERSION: i32 = 2;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS db_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL,
            description TEXT
        );
        "#,
    )?;

    let current_version = get_schema_version(conn)?;
    tracing::debug!("store schema version: {}", current_version);

    if current_version < 1 {
        migrate_v0_to_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v1_to_v2(conn)?;
    }

    Ok(())
}

/// v0→v1: revisioned documents, change sequence and conflict leaves
fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
    tracing::info!("Running migration v0→v1: Create document tables");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            rev TEXT NOT NULL,
            -- ancestor revisions, newest first, as a JSON array
            revs TEXT NOT NULL DEFAULT '[]',
            deleted INTEGER NOT NULL DEFAULT 0,
            body TEXT NOT NULL,
            seq INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS changes (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conflicts (
            id TEXT NOT NULL,
            rev TEXT NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            body TEXT NOT NULL,
            PRIMARY KEY (id, rev)
        );

        CREATE INDEX IF NOT EXISTS idx_documents_seq ON documents(seq);
        "#,
    )?;

    record_version(conn, 1, "Create documents, changes and conflicts tables")?;
    Ok(())
}

/// v1→v2: store identity, replication checkpoints and the due index
fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
    tracing::info!("Running migration v1→v2: Add replication checkpoints and due index");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS replication_checkpoints (
            source TEXT PRIMARY KEY,
            seq INTEGER NOT NULL
        );

        -- Range queries over progress documents by due time
        CREATE INDEX IF NOT EXISTS idx_documents_due
            ON documents(json_extract(body, '$.due'));
        "#,
    )?;

    let store_id = format!("{:016x}", rand::random::<u64>());
    conn.execute(
        "INSERT OR IGNORE INTO store_meta (key, value) VALUES ('store_id', ?1)",
        params![store_id],
    )?;

    record_version(conn, 2, "Add store_meta, replication_checkpoints and due index")?;
    Ok(())
}

fn record_version(conn: &Connection, version: i32, description: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO db_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
        params![version, Utc::now().to_rfc3339(), description],
    )?;
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM db_version",
        [],
        |row| row.get(0),
    )
}
