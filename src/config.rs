//! Application configuration constants.
//!
//! Tunables for the document store, suggestion queries and review sessions
//! live here alongside the config.toml / .env loading.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

// ==================== Config File ====================

/// Configuration file structure for config.toml
#[derive(Debug, Default, Deserialize)]
struct AppConfig {
    database: Option<DatabaseConfig>,
    review: Option<ReviewConfig>,
}

#[derive(Debug, Deserialize)]
struct DatabaseConfig {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewConfig {
    max_cards: Option<u32>,
    max_new_cards: Option<u32>,
}

fn read_config_file() -> Option<AppConfig> {
    let contents = std::fs::read_to_string("config.toml").ok()?;
    match toml::from_str::<AppConfig>(&contents) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!("Ignoring malformed config.toml: {}", e);
            None
        }
    }
}

/// Load database path with priority: config.toml > .env > default
pub fn load_database_path() -> PathBuf {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    // Priority 1: config.toml
    if let Some(path) = read_config_file()
        .and_then(|config| config.database)
        .and_then(|db| db.path)
    {
        tracing::info!("Using database from config.toml: {}", path);
        return PathBuf::from(path);
    }

    // Priority 2: .env DATABASE_PATH
    if let Ok(path) = std::env::var("DATABASE_PATH") {
        tracing::info!("Using database from DATABASE_PATH env: {}", path);
        return PathBuf::from(path);
    }

    let default = PathBuf::from(crate::paths::db_path());
    tracing::info!("Using default database path: {}", default.display());
    default
}

/// Review limits with priority: config.toml > defaults
pub fn load_review_limits() -> (u32, u32) {
    let review = read_config_file().and_then(|config| config.review);
    let max_cards = review
        .as_ref()
        .and_then(|r| r.max_cards)
        .unwrap_or(DEFAULT_MAX_CARDS);
    let max_new_cards = review
        .as_ref()
        .and_then(|r| r.max_new_cards)
        .unwrap_or(DEFAULT_MAX_NEW_CARDS);
    (max_cards, max_new_cards)
}

// ==================== Server Configuration ====================

/// Server address to bind to
pub const SERVER_ADDR: &str = "0.0.0.0";

/// Server port (overridable with PORT)
pub const SERVER_PORT: u16 = 3000;

pub fn server_port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(SERVER_PORT)
}

/// Get the full server bind address
pub fn server_bind_addr() -> String {
    format!("{}:{}", SERVER_ADDR, server_port())
}

// ==================== Document Store ====================

/// Buffered change notifications per subscriber before it starts lagging
pub const CHANGE_FEED_CAPACITY: usize = 1024;

/// Attempts for read-modify-write upserts before surfacing a conflict
pub const UPSERT_RETRIES: usize = 10;

/// Attempts for stubborn deletes before surfacing a conflict
pub const STUBBORN_RETRIES: usize = 10;

/// Fresh ids tried when a newly generated card id collides
pub const ID_COLLISION_RETRIES: usize = 5;

/// Ancestor revisions remembered per document
pub const REV_HISTORY_LIMIT: usize = 100;

/// Changes read per batch while replicating
pub const REPLICATION_BATCH_SIZE: usize = 100;

// ==================== Suggestions ====================

/// Minimum rows fetched from the keyword/tag aggregate for a prefix query
pub const SUGGESTION_MIN_FETCH: usize = 40;

/// Minimum rows fetched when the prefix is empty
pub const SUGGESTION_MIN_FETCH_ALL: usize = 200;

/// Entries remembered as "recently added" in a suggestion session
pub const RECENT_SUGGESTIONS: usize = 3;

/// Default number of suggestions returned
pub const DEFAULT_SUGGESTION_LIMIT: usize = 6;

/// Prefix lookups a suggestion session keeps cached
pub const SUGGESTION_CACHE_ENTRIES: usize = 64;

// ==================== Review Sessions ====================

/// Default cards per review
pub const DEFAULT_MAX_CARDS: u32 = 20;

/// Default new cards per review
pub const DEFAULT_MAX_NEW_CARDS: u32 = 5;

/// Delay used to coalesce bursts of card changes into one fetch
pub const REFRESH_DEBOUNCE: Duration = Duration::from_millis(3000);

/// Queue depth for actions and store events sent to a review session
pub const SESSION_QUEUE_CAPACITY: usize = 256;

// ==================== Query Limits ====================

/// Default page size for card listings
pub const DEFAULT_CARD_LIMIT: usize = 50;
