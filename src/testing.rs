//! Test utilities for store and API setup.
//!
//! Builds stores through the same `init_store` path as the server, on a
//! database file inside a temporary directory.

use std::path::Path;
use tempfile::TempDir;

use crate::db::{init_store, Stores};
use crate::state::AppState;

/// Limits used by review sessions started from a test environment
const TEST_MAX_CARDS: u32 = 10;
const TEST_MAX_NEW_CARDS: u32 = 5;

/// On-disk stores that are removed when dropped
pub struct TestEnv {
    /// Temporary directory (kept alive for database file persistence)
    pub temp: TempDir,
    pub stores: Stores,
}

impl TestEnv {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let temp = TempDir::new()?;
        let stores = init_store(&temp.path().join("reviewdeck.db"))?;
        Ok(Self { temp, stores })
    }

    /// Get the temporary directory path for creating test files.
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Handler state with a running review session. Needs a tokio runtime.
    pub fn app_state(&self) -> AppState {
        AppState::new(self.stores.clone(), TEST_MAX_CARDS, TEST_MAX_NEW_CARDS)
    }

    /// In-process server over the full router
    #[cfg(test)]
    pub fn server(&self) -> axum_test::TestServer {
        axum_test::TestServer::new(crate::handlers::router(self.app_state()))
            .expect("Failed to build test server")
    }
}
