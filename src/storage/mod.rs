//! Pluggable session metadata storage.
//!
//! Three conforming backends: in-memory (not restart-safe), embedded SQLite,
//! and external PostgreSQL. The trait is deliberately narrow; backends own
//! their connection state and nothing outside a store touches it.

mod memory;
mod postgres;
mod sqlite;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::session::models::SessionRecord;
use crate::settings::{StorageBackend, StorageConfig};

#[derive(Debug, Error)]
pub enum StorageError {
    /// Transient backend failure; the operation may be retried.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Contract failure (schema, connection string). Fatal at startup.
    #[error("storage broken: {0}")]
    Broken(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable mapping session_id → metadata.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Upsert by session_id. Durable on return for persistent backends.
    async fn save(&self, record: &SessionRecord) -> StorageResult<()>;

    /// Fetch a record. `Ok(None)` when absent.
    async fn get(&self, session_id: &str) -> StorageResult<Option<SessionRecord>>;

    /// Remove a record. Missing id is not an error.
    async fn delete(&self, session_id: &str) -> StorageResult<()>;

    /// Update `last_active_at` to now, optionally incrementing
    /// `message_count`. Called once per chat turn; must stay cheap.
    /// Missing id is not an error.
    async fn touch(&self, session_id: &str, bump_message_count: bool) -> StorageResult<()>;

    /// Enumerate session ids, optionally filtered by user. Order
    /// unspecified.
    async fn list(&self, user_id: Option<&str>) -> StorageResult<Vec<String>>;

    /// Remove records with `last_active_at + ttl < now` and return the
    /// removed ids. `ttl_seconds == 0` disables expiry (no-op).
    async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        ttl_seconds: u64,
    ) -> StorageResult<Vec<String>>;

    /// Count of non-closed records.
    async fn count_active(&self) -> StorageResult<u64>;

    /// Backend name for the health payload.
    fn backend_name(&self) -> &'static str;

    /// Release backend resources. Default: nothing to do.
    async fn close(&self) {}
}

/// Build the store selected by configuration. Backend contract failures
/// (unreachable database, broken schema) surface as [`StorageError::Broken`]
/// so startup can abort.
pub async fn create_store(config: &StorageConfig) -> StorageResult<Arc<dyn SessionStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Sqlite => Ok(Arc::new(SqliteStore::connect(&config.sqlite_path).await?)),
        StorageBackend::Postgresql => {
            Ok(Arc::new(PostgresStore::connect(&config.postgres_url()).await?))
        }
    }
}

/// Cutoff below which `last_active_at` counts as expired.
pub(crate) fn expiry_cutoff(now: DateTime<Utc>, ttl_seconds: u64) -> DateTime<Utc> {
    now - chrono::Duration::seconds(ttl_seconds as i64)
}
