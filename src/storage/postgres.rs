//! External PostgreSQL session store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};

use super::{SessionStore, StorageError, StorageResult, expiry_cutoff};
use crate::session::models::{SessionRecord, SessionStatus, format_timestamp};

/// PostgreSQL-backed store. Connection pool, optimistic writes via
/// `INSERT … ON CONFLICT DO UPDATE`. Same schema as the embedded variant.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|err| StorageError::Broken(format!("connecting to postgres: {err}")))?;

        let store = Self { pool };
        store.init_schema().await?;
        debug!("postgres store ready");
        Ok(store)
    }

    async fn init_schema(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                cwd TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_active_at TEXT NOT NULL,
                message_count BIGINT NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                options_json TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|err| StorageError::Broken(format!("creating sessions table: {err}")))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sessions_user_last_active
            ON sessions(user_id, last_active_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|err| StorageError::Broken(format!("creating sessions index: {err}")))?;

        Ok(())
    }
}

fn unavailable(err: sqlx::Error) -> StorageError {
    StorageError::Unavailable(err.to_string())
}

fn record_from_row(row: &PgRow) -> StorageResult<SessionRecord> {
    let parse_ts = |raw: String| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|err| StorageError::Unavailable(format!("parsing stored timestamp: {err}")))
    };

    let status: String = row.get("status");
    let metadata_json: String = row.get("metadata_json");
    let options_json: String = row.get("options_json");

    Ok(SessionRecord {
        session_id: row.get("session_id"),
        user_id: row.get("user_id"),
        cwd: row.get("cwd"),
        created_at: parse_ts(row.get("created_at"))?,
        last_active_at: parse_ts(row.get("last_active_at"))?,
        message_count: row.get::<i64, _>("message_count").max(0) as u64,
        status: status
            .parse::<SessionStatus>()
            .map_err(StorageError::Unavailable)?,
        metadata: serde_json::from_str(&metadata_json)
            .map_err(|err| StorageError::Unavailable(format!("parsing metadata: {err}")))?,
        options: serde_json::from_str(&options_json)
            .map_err(|err| StorageError::Unavailable(format!("parsing options: {err}")))?,
    })
}

#[async_trait]
impl SessionStore for PostgresStore {
    async fn save(&self, record: &SessionRecord) -> StorageResult<()> {
        let metadata_json = record.metadata.to_string();
        let options_json = serde_json::to_string(&record.options)
            .map_err(|err| StorageError::Unavailable(format!("encoding options: {err}")))?;

        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, user_id, cwd, created_at, last_active_at,
                message_count, status, metadata_json, options_json
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (session_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                cwd = EXCLUDED.cwd,
                last_active_at = EXCLUDED.last_active_at,
                message_count = EXCLUDED.message_count,
                status = EXCLUDED.status,
                metadata_json = EXCLUDED.metadata_json,
                options_json = EXCLUDED.options_json
            "#,
        )
        .bind(&record.session_id)
        .bind(&record.user_id)
        .bind(&record.cwd)
        .bind(format_timestamp(&record.created_at))
        .bind(format_timestamp(&record.last_active_at))
        .bind(record.message_count as i64)
        .bind(record.status.to_string())
        .bind(metadata_json)
        .bind(options_json)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    async fn get(&self, session_id: &str) -> StorageResult<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn delete(&self, session_id: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn touch(&self, session_id: &str, bump_message_count: bool) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET last_active_at = $1, message_count = message_count + $2
            WHERE session_id = $3
            "#,
        )
        .bind(format_timestamp(&Utc::now()))
        .bind(if bump_message_count { 1i64 } else { 0i64 })
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn list(&self, user_id: Option<&str>) -> StorageResult<Vec<String>> {
        let rows = match user_id {
            Some(user) => {
                sqlx::query("SELECT session_id FROM sessions WHERE user_id = $1")
                    .bind(user)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT session_id FROM sessions")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(unavailable)?;

        Ok(rows.iter().map(|row| row.get("session_id")).collect())
    }

    async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        ttl_seconds: u64,
    ) -> StorageResult<Vec<String>> {
        if ttl_seconds == 0 {
            return Ok(Vec::new());
        }
        let cutoff = format_timestamp(&expiry_cutoff(now, ttl_seconds));

        let rows = sqlx::query(
            "DELETE FROM sessions WHERE last_active_at < $1 RETURNING session_id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(rows.iter().map(|row| row.get("session_id")).collect())
    }

    async fn count_active(&self) -> StorageResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sessions WHERE status = 'active'")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(row.get::<i64, _>("n").max(0) as u64)
    }

    fn backend_name(&self) -> &'static str {
        "postgresql"
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
