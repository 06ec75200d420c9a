//! In-memory session store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{SessionStore, StorageResult, expiry_cutoff};
use crate::session::models::{SessionRecord, SessionStatus};

/// Mutex-protected map. O(1) average operations, not restart-safe.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save(&self, record: &SessionRecord) -> StorageResult<()> {
        self.records
            .lock()
            .await
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> StorageResult<Option<SessionRecord>> {
        Ok(self.records.lock().await.get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> StorageResult<()> {
        self.records.lock().await.remove(session_id);
        Ok(())
    }

    async fn touch(&self, session_id: &str, bump_message_count: bool) -> StorageResult<()> {
        if let Some(record) = self.records.lock().await.get_mut(session_id) {
            record.last_active_at = Utc::now();
            if bump_message_count {
                record.message_count += 1;
            }
        }
        Ok(())
    }

    async fn list(&self, user_id: Option<&str>) -> StorageResult<Vec<String>> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|record| user_id.is_none_or(|user| record.user_id == user))
            .map(|record| record.session_id.clone())
            .collect())
    }

    async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        ttl_seconds: u64,
    ) -> StorageResult<Vec<String>> {
        if ttl_seconds == 0 {
            return Ok(Vec::new());
        }
        let cutoff = expiry_cutoff(now, ttl_seconds);

        let mut records = self.records.lock().await;
        let expired: Vec<String> = records
            .values()
            .filter(|record| record.last_active_at < cutoff)
            .map(|record| record.session_id.clone())
            .collect();
        for session_id in &expired {
            records.remove(session_id);
        }
        Ok(expired)
    }

    async fn count_active(&self) -> StorageResult<u64> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|record| record.status == SessionStatus::Active)
            .count() as u64)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
