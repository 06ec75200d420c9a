//! The session manager: owns the live set of agent clients, enforces
//! per-session serialization, admission control, and LRU pressure recovery.
//!
//! Locking discipline:
//! - `registry` guards only the structure of the live-client map and the
//!   admission counters. It is never held across subprocess spawn or any
//!   other slow await.
//! - `session_locks[id]` is held for the whole of a chat turn, by one task.
//!   Close waits for it; eviction paths use `try_lock` and skip sessions
//!   with a turn in flight.
//! - `in_flight` caps concurrently executing turns fleet-wide; permits are
//!   owned by the turn driver and released on every exit path.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore, mpsc};
use uuid::Uuid;

use crate::agent::{AgentClient, AgentErrorKind, AgentEvent, AgentOptions, AgentRuntime};
use crate::settings::{AppConfig, PERMISSION_MODES};
use crate::storage::SessionStore;
use crate::stream::{ChatAccumulator, StreamRecord, StreamTranslator};
use crate::workspace;

use super::error::{SessionError, SessionResult};
use super::models::{
    ChatResponse, CreateSessionRequest, SessionInfo, SessionRecord, SessionStatus,
};

/// Buffered stream records per chat turn.
const STREAM_CHANNEL_CAPACITY: usize = 256;

/// Upper bound accepted for `max_turns` overrides.
const MAX_TURNS_CEILING: u32 = 1000;

/// Upper bound accepted for `max_budget_usd` overrides.
const MAX_BUDGET_CEILING: f64 = 100.0;

/// Maximum accepted system prompt length.
const SYSTEM_PROMPT_MAX_LEN: usize = 50_000;

/// Maximum accepted chat message length.
const MESSAGE_MAX_LEN: usize = 100_000;

type SessionLock = Arc<Mutex<()>>;

/// A registered client plus the user the slot is charged to.
struct LiveClient {
    user_id: String,
    client: Arc<dyn AgentClient>,
}

/// Live-client registry. Guarded by one mutex; the counters include slots
/// reserved for spawns still in progress so concurrent creates cannot slip
/// under the caps together.
#[derive(Default)]
struct Registry {
    clients: HashMap<String, LiveClient>,
    per_user: HashMap<String, usize>,
    reserved: usize,
}

impl Registry {
    fn user_count(&self, user_id: &str) -> usize {
        self.per_user.get(user_id).copied().unwrap_or(0)
    }

    fn total(&self) -> usize {
        self.clients.len() + self.reserved
    }

    fn drop_user_slot(&mut self, user_id: &str) {
        if let Some(count) = self.per_user.get_mut(user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_user.remove(user_id);
            }
        }
    }

    /// Remove a client and release its per-user slot.
    fn remove(&mut self, session_id: &str) -> Option<Arc<dyn AgentClient>> {
        let entry = self.clients.remove(session_id)?;
        self.drop_user_slot(&entry.user_id);
        Some(entry.client)
    }
}

pub struct SessionManager {
    config: Arc<AppConfig>,
    store: Arc<dyn SessionStore>,
    runtime: Arc<dyn AgentRuntime>,
    registry: Mutex<Registry>,
    session_locks: Mutex<HashMap<String, SessionLock>>,
    in_flight: Arc<Semaphore>,
    started_at: Instant,
}

impl SessionManager {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn SessionStore>,
        runtime: Arc<dyn AgentRuntime>,
    ) -> Arc<Self> {
        let in_flight = Arc::new(Semaphore::new(config.limits.max_concurrent_requests));
        Arc::new(Self {
            config,
            store,
            runtime,
            registry: Mutex::new(Registry::default()),
            session_locks: Mutex::new(HashMap::new()),
            in_flight,
            started_at: Instant::now(),
        })
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Create a session: derive and ensure the working directory, pass
    /// admission, spawn the agent, persist the record, register the client.
    pub async fn create(&self, request: CreateSessionRequest) -> SessionResult<SessionInfo> {
        let cwd = workspace::build_cwd(
            Path::new(&self.config.user.base_dir),
            &request.user_id,
            request.subdir.as_deref(),
        )?;
        workspace::ensure_directory(&cwd, self.config.user.auto_create_dir)?;

        let options = self.resolve_options(&request, &cwd)?;
        let metadata = match request.metadata {
            Some(Value::Object(map)) => Value::Object(map),
            Some(_) => {
                return Err(SessionError::InvalidInput(
                    "metadata must be a JSON object".to_string(),
                ));
            }
            None => Value::Object(Default::default()),
        };

        self.reserve_slot(&request.user_id).await?;

        let session_id = Uuid::new_v4().to_string();
        let mut spawn_options = options.clone();
        spawn_options.session_id = Some(session_id.clone());

        // Spawn outside every lock; only the reservation holds the slot.
        let client = match self.runtime.spawn(spawn_options).await {
            Ok(client) => client,
            Err(err) => {
                self.release_reservation(&request.user_id).await;
                return Err(err.into());
            }
        };

        let record = SessionRecord::new(
            session_id.clone(),
            request.user_id.clone(),
            cwd.to_string_lossy().to_string(),
            metadata,
            options,
        );
        if let Err(err) = self.store.save(&record).await {
            client.close().await;
            self.release_reservation(&request.user_id).await;
            return Err(err.into());
        }

        self.install_client(&session_id, &request.user_id, client).await;
        info!("created session {session_id} for user {}", request.user_id);
        Ok(SessionInfo::from(&record))
    }

    /// Merge configured defaults with per-request overrides.
    fn resolve_options(
        &self,
        request: &CreateSessionRequest,
        cwd: &Path,
    ) -> SessionResult<AgentOptions> {
        let mut options = AgentOptions::from_defaults(&self.config.defaults, cwd.to_path_buf());

        if let Some(ref prompt) = request.system_prompt {
            if prompt.len() > SYSTEM_PROMPT_MAX_LEN {
                return Err(SessionError::InvalidInput(format!(
                    "system_prompt too long ({} > {SYSTEM_PROMPT_MAX_LEN})",
                    prompt.len()
                )));
            }
            options.system_prompt = Some(prompt.clone());
        }
        if let Some(ref mode) = request.permission_mode {
            if !PERMISSION_MODES.contains(&mode.as_str()) {
                return Err(SessionError::InvalidInput(format!(
                    "permission_mode must be one of {PERMISSION_MODES:?}"
                )));
            }
            options.permission_mode = mode.clone();
        }
        if let Some(ref tools) = request.allowed_tools {
            options.allowed_tools = tools.clone();
        }
        if let Some(ref tools) = request.disallowed_tools {
            options.disallowed_tools = tools.clone();
        }
        if let Some(ref model) = request.model {
            options.model = Some(model.clone());
        }
        if let Some(max_turns) = request.max_turns {
            if max_turns == 0 || max_turns > MAX_TURNS_CEILING {
                return Err(SessionError::InvalidInput(format!(
                    "max_turns must be between 1 and {MAX_TURNS_CEILING}"
                )));
            }
            options.max_turns = Some(max_turns);
        }
        if let Some(budget) = request.max_budget_usd {
            if !(0.0..=MAX_BUDGET_CEILING).contains(&budget) {
                return Err(SessionError::InvalidInput(format!(
                    "max_budget_usd must be between 0 and {MAX_BUDGET_CEILING}"
                )));
            }
            options.max_budget_usd = Some(budget);
        }
        if let Some(ref servers) = request.mcp_servers {
            options.mcp_servers = servers.clone();
        }
        if let Some(ref plugins) = request.plugins {
            options.plugins = plugins.clone();
        }
        if let Some(ref dirs) = request.add_dirs {
            options.add_dirs = workspace::build_add_dirs(cwd, dirs)?;
        }

        Ok(options)
    }

    // ========================================================================
    // Chat
    // ========================================================================

    /// Synchronous chat: run the turn to completion and return the
    /// accumulated response.
    pub async fn chat(
        self: &Arc<Self>,
        session_id: &str,
        message: &str,
    ) -> SessionResult<ChatResponse> {
        let mut records = self.chat_stream(session_id, message).await?;

        let mut accumulator = ChatAccumulator::new();
        while let Some(record) = records.recv().await {
            accumulator.absorb(&record);
        }
        Ok(accumulator.into_response(session_id.to_string()))
    }

    /// Streaming chat: returns the channel of translated records for the
    /// turn. The turn is driven by a detached task, so dropping the receiver
    /// does not cancel it; `message_count` stays consistent either way.
    pub async fn chat_stream(
        self: &Arc<Self>,
        session_id: &str,
        message: &str,
    ) -> SessionResult<mpsc::Receiver<StreamRecord>> {
        if message.trim().is_empty() {
            return Err(SessionError::InvalidInput(
                "message cannot be empty".to_string(),
            ));
        }
        if message.len() > MESSAGE_MAX_LEN {
            return Err(SessionError::InvalidInput(format!(
                "message too long ({} > {MESSAGE_MAX_LEN})",
                message.len()
            )));
        }

        // 1. Per-session lock, reject-fast.
        let guard = self.try_lock_session(session_id).await?;

        // 2. One fleet-wide permit, reject-fast.
        let permit = self.in_flight.clone().try_acquire_owned().map_err(|_| {
            SessionError::Overloaded("too many concurrent requests, try again later".to_string())
        })?;

        // 3. Live client, resuming from the store if needed.
        let client = self.ensure_live(session_id).await?;

        // 4. Ask and hand the stream to the turn driver.
        let events = client.ask(message).await?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        let manager = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            manager
                .drive_turn(session_id, client, events, tx, guard, permit)
                .await;
        });

        Ok(rx)
    }

    /// Consume the agent event stream for one turn, translating and
    /// forwarding records. Holds the per-session lock and the in-flight
    /// permit until the turn ends; both release when the guards drop, on
    /// every exit path.
    async fn drive_turn(
        self: Arc<Self>,
        session_id: String,
        client: Arc<dyn AgentClient>,
        mut events: mpsc::Receiver<AgentEvent>,
        tx: mpsc::Sender<StreamRecord>,
        guard: OwnedMutexGuard<()>,
        _permit: OwnedSemaphorePermit,
    ) {
        let stall_timeout = self.config.limits.turn_timeout_seconds;
        let mut translator = StreamTranslator::new();

        loop {
            let next = if stall_timeout > 0 {
                match tokio::time::timeout(Duration::from_secs(stall_timeout), events.recv()).await
                {
                    Ok(event) => event,
                    Err(_) => {
                        warn!(
                            "turn for session {session_id} stalled past {stall_timeout}s, \
                             evicting client"
                        );
                        let _ = tx
                            .send(StreamRecord::Error {
                                kind: AgentErrorKind::Internal.to_string(),
                                detail: "turn timed out".to_string(),
                            })
                            .await;
                        let _ = tx.send(StreamRecord::Done).await;
                        // A wedged subprocess must not keep its slot.
                        let removed = self.registry.lock().await.remove(&session_id);
                        drop(removed);
                        client.close().await;
                        break;
                    }
                }
            } else {
                events.recv().await
            };

            let Some(event) = next else {
                // Agent stream ended without a terminal record: the process
                // is gone. Fail the turn and drop the dead client.
                let _ = tx
                    .send(StreamRecord::Error {
                        kind: AgentErrorKind::Internal.to_string(),
                        detail: "agent stream ended unexpectedly".to_string(),
                    })
                    .await;
                let _ = tx.send(StreamRecord::Done).await;
                let removed = self.registry.lock().await.remove(&session_id);
                drop(removed);
                client.close().await;
                break;
            };

            if let Some(record) = translator.translate(&event) {
                let is_done = matches!(record, StreamRecord::Done);
                // A dropped receiver must not cancel the turn; keep draining.
                let _ = tx.send(record).await;
                if is_done {
                    break;
                }
            }
        }

        if let Err(err) = self.store.touch(&session_id, true).await {
            warn!("recording turn for session {session_id}: {err}");
        }
        drop(guard);
    }

    // ========================================================================
    // Resume / close / reads
    // ========================================================================

    /// Recreate a live client for a session whose metadata still exists.
    pub async fn resume(&self, session_id: &str) -> SessionResult<SessionInfo> {
        self.ensure_live(session_id).await?;

        let record = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        self.store.touch(session_id, false).await?;
        Ok(SessionInfo::from(&record))
    }

    /// Close a session: wait for any in-flight turn, tear down the client,
    /// and remove the metadata record.
    pub async fn close(&self, session_id: &str) -> SessionResult<()> {
        let guard = self.lock_session(session_id).await;

        let client = self.registry.lock().await.remove(session_id);
        let had_client = client.is_some();
        if let Some(client) = client {
            client.close().await;
        }

        let record = self.store.get(session_id).await?;
        if record.is_none() && !had_client {
            // Entry removal happens under the guard so no waiter can slip
            // onto the dying lock.
            self.remove_session_lock(session_id).await;
            drop(guard);
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        if let Some(mut record) = record {
            record.status = SessionStatus::Closed;
            self.store.save(&record).await?;
            self.store.delete(session_id).await?;
        }

        self.remove_session_lock(session_id).await;
        drop(guard);
        info!("closed session {session_id}");
        Ok(())
    }

    /// Metadata read.
    pub async fn get(&self, session_id: &str) -> SessionResult<SessionInfo> {
        let record = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        Ok(SessionInfo::from(&record))
    }

    /// Enumerate session ids, optionally for one user.
    pub async fn list(&self, user_id: Option<&str>) -> SessionResult<Vec<String>> {
        Ok(self.store.list(user_id).await?)
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Reserve one live-client slot for `user_id`. On capacity or memory
    /// pressure, attempt LRU recovery once before refusing.
    async fn reserve_slot(&self, user_id: &str) -> SessionResult<()> {
        for attempt in 0..2 {
            // Memory is sampled outside the registry lock; it is an
            // estimate, the count caps are the strict ones.
            let over_memory = self.over_memory_limit().await;

            {
                let mut registry = self.registry.lock().await;
                if registry.user_count(user_id) >= self.config.limits.max_sessions_per_user {
                    return Err(SessionError::QuotaExceeded(format!(
                        "user {user_id} already has {} live sessions (limit {})",
                        registry.user_count(user_id),
                        self.config.limits.max_sessions_per_user
                    )));
                }
                if registry.total() < self.config.limits.max_sessions && !over_memory {
                    registry.reserved += 1;
                    *registry.per_user.entry(user_id.to_string()).or_default() += 1;
                    return Ok(());
                }
            }

            if attempt == 0 {
                self.recover_pressure().await;
            }
        }

        Err(SessionError::Overloaded(
            "session capacity exhausted, try again later".to_string(),
        ))
    }

    async fn release_reservation(&self, user_id: &str) {
        let mut registry = self.registry.lock().await;
        registry.reserved = registry.reserved.saturating_sub(1);
        registry.drop_user_slot(user_id);
    }

    /// Convert a reservation into a registered client and create the
    /// per-session lock entry. The per-user slot was charged at reserve
    /// time and carries over.
    async fn install_client(&self, session_id: &str, user_id: &str, client: Arc<dyn AgentClient>) {
        {
            let mut registry = self.registry.lock().await;
            registry.clients.insert(
                session_id.to_string(),
                LiveClient {
                    user_id: user_id.to_string(),
                    client,
                },
            );
            registry.reserved = registry.reserved.saturating_sub(1);
        }
        self.session_locks
            .lock()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
    }

    async fn over_memory_limit(&self) -> bool {
        let limit_mb = self.config.limits.memory_limit_mb;
        if limit_mb == 0 {
            return false;
        }
        self.fleet_rss_bytes().await > limit_mb * 1024 * 1024
    }

    /// Broker RSS plus every live client's process tree.
    pub async fn fleet_rss_bytes(&self) -> u64 {
        let clients: Vec<Arc<dyn AgentClient>> = {
            let registry = self.registry.lock().await;
            registry
                .clients
                .values()
                .map(|entry| Arc::clone(&entry.client))
                .collect()
        };
        clients
            .iter()
            .fold(crate::agent::rss::self_rss_bytes(), |total, client| {
                total.saturating_add(client.rss_bytes())
            })
    }

    // ========================================================================
    // Live-client lifecycle
    // ========================================================================

    /// Return the live client for `session_id`, spawning one from the
    /// stored record if absent. Callers racing here serialize on the
    /// registry: the loser finds the winner's client and proceeds with it.
    async fn ensure_live(&self, session_id: &str) -> SessionResult<Arc<dyn AgentClient>> {
        if let Some(entry) = self.registry.lock().await.clients.get(session_id) {
            return Ok(Arc::clone(&entry.client));
        }

        let record = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if record.status == SessionStatus::Closed {
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        if let Err(err) = self.reserve_slot(&record.user_id).await {
            // A concurrent resume may have installed the client and taken
            // the last slot; the loser proceeds with the winner's client.
            if let Some(entry) = self.registry.lock().await.clients.get(session_id) {
                return Ok(Arc::clone(&entry.client));
            }
            return Err(err);
        }

        // The subprocess restores its own conversation log from the resume
        // token; we only replay the stored option set.
        let mut options = record.options.clone();
        options.session_id = None;
        options.resume = Some(session_id.to_string());

        let client = match self.runtime.spawn(options).await {
            Ok(client) => client,
            Err(err) => {
                self.release_reservation(&record.user_id).await;
                return Err(err.into());
            }
        };

        // Re-check under the registry lock: a concurrent resume may have
        // installed a client while we were spawning.
        let existing = {
            let registry = self.registry.lock().await;
            registry
                .clients
                .get(session_id)
                .map(|entry| Arc::clone(&entry.client))
        };
        if let Some(existing) = existing {
            self.release_reservation(&record.user_id).await;
            client.close().await;
            debug!("session {session_id} resumed by concurrent caller");
            return Ok(existing);
        }

        self.install_client(session_id, &record.user_id, Arc::clone(&client))
            .await;
        info!("resumed session {session_id} for user {}", record.user_id);
        Ok(client)
    }

    /// Evict an idle client if no turn is in flight. Returns whether the
    /// client was evicted. Metadata stays present and resumable.
    pub async fn try_evict(&self, session_id: &str) -> bool {
        let Some(lock) = self.session_locks.lock().await.get(session_id).cloned() else {
            return false;
        };
        let Ok(guard) = lock.try_lock_owned() else {
            return false; // turn in flight, skip
        };

        let client = self.registry.lock().await.remove(session_id);
        let evicted = client.is_some();
        if let Some(client) = client {
            client.close().await;
            debug!("evicted idle client for session {session_id}");
        }

        self.remove_session_lock(session_id).await;
        drop(guard);
        evicted
    }

    /// Close the live client for an id removed by the TTL sweep. Waits for
    /// any in-flight turn before tearing down.
    pub async fn close_swept(&self, session_id: &str) {
        let guard = self.lock_session(session_id).await;
        let client = self.registry.lock().await.remove(session_id);
        if let Some(client) = client {
            client.close().await;
            info!("closed expired session {session_id}");
        }
        self.remove_session_lock(session_id).await;
        drop(guard);
    }

    /// Snapshot of live sessions ordered by ascending last use.
    pub async fn live_by_last_used(&self) -> Vec<(String, Instant)> {
        let registry = self.registry.lock().await;
        let mut entries: Vec<(String, Instant)> = registry
            .clients
            .iter()
            .map(|(id, entry)| (id.clone(), entry.client.last_used()))
            .collect();
        entries.sort_by_key(|(_, last_used)| *last_used);
        entries
    }

    /// Evict least-recently-used idle clients until RSS drops under the
    /// limit or nothing evictable remains.
    pub async fn recover_pressure(&self) {
        let limit_mb = self.config.limits.memory_limit_mb;
        if limit_mb == 0 {
            return;
        }
        let limit_bytes = limit_mb * 1024 * 1024;

        loop {
            if self.fleet_rss_bytes().await <= limit_bytes {
                return;
            }
            let candidates = self.live_by_last_used().await;
            if candidates.is_empty() {
                return;
            }
            let mut evicted_any = false;
            for (session_id, _) in candidates {
                if self.try_evict(&session_id).await {
                    info!("pressure recovery evicted session {session_id}");
                    evicted_any = true;
                    break;
                }
            }
            if !evicted_any {
                return; // everything left is mid-turn
            }
        }
    }

    /// Number of live agent clients.
    pub async fn live_count(&self) -> usize {
        self.registry.lock().await.clients.len()
    }

    /// Close every live client in parallel. Used at shutdown; the close
    /// grace window is enforced inside each client.
    pub async fn shutdown(&self) {
        let clients: Vec<(String, LiveClient)> = {
            let mut registry = self.registry.lock().await;
            registry.per_user.clear();
            registry.clients.drain().collect()
        };
        if clients.is_empty() {
            return;
        }

        info!("shutting down {} live agent clients", clients.len());
        let closers = clients.into_iter().map(|(session_id, entry)| async move {
            entry.client.close().await;
            debug!("closed client for session {session_id}");
        });
        futures::future::join_all(closers).await;
        self.session_locks.lock().await.clear();
    }

    // ========================================================================
    // Lock plumbing
    // ========================================================================

    /// Reject-fast acquisition of the canonical per-session lock. Loops when
    /// the entry was replaced between fetch and acquisition (close or
    /// eviction ran in the gap), so a stale lock can never serialize a turn.
    async fn try_lock_session(&self, session_id: &str) -> SessionResult<OwnedMutexGuard<()>> {
        loop {
            let lock = self.get_session_lock(session_id).await;
            let guard = lock
                .clone()
                .try_lock_owned()
                .map_err(|_| SessionError::Busy(session_id.to_string()))?;

            let canonical = self.session_locks.lock().await.get(session_id).cloned();
            match canonical {
                Some(current) if Arc::ptr_eq(&current, &lock) => return Ok(guard),
                _ => continue,
            }
        }
    }

    /// Waiting acquisition of the canonical per-session lock (close and
    /// sweep paths).
    async fn lock_session(&self, session_id: &str) -> OwnedMutexGuard<()> {
        loop {
            let lock = self.get_session_lock(session_id).await;
            let guard = lock.clone().lock_owned().await;

            let canonical = self.session_locks.lock().await.get(session_id).cloned();
            match canonical {
                Some(current) if Arc::ptr_eq(&current, &lock) => return guard,
                _ => continue,
            }
        }
    }

    async fn get_session_lock(&self, session_id: &str) -> SessionLock {
        self.session_locks
            .lock()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn remove_session_lock(&self, session_id: &str) {
        self.session_locks.lock().await.remove(session_id);
    }
}
