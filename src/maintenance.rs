//! Background maintainer: one cooperative task that sweeps expired
//! metadata, evicts idle clients, and recovers from memory pressure.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use tokio::sync::broadcast;

use crate::session::SessionManager;

/// Handle for stopping the maintainer.
pub struct Maintainer {
    shutdown_tx: broadcast::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl Maintainer {
    /// Launch the maintenance loop. It runs every
    /// `limits.maintenance_interval_seconds` until [`Maintainer::stop`].
    pub fn start(manager: Arc<SessionManager>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let interval =
            Duration::from_secs(manager.config().limits.maintenance_interval_seconds.max(1));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        run_cycle(&manager).await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("maintenance loop shutting down");
                        break;
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Cancel the loop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

/// One maintenance pass: TTL sweep, idle eviction, pressure recovery.
pub async fn run_cycle(manager: &Arc<SessionManager>) {
    let limits = &manager.config().limits;
    let ttl = manager.config().storage.ttl_seconds;

    // 1. Expire stale metadata; close any live client for a removed id.
    match manager.store().sweep_expired(Utc::now(), ttl).await {
        Ok(removed) => {
            if !removed.is_empty() {
                info!("ttl sweep removed {} session(s)", removed.len());
            }
            for session_id in removed {
                manager.close_swept(&session_id).await;
            }
        }
        Err(err) => warn!("ttl sweep failed: {err}"),
    }

    // 2. Evict clients idle past the timeout. Metadata stays resumable.
    let idle_timeout = Duration::from_secs(limits.idle_session_timeout_seconds);
    if !idle_timeout.is_zero() {
        for (session_id, last_used) in manager.live_by_last_used().await {
            if last_used.elapsed() >= idle_timeout {
                manager.try_evict(&session_id).await;
            }
        }
    }

    // 3. Recover if the fleet is over the memory ceiling.
    manager.recover_pressure().await;
}
