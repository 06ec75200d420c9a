//! Subprocess-backed agent client.
//!
//! Each client owns one `claude` CLI process in stream-json mode: prompts go
//! in as NDJSON user messages on stdin, events come back on stdout. A
//! background reader task parses stdout and routes events to the channel of
//! the turn in flight; the per-session lock in the session manager
//! guarantees at most one turn per client at a time.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};

use super::events::{AgentErrorKind, AgentEvent, parse_line};
use super::options::AgentOptions;
use super::{AgentClient, AgentError, AgentRuntime, EventStream, rss};
use crate::settings::AgentRuntimeConfig;

/// Buffered events per in-flight turn.
const TURN_CHANNEL_CAPACITY: usize = 256;

/// Sender side of the turn currently in flight, shared with the reader task.
type TurnSlot = Arc<Mutex<Option<mpsc::Sender<AgentEvent>>>>;

/// Spawns `claude` CLI subprocesses.
pub struct ClaudeRuntime {
    binary: String,
    close_grace: Duration,
}

impl ClaudeRuntime {
    pub fn new(config: &AgentRuntimeConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            close_grace: Duration::from_secs(config.close_grace_seconds),
        }
    }
}

#[async_trait]
impl AgentRuntime for ClaudeRuntime {
    async fn spawn(&self, options: AgentOptions) -> Result<Arc<dyn AgentClient>, AgentError> {
        let client = ClaudeProcess::spawn(&self.binary, options, self.close_grace).await?;
        Ok(Arc::new(client))
    }
}

/// One live `claude` subprocess.
pub struct ClaudeProcess {
    pid: u32,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    turn: TurnSlot,
    closed: Arc<AtomicBool>,
    last_used: std::sync::Mutex<Instant>,
    close_grace: Duration,
    _reader_handle: tokio::task::JoinHandle<()>,
}

impl ClaudeProcess {
    async fn spawn(
        binary: &str,
        options: AgentOptions,
        close_grace: Duration,
    ) -> Result<Self, AgentError> {
        let args = options.build_args();
        debug!("spawning agent: {} {}", binary, args.join(" "));

        let mut cmd = Command::new(binary);
        cmd.args(&args)
            .current_dir(&options.cwd)
            .env("CLAUDE_CODE_ENTRYPOINT", "sdk-http")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(AgentError::Spawn)?;
        let pid = child.id().unwrap_or(0);
        info!("spawned agent process pid={pid} cwd={}", options.cwd.display());

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Spawn(std::io::Error::other("no stdin pipe")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Spawn(std::io::Error::other("no stdout pipe")))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[agent stderr pid={pid}] {line}");
                }
            });
        }

        let turn: TurnSlot = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_handle = {
            let turn = Arc::clone(&turn);
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            for event in parse_line(&line) {
                                let done = matches!(event, AgentEvent::Done);
                                let mut slot = turn.lock().await;
                                if let Some(ref sender) = *slot {
                                    if sender.send(event).await.is_err() {
                                        debug!("turn receiver dropped (pid={pid})");
                                    }
                                }
                                if done {
                                    slot.take();
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!("error reading agent stdout (pid={pid}): {err}");
                            break;
                        }
                    }
                }

                // Stdout closed. If a turn is still waiting, fail it so the
                // caller never hangs on a dead process.
                closed.store(true, Ordering::SeqCst);
                if let Some(sender) = turn.lock().await.take() {
                    let _ = sender
                        .send(AgentEvent::Error {
                            kind: AgentErrorKind::Internal,
                            detail: "agent process exited unexpectedly".to_string(),
                        })
                        .await;
                    let _ = sender.send(AgentEvent::Done).await;
                }
                debug!("agent stdout reader finished (pid={pid})");
            })
        };

        Ok(Self {
            pid,
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            turn,
            closed,
            last_used: std::sync::Mutex::new(Instant::now()),
            close_grace,
            _reader_handle: reader_handle,
        })
    }

    fn touch_last_used(&self) {
        let now = Instant::now();
        match self.last_used.lock() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }
}

#[async_trait]
impl AgentClient for ClaudeProcess {
    async fn ask(&self, prompt: &str) -> Result<EventStream, AgentError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::Closed);
        }

        let (tx, rx) = mpsc::channel(TURN_CHANNEL_CAPACITY);
        *self.turn.lock().await = Some(tx);

        let message = serde_json::json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{"type": "text", "text": prompt}],
            },
        });

        let mut stdin = self.stdin.lock().await;
        let Some(ref mut pipe) = *stdin else {
            self.turn.lock().await.take();
            return Err(AgentError::Closed);
        };
        if let Err(err) = pipe.write_all(format!("{message}\n").as_bytes()).await {
            self.turn.lock().await.take();
            return Err(AgentError::Io(err));
        }
        if let Err(err) = pipe.flush().await {
            self.turn.lock().await.take();
            return Err(AgentError::Io(err));
        }
        drop(stdin);

        self.touch_last_used();
        Ok(rx)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Closing stdin asks the process to finish up on its own.
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        match tokio::time::timeout(self.close_grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("agent process pid={} exited with {status}", self.pid);
            }
            Ok(Err(err)) => {
                warn!("waiting for agent process pid={}: {err}", self.pid);
            }
            Err(_) => {
                warn!(
                    "agent process pid={} did not exit within {:?}, killing",
                    self.pid, self.close_grace
                );
                if let Err(err) = child.start_kill() {
                    warn!("killing agent process pid={}: {err}", self.pid);
                }
                let _ = child.wait().await;
            }
        }
    }

    fn last_used(&self) -> Instant {
        match self.last_used.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn rss_bytes(&self) -> u64 {
        rss::process_tree_rss_bytes(self.pid)
    }
}
