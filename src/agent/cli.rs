//! Subprocess-backed agent engine.
//!
//! Spawns the configured agent CLI once per turn with line-delimited JSON
//! events on stdout. The first `agent_start` line may carry the engine's own
//! resume token; subsequent turns pass `--resume <token>` so conversation
//! history survives process restarts. Every raw line is appended to the
//! session record file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, warn};

use super::events::{ContextUsage, EngineEvent};
use super::session::{AgentSession, SessionStore};

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Factory for subprocess sessions. `command` is the agent CLI binary name
/// (from global settings); `sessions_dir` holds the per-session JSONL
/// records.
pub struct CliEngine {
    command: String,
    sessions_dir: PathBuf,
}

impl CliEngine {
    pub fn new(command: impl Into<String>, sessions_dir: &Path) -> Self {
        Self {
            command: command.into(),
            sessions_dir: sessions_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl SessionStore for CliEngine {
    async fn create(&self, cwd: &Path) -> Result<Arc<dyn AgentSession>> {
        tokio::fs::create_dir_all(&self.sessions_dir).await?;
        let session_file = self
            .sessions_dir
            .join(format!("{}.jsonl", uuid::Uuid::new_v4()));
        Ok(Arc::new(CliSession::new(
            self.command.clone(),
            cwd.to_path_buf(),
            session_file,
        )))
    }

    async fn open(&self, session_file: &Path) -> Result<Arc<dyn AgentSession>> {
        if !session_file.exists() {
            anyhow::bail!("session record missing: {}", session_file.display());
        }
        // The resume token is replayed from the recorded event stream.
        let session = CliSession::new(
            self.command.clone(),
            session_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            session_file.to_path_buf(),
        );
        session.restore_resume_token().await;
        Ok(Arc::new(session))
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// Wrapper over one raw event line, used only to sniff the resume token.
#[derive(Deserialize)]
struct ResumeProbe {
    #[serde(default)]
    session_id: Option<String>,
}

pub struct CliSession {
    command: String,
    cwd: PathBuf,
    session_file: PathBuf,
    tx: broadcast::Sender<EngineEvent>,
    /// Engine-side resume token, captured from the event stream.
    resume_token: RwLock<Option<String>>,
    /// Running subprocess; shared between the turn driver and `abort`.
    child: Arc<Mutex<Option<Child>>>,
    last_context_usage: RwLock<Option<ContextUsage>>,
}

impl CliSession {
    fn new(command: String, cwd: PathBuf, session_file: PathBuf) -> Self {
        let (tx, _) = broadcast::channel(4096);
        Self {
            command,
            cwd,
            session_file,
            tx,
            resume_token: RwLock::new(None),
            child: Arc::new(Mutex::new(None)),
            last_context_usage: RwLock::new(None),
        }
    }

    /// Scan the session record for the last `session_id` the engine emitted.
    async fn restore_resume_token(&self) {
        let Ok(raw) = tokio::fs::read_to_string(&self.session_file).await else {
            return;
        };
        let token = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<ResumeProbe>(line).ok())
            .filter_map(|probe| probe.session_id)
            .last();
        if token.is_some() {
            *self.resume_token.write().await = token;
        }
    }

    /// Drive one subprocess run: parse stdout lines into events, append raw
    /// lines to the session record, fan out to subscribers.
    async fn event_loop(&self, stdout: tokio::process::ChildStdout) -> Result<()> {
        let mut record = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.session_file)
            .await
            .context("session record open failed")?;

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            record.write_all(line.as_bytes()).await?;
            record.write_all(b"\n").await?;

            if let Ok(probe) = serde_json::from_str::<ResumeProbe>(&line) {
                if let Some(token) = probe.session_id {
                    *self.resume_token.write().await = Some(token);
                }
            }
            match serde_json::from_str::<EngineEvent>(&line) {
                Ok(event) => {
                    let _ = self.tx.send(event);
                }
                Err(_) => {
                    debug!(line = %line, "non-event line from agent subprocess");
                }
            }
        }

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.wait().await;
        }
        Ok(())
    }
}

#[async_trait]
impl AgentSession for CliSession {
    async fn prompt(&self, content: &str, images: &[PathBuf]) -> Result<()> {
        let mut cmd = Command::new(&self.command);
        cmd.args(["--output-format", "stream-json", "-p", content]);
        if let Some(ref token) = *self.resume_token.read().await {
            cmd.args(["--resume", token]);
        }
        for image in images {
            cmd.arg("--image").arg(image);
        }

        let mut child = cmd
            .current_dir(&self.cwd)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn `{}` — is it on PATH?", self.command))?;

        let stdout = child.stdout.take().context("no stdout")?;
        let stderr = child.stderr.take().context("no stderr")?;

        // Drain stderr so the subprocess never blocks on a full pipe.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "agent_stderr", "{}", line);
            }
        });

        *self.child.lock().await = Some(child);
        if let Err(e) = self.event_loop(stdout).await {
            warn!(err = %e, "agent subprocess event loop failed");
            return Err(e);
        }
        Ok(())
    }

    async fn abort(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    async fn context_usage(&self) -> Option<ContextUsage> {
        self.last_context_usage.read().await.clone()
    }

    fn session_file(&self) -> PathBuf {
        self.session_file.clone()
    }
}
