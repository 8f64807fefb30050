//! Capability surface consumed from the external coding-agent engine.
//!
//! The daemon never talks to a model directly; it drives sessions through
//! these traits. One concrete engine ships in-process (`CliEngine`, a
//! subprocess adapter) and a scripted `MockEngine` backs the tests.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::events::{ContextUsage, EngineEvent};

/// One live agent session. Sessions are single-turn-at-a-time: `prompt`
/// starts a turn, events stream to subscribers, and the turn finishes with
/// `turn_end` (or an abort).
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Start a new turn.
    async fn prompt(&self, content: &str, images: &[PathBuf]) -> anyhow::Result<()>;

    /// Cancel the current turn. Idempotent; safe after completion.
    async fn abort(&self);

    /// Subscribe to the session's event stream.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    /// Context-window usage, when the engine reports it.
    async fn context_usage(&self) -> Option<ContextUsage>;

    /// The session record file owned by the engine. Tasks store this path by
    /// reference only.
    fn session_file(&self) -> PathBuf;
}

/// Creates and re-opens session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Start a fresh session rooted at `cwd`.
    async fn create(&self, cwd: &Path) -> anyhow::Result<Arc<dyn AgentSession>>;

    /// Re-open an existing session record, restoring conversation state.
    async fn open(&self, session_file: &Path) -> anyhow::Result<Arc<dyn AgentSession>>;
}
