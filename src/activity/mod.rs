//! Per-workspace activity stream: append-only JSONL log with in-process
//! fan-out.
//!
//! Entries are immutable once appended. Appends are total-order per
//! workspace; every subscriber sees future entries in append order. The log
//! file is `<artifactRoot>/factory/activity.jsonl`, one JSON object per line,
//! with a lazily opened cached handle.

pub mod broadcast;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast as tokio_broadcast, Mutex};
use tracing::warn;

use crate::tasks::model::Actor;

pub use broadcast::{ControlEvent, EventBroadcaster};

/// Cap applied to `replay` limits.
const REPLAY_CAP: usize = 500;

// ─── Entries ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SystemEventKind {
    PhaseChange,
    ExecutionReliability,
    Compaction,
    SkillStart,
    SkillEnd,
    Stall,
    ProviderRetry,
    Timeout,
    Error,
    IoError,
    SubscriberLagged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub role: Actor,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemEvent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub event: SystemEventKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ActivityEntry {
    ChatMessage(ChatMessage),
    SystemEvent(SystemEvent),
}

impl ActivityEntry {
    pub fn id(&self) -> &str {
        match self {
            ActivityEntry::ChatMessage(m) => &m.id,
            ActivityEntry::SystemEvent(e) => &e.id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ActivityEntry::ChatMessage(m) => m.timestamp,
            ActivityEntry::SystemEvent(e) => e.timestamp,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            ActivityEntry::ChatMessage(m) => m.task_id.as_deref(),
            ActivityEntry::SystemEvent(e) => e.task_id.as_deref(),
        }
    }
}

// ─── Log ─────────────────────────────────────────────────────────────────────

pub struct ActivityLog {
    path: PathBuf,
    /// Cached handle; `None` until the first append. The mutex also
    /// serialises appends so persisted order equals broadcast order.
    file: Mutex<Option<tokio::fs::File>>,
    tx: tokio_broadcast::Sender<ActivityEntry>,
}

impl ActivityLog {
    pub fn new(artifact_root: &Path) -> Self {
        let (tx, _) = tokio_broadcast::channel(1024);
        Self {
            path: artifact_root.join("factory").join("activity.jsonl"),
            file: Mutex::new(None),
            tx,
        }
    }

    /// Append a chat message and fan it out.
    pub async fn append_chat(
        &self,
        task_id: Option<String>,
        role: Actor,
        content: impl Into<String>,
        attachments: Vec<String>,
        metadata: Option<Value>,
    ) -> ActivityEntry {
        let entry = ActivityEntry::ChatMessage(ChatMessage {
            id: ulid::Ulid::new().to_string(),
            task_id,
            role,
            content: content.into(),
            attachments,
            timestamp: Utc::now(),
            metadata,
        });
        self.append(entry).await
    }

    /// Append a system event and fan it out.
    pub async fn append_system(
        &self,
        task_id: Option<String>,
        event: SystemEventKind,
        message: impl Into<String>,
        metadata: Option<Value>,
    ) -> ActivityEntry {
        let entry = ActivityEntry::SystemEvent(SystemEvent {
            id: ulid::Ulid::new().to_string(),
            task_id,
            event,
            message: message.into(),
            timestamp: Utc::now(),
            metadata,
        });
        self.append(entry).await
    }

    /// Persist then broadcast. A persistence failure is logged and surfaced
    /// on the subscriber stream as an `io_error` marker; it never aborts the
    /// originating operation.
    async fn append(&self, entry: ActivityEntry) -> ActivityEntry {
        {
            let mut guard = self.file.lock().await;
            if let Err(e) = Self::write_line(&self.path, &mut guard, &entry).await {
                warn!(path = %self.path.display(), err = %e, "activity append failed");
                let marker = ActivityEntry::SystemEvent(SystemEvent {
                    id: ulid::Ulid::new().to_string(),
                    task_id: None,
                    event: SystemEventKind::IoError,
                    message: format!("activity log write failed: {e}"),
                    timestamp: Utc::now(),
                    metadata: None,
                });
                let _ = self.tx.send(marker);
            }
        }
        let _ = self.tx.send(entry.clone());
        entry
    }

    async fn write_line(
        path: &Path,
        guard: &mut Option<tokio::fs::File>,
        entry: &ActivityEntry,
    ) -> anyhow::Result<()> {
        if guard.is_none() {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let f = OpenOptions::new().create(true).append(true).open(path).await?;
            *guard = Some(f);
        }
        let line = serde_json::to_string(entry)? + "\n";
        guard
            .as_mut()
            .expect("file handle opened above")
            .write_all(line.as_bytes())
            .await?;
        Ok(())
    }

    /// Subscribe to all future entries, in append order.
    pub fn subscribe(&self) -> ActivitySubscription {
        ActivitySubscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Return the most recent `limit` entries in append order, optionally
    /// bounded to entries after `since`.
    pub async fn replay(
        &self,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<ActivityEntry>> {
        let limit = limit.min(REPLAY_CAP);
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries: Vec<ActivityEntry> = raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .filter(|e: &ActivityEntry| since.map(|s| e.timestamp() > s).unwrap_or(true))
            .collect();
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        Ok(entries)
    }

    /// Flush the cached handle. Called during shutdown.
    pub async fn flush(&self) {
        if let Some(file) = self.file.lock().await.as_mut() {
            let _ = file.flush().await;
        }
    }
}

/// Receiver wrapper that converts broadcast lag into an explicit marker
/// entry instead of an error. A subscriber that falls behind loses the
/// skipped entries but keeps the stream.
pub struct ActivitySubscription {
    rx: tokio_broadcast::Receiver<ActivityEntry>,
}

impl ActivitySubscription {
    pub async fn recv(&mut self) -> Option<ActivityEntry> {
        loop {
            match self.rx.recv().await {
                Ok(entry) => return Some(entry),
                Err(tokio_broadcast::error::RecvError::Lagged(skipped)) => {
                    return Some(ActivityEntry::SystemEvent(SystemEvent {
                        id: ulid::Ulid::new().to_string(),
                        task_id: None,
                        event: SystemEventKind::SubscriberLagged,
                        message: format!("subscriber lagged, {skipped} entries dropped"),
                        timestamp: Utc::now(),
                        metadata: None,
                    }));
                }
                Err(tokio_broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_persists_and_broadcasts_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActivityLog::new(dir.path());
        let mut sub = log.subscribe();

        log.append_chat(Some("DEMO-1".into()), Actor::User, "hello", vec![], None)
            .await;
        log.append_system(None, SystemEventKind::PhaseChange, "moved", None)
            .await;

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert!(matches!(first, ActivityEntry::ChatMessage(_)));
        assert!(matches!(second, ActivityEntry::SystemEvent(_)));

        let raw = tokio::fs::read_to_string(dir.path().join("factory/activity.jsonl"))
            .await
            .unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"chat-message\""));
        assert!(lines[1].contains("\"system-event\""));
        // Broadcast order is a prefix of persisted order.
        assert!(lines[0].contains(first.id()));
        assert!(lines[1].contains(second.id()));
    }

    #[tokio::test]
    async fn replay_returns_tail_in_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActivityLog::new(dir.path());
        for i in 0..5 {
            log.append_system(None, SystemEventKind::PhaseChange, format!("e{i}"), None)
                .await;
        }
        let entries = log.replay(3, None).await.unwrap();
        assert_eq!(entries.len(), 3);
        let messages: Vec<String> = entries
            .iter()
            .map(|e| match e {
                ActivityEntry::SystemEvent(s) => s.message.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(messages, vec!["e2", "e3", "e4"]);
    }

    #[tokio::test]
    async fn replay_on_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActivityLog::new(dir.path());
        assert!(log.replay(10, None).await.unwrap().is_empty());
    }
}
