//! Planning-message persistence with debounced writes.
//!
//! Bursty message traffic coalesces into one write per debounce window;
//! `flush` forces a synchronous write and is called on reset and shutdown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

use crate::tasks::model::Actor;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanningMessage {
    pub id: String,
    pub role: Actor,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl PlanningMessage {
    pub fn new(role: Actor, content: impl Into<String>, metadata: Option<Value>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata,
        }
    }
}

pub struct MessageLog {
    path: PathBuf,
    messages: RwLock<Vec<PlanningMessage>>,
    debounce: Duration,
    flush_scheduled: Arc<AtomicBool>,
}

impl MessageLog {
    pub fn new(artifact_root: &Path, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            path: artifact_root.join("planning-messages.json"),
            messages: RwLock::new(Vec::new()),
            debounce,
            flush_scheduled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn load(&self) {
        if let Ok(raw) = tokio::fs::read_to_string(&self.path).await {
            match serde_json::from_str(&raw) {
                Ok(messages) => *self.messages.write().await = messages,
                Err(e) => warn!(path = %self.path.display(), err = %e, "planning messages unparseable"),
            }
        }
    }

    pub async fn all(&self) -> Vec<PlanningMessage> {
        self.messages.read().await.clone()
    }

    /// Last `count` messages with content truncated to `max_chars`, used to
    /// restore context into a recreated session.
    pub async fn tail(&self, count: usize, max_chars: usize) -> Vec<PlanningMessage> {
        let messages = self.messages.read().await;
        messages
            .iter()
            .rev()
            .take(count)
            .rev()
            .map(|m| {
                let mut m = m.clone();
                if m.content.len() > max_chars {
                    let cut = m
                        .content
                        .char_indices()
                        .nth(max_chars)
                        .map(|(i, _)| i)
                        .unwrap_or(m.content.len());
                    m.content.truncate(cut);
                }
                m
            })
            .collect()
    }

    /// Append a message and schedule a debounced write.
    pub async fn push(self: &Arc<Self>, message: PlanningMessage) {
        self.messages.write().await.push(message);
        self.schedule_flush();
    }

    fn schedule_flush(self: &Arc<Self>) {
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let log = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(log.debounce).await;
            log.flush_scheduled.store(false, Ordering::SeqCst);
            log.flush().await;
        });
    }

    /// Write the current list to disk immediately.
    pub async fn flush(&self) {
        let messages = self.messages.read().await.clone();
        let body = match serde_json::to_string_pretty(&messages) {
            Ok(body) => body,
            Err(e) => {
                warn!(err = %e, "planning messages serialize failed");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&self.path, body).await {
            warn!(path = %self.path.display(), err = %e, "planning messages write failed");
        }
    }

    /// Archive the current list under the given session id and clear it.
    /// Flushes synchronously first.
    pub async fn archive_and_clear(&self, artifact_root: &Path, session_id: &str) {
        self.flush().await;
        let messages = {
            let mut guard = self.messages.write().await;
            std::mem::take(&mut *guard)
        };
        let dir = artifact_root.join("planning-sessions");
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(err = %e, "planning archive dir failed");
            return;
        }
        let body = serde_json::to_string_pretty(&messages).unwrap_or_else(|_| "[]".into());
        let path = dir.join(format!("{session_id}.json"));
        if let Err(e) = tokio::fs::write(&path, body).await {
            warn!(path = %path.display(), err = %e, "planning archive write failed");
        }
        self.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn debounced_push_eventually_persists() {
        let dir = tempfile::tempdir().unwrap();
        let log = MessageLog::new(dir.path(), Duration::from_millis(20));
        log.push(PlanningMessage::new(Actor::User, "hello", None)).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let raw = tokio::fs::read_to_string(dir.path().join("planning-messages.json"))
            .await
            .unwrap();
        assert!(raw.contains("hello"));
    }

    #[tokio::test]
    async fn flush_is_synchronous() {
        let dir = tempfile::tempdir().unwrap();
        let log = MessageLog::new(dir.path(), Duration::from_secs(60));
        log.push(PlanningMessage::new(Actor::User, "now", None)).await;
        log.flush().await;
        let raw = tokio::fs::read_to_string(dir.path().join("planning-messages.json"))
            .await
            .unwrap();
        assert!(raw.contains("now"));
    }

    #[tokio::test]
    async fn archive_clears_current_list() {
        let dir = tempfile::tempdir().unwrap();
        let log = MessageLog::new(dir.path(), Duration::from_millis(10));
        log.push(PlanningMessage::new(Actor::User, "one", None)).await;
        log.archive_and_clear(dir.path(), "sess-1").await;

        assert!(log.all().await.is_empty());
        let archived = tokio::fs::read_to_string(
            dir.path().join("planning-sessions").join("sess-1.json"),
        )
        .await
        .unwrap();
        assert!(archived.contains("one"));
    }

    #[tokio::test]
    async fn tail_truncates_content() {
        let dir = tempfile::tempdir().unwrap();
        let log = MessageLog::new(dir.path(), Duration::from_secs(60));
        for i in 0..15 {
            log.push(PlanningMessage::new(Actor::User, format!("m{i} {}", "x".repeat(600)), None))
                .await;
        }
        let tail = log.tail(10, 500).await;
        assert_eq!(tail.len(), 10);
        assert!(tail.iter().all(|m| m.content.len() <= 500));
        assert!(tail[0].content.starts_with("m5"));
    }
}
