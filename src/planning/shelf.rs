//! Planning shelf: session-scoped draft tasks and artifacts.
//!
//! Persisted as `<artifactRoot>/shelf.json`. When the file is missing the
//! shelf is rehydrated from draft/artifact metadata on prior planning
//! messages, so a session survives daemon restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::warn;

use super::messages::PlanningMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShelfState {
    #[serde(default)]
    pub drafts: BTreeMap<String, DraftTask>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
}

pub struct Shelf {
    path: PathBuf,
    state: RwLock<ShelfState>,
}

impl Shelf {
    pub fn new(artifact_root: &Path) -> Self {
        Self {
            path: artifact_root.join("shelf.json"),
            state: RwLock::new(ShelfState::default()),
        }
    }

    /// Load from disk; when the file is absent, rebuild from planning-message
    /// metadata.
    pub async fn load(&self, messages: &[PlanningMessage]) {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => *self.state.write().await = state,
                Err(e) => warn!(path = %self.path.display(), err = %e, "shelf unparseable"),
            },
            Err(_) => {
                let rebuilt = rehydrate(messages);
                *self.state.write().await = rebuilt;
            }
        }
    }

    pub async fn snapshot(&self) -> ShelfState {
        self.state.read().await.clone()
    }

    pub async fn add_draft(&self, draft: DraftTask) {
        self.state
            .write()
            .await
            .drafts
            .insert(draft.id.clone(), draft);
        self.save().await;
    }

    pub async fn add_artifact(&self, artifact: Artifact) {
        self.state
            .write()
            .await
            .artifacts
            .insert(artifact.id.clone(), artifact);
        self.save().await;
    }

    /// Remove and return a draft (for promotion into a real task).
    pub async fn take_draft(&self, draft_id: &str) -> Option<DraftTask> {
        let draft = self.state.write().await.drafts.remove(draft_id);
        if draft.is_some() {
            self.save().await;
        }
        draft
    }

    pub async fn clear(&self) {
        *self.state.write().await = ShelfState::default();
        self.save().await;
    }

    async fn save(&self) {
        let state = self.state.read().await.clone();
        let body = match serde_json::to_string_pretty(&state) {
            Ok(body) => body,
            Err(e) => {
                warn!(err = %e, "shelf serialize failed");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&self.path, body).await {
            warn!(path = %self.path.display(), err = %e, "shelf write failed");
        }
    }
}

/// Rebuild shelf state from `draftTask` / `artifact` metadata on planning
/// messages.
fn rehydrate(messages: &[PlanningMessage]) -> ShelfState {
    let mut state = ShelfState::default();
    for message in messages {
        let Some(ref meta) = message.metadata else {
            continue;
        };
        if let Some(value) = meta.get("draftTask") {
            if let Ok(draft) = serde_json::from_value::<DraftTask>(value.clone()) {
                state.drafts.insert(draft.id.clone(), draft);
            }
        }
        if let Some(value) = meta.get("artifact") {
            if let Ok(artifact) = serde_json::from_value::<Artifact>(value.clone()) {
                state.artifacts.insert(artifact.id.clone(), artifact);
            }
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::Actor;

    fn message_with(meta: serde_json::Value) -> PlanningMessage {
        PlanningMessage {
            id: ulid::Ulid::new().to_string(),
            role: Actor::Agent,
            content: String::new(),
            timestamp: Utc::now(),
            metadata: Some(meta),
        }
    }

    #[tokio::test]
    async fn shelf_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let shelf = Shelf::new(dir.path());
        shelf.load(&[]).await;
        shelf
            .add_draft(DraftTask {
                id: "d1".into(),
                title: "draft".into(),
                description: "desc".into(),
                acceptance_criteria: vec!["ok".into()],
                created_at: Utc::now(),
            })
            .await;

        let reopened = Shelf::new(dir.path());
        reopened.load(&[]).await;
        let state = reopened.snapshot().await;
        assert!(state.drafts.contains_key("d1"));
    }

    #[tokio::test]
    async fn rehydrates_from_message_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let messages = vec![
            message_with(serde_json::json!({
                "draftTask": {
                    "id": "d2",
                    "title": "from metadata",
                    "createdAt": Utc::now(),
                }
            })),
            message_with(serde_json::json!({
                "artifact": {
                    "id": "a1",
                    "title": "notes",
                    "content": "…",
                    "createdAt": Utc::now(),
                }
            })),
        ];
        let shelf = Shelf::new(dir.path());
        shelf.load(&messages).await;
        let state = shelf.snapshot().await;
        assert!(state.drafts.contains_key("d2"));
        assert!(state.artifacts.contains_key("a1"));
    }

    #[tokio::test]
    async fn take_draft_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let shelf = Shelf::new(dir.path());
        shelf.load(&[]).await;
        shelf
            .add_draft(DraftTask {
                id: "d3".into(),
                title: "t".into(),
                description: String::new(),
                acceptance_criteria: vec![],
                created_at: Utc::now(),
            })
            .await;
        assert!(shelf.take_draft("d3").await.is_some());
        assert!(shelf.take_draft("d3").await.is_none());
    }
}
