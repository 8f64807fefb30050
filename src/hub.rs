//! Integration hub: per-workspace service wiring.
//!
//! Replaces process-global registries with one typed map owned by the
//! daemon: every workspace gets a `WorkspaceCore` (store, activity,
//! broadcaster, engine, guardrails, queue kick channel) plus the supervisor,
//! queue manager, and planning session built on top of it.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::activity::{ActivityLog, EventBroadcaster, SystemEventKind};
use crate::agent::SessionStore;
use crate::config::Settings;
use crate::error::Result;
use crate::planning::PlanningSession;
use crate::queue::QueueManager;
use crate::supervisor::guardrails::Guardrails;
use crate::supervisor::ExecutionSupervisor;
use crate::tasks::model::{Actor, Phase, Plan, Task};
use crate::tasks::store::{CreateTaskRequest, UpdateTaskRequest};
use crate::tasks::{TaskScope, TaskStore};
use crate::workspace::{Workspace, WorkspaceConfig, WorkspaceRegistry};

// ─── Tool payloads ───────────────────────────────────────────────────────────

/// Payload of the `save_plan` extension tool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavePlanPayload {
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub plan: Plan,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QaQuestion {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QaAnswer {
    pub question_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_option: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

// ─── Workspace core ──────────────────────────────────────────────────────────

/// Shared per-workspace state every service hangs off.
pub struct WorkspaceCore {
    pub workspace: Workspace,
    pub config: RwLock<WorkspaceConfig>,
    pub store: TaskStore,
    pub activity: ActivityLog,
    pub broadcaster: EventBroadcaster,
    pub engine: Arc<dyn SessionStore>,
    pub guardrails: Guardrails,
    kick_tx: mpsc::UnboundedSender<()>,
}

impl WorkspaceCore {
    /// Build the core plus the kick receiver the queue loop will consume.
    pub fn new(
        workspace: Workspace,
        config: WorkspaceConfig,
        engine: Arc<dyn SessionStore>,
        guardrails: Guardrails,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (kick_tx, kick_rx) = mpsc::unbounded_channel();
        let tasks_dir = workspace
            .artifact_root
            .join(&config.default_task_location);
        let core = Arc::new(Self {
            store: TaskStore::new(&workspace.path, &workspace.artifact_root, &tasks_dir),
            activity: ActivityLog::new(&workspace.artifact_root),
            broadcaster: EventBroadcaster::new(),
            config: RwLock::new(config),
            engine,
            guardrails,
            workspace,
            kick_tx,
        });
        (core, kick_rx)
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace.id
    }

    /// Ask the queue manager to re-evaluate promotions and dispatches.
    /// Every mutation that could change eligibility ends with this.
    pub fn request_kick(&self) {
        let _ = self.kick_tx.send(());
    }

    pub async fn config(&self) -> WorkspaceConfig {
        self.config.read().await.clone()
    }

    pub async fn set_config(&self, config: WorkspaceConfig) {
        *self.config.write().await = config;
        self.request_kick();
    }
}

// ─── Hub ─────────────────────────────────────────────────────────────────────

/// The per-workspace service bundle.
pub struct WorkspaceServices {
    pub core: Arc<WorkspaceCore>,
    pub supervisor: Arc<ExecutionSupervisor>,
    pub queue: Arc<QueueManager>,
    pub planning: Arc<PlanningSession>,
}

impl std::fmt::Debug for WorkspaceServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceServices").finish_non_exhaustive()
    }
}

impl WorkspaceServices {
    /// Command surface for the transport layer. Every mutation follows the
    /// same path: store write, activity entry, broadcast, queue kick.
    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<Task> {
        let task = self.core.store.create_task(request).await?;
        self.core
            .activity
            .append_system(
                Some(task.id().to_string()),
                SystemEventKind::PhaseChange,
                format!("{} created in backlog", task.id()),
                None,
            )
            .await;
        self.core
            .broadcaster
            .broadcast("task:updated", serde_json::json!({ "taskId": task.id() }));
        self.core.request_kick();
        Ok(task)
    }

    pub async fn update_task(&self, task_id: &str, request: UpdateTaskRequest) -> Result<Task> {
        let task = self.core.store.get_task(task_id).await?;
        let updated = self.core.store.update_task(&task, request).await?;
        self.core
            .broadcaster
            .broadcast("task:updated", serde_json::json!({ "taskId": task_id }));
        self.core.request_kick();
        Ok(updated)
    }

    pub async fn move_task(
        &self,
        task_id: &str,
        target: Phase,
        actor: Actor,
        reason: Option<String>,
    ) -> Result<Task> {
        let task = self.core.store.get_task(task_id).await?;
        let from = task.phase();
        let moved = self
            .core
            .store
            .move_task_to_phase(&task, target, actor, reason, None)
            .await?;
        self.core
            .activity
            .append_system(
                Some(task_id.to_string()),
                SystemEventKind::PhaseChange,
                format!("{task_id} moved {from} -> {target}"),
                None,
            )
            .await;
        self.core.broadcaster.broadcast(
            "task:moved",
            serde_json::json!({
                "taskId": task_id,
                "from": from.as_str(),
                "to": target.as_str(),
            }),
        );
        self.core.request_kick();
        Ok(moved)
    }

    pub async fn reorder_tasks(&self, phase: Phase, ordered_ids: &[String]) -> Result<Vec<Task>> {
        let tasks = self.core.store.reorder_tasks(phase, ordered_ids).await?;
        self.core
            .broadcaster
            .broadcast("task:updated", serde_json::json!({ "phase": phase.as_str() }));
        self.core.request_kick();
        Ok(tasks)
    }

    /// Delete a task, stopping any live supervisor first.
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        self.supervisor.stop_task_execution(task_id).await;
        let task = self.core.store.get_task(task_id).await?;
        self.core.store.delete_task(&task).await?;
        self.core
            .broadcaster
            .broadcast("task:updated", serde_json::json!({ "taskId": task_id }));
        self.core.request_kick();
        Ok(())
    }

    pub async fn list_tasks(&self, scope: TaskScope) -> Result<Vec<Task>> {
        self.core.store.discover_tasks(scope).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.core.store.get_task(task_id).await
    }
}

type EngineFactory = Box<dyn Fn(&Workspace) -> Arc<dyn SessionStore> + Send + Sync>;

pub struct IntegrationHub {
    pub registry: Arc<WorkspaceRegistry>,
    pub settings: Settings,
    engine_factory: EngineFactory,
    services: RwLock<HashMap<String, Arc<WorkspaceServices>>>,
}

impl IntegrationHub {
    pub fn new(
        registry: Arc<WorkspaceRegistry>,
        settings: Settings,
        engine_factory: EngineFactory,
    ) -> Self {
        Self {
            registry,
            settings,
            engine_factory,
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Get (building lazily) the service bundle for a workspace.
    pub async fn services(&self, workspace_id: &str) -> Result<Arc<WorkspaceServices>> {
        if let Some(existing) = self.services.read().await.get(workspace_id) {
            return Ok(existing.clone());
        }

        let workspace = self.registry.get_workspace_by_id(workspace_id).await?;
        let config = self.registry.read_config(&workspace).await;
        let engine = (self.engine_factory)(&workspace);
        let (core, kick_rx) =
            WorkspaceCore::new(workspace, config, engine, self.settings.guardrails());

        let supervisor = ExecutionSupervisor::new(core.clone());
        let queue = QueueManager::start(core.clone(), supervisor.clone(), &self.settings, kick_rx);
        let planning = PlanningSession::new(core.clone(), &self.settings);

        let services = Arc::new(WorkspaceServices {
            core,
            supervisor,
            queue,
            planning,
        });

        let mut map = self.services.write().await;
        // A racing builder may have won; last write wins is fine here, both
        // point at the same on-disk state, but prefer the first.
        let entry = map
            .entry(workspace_id.to_string())
            .or_insert_with(|| services.clone());
        Ok(entry.clone())
    }

    pub async fn started_workspaces(&self) -> Vec<String> {
        self.services.read().await.keys().cloned().collect()
    }

    /// Drop a workspace's services (after deletion).
    pub async fn evict(&self, workspace_id: &str) {
        if let Some(services) = self.services.write().await.remove(workspace_id) {
            services.queue.shutdown();
            services.supervisor.drain().await;
            info!(workspace = workspace_id, "workspace services evicted");
        }
    }

    /// Daemon shutdown: stop queues, abort supervisors, flush logs.
    pub async fn shutdown(&self) {
        let all: Vec<Arc<WorkspaceServices>> =
            self.services.write().await.drain().map(|(_, s)| s).collect();
        for services in all {
            services.queue.shutdown();
            services.supervisor.drain().await;
            services.planning.flush().await;
            services.core.activity.flush().await;
        }
        info!("all workspace services shut down");
    }
}
