//! Per-workspace queue manager: a single-flight kick loop that promotes
//! tasks between phases and dispatches execution/planning supervisors under
//! WIP and precedence constraints.
//!
//! External kicks are the only way the state machine progresses; every task
//! mutation, activity insertion, or config change ends with a kick. Kicks
//! arriving while a pass runs coalesce into one rerun.

use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::activity::SystemEventKind;
use crate::config::Settings;
use crate::hub::WorkspaceCore;
use crate::supervisor::ExecutionSupervisor;
use crate::tasks::model::{Actor, Phase, PlanningStatus, Task};
use crate::tasks::TaskScope;

// ─── Status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub processing: bool,
    pub backlog: usize,
    pub ready: usize,
    pub executing: usize,
    pub complete: usize,
    pub parked: usize,
    pub executing_live: usize,
    pub planning_live: usize,
}

// ─── Manager ─────────────────────────────────────────────────────────────────

pub struct QueueManager {
    core: Arc<WorkspaceCore>,
    supervisor: Arc<ExecutionSupervisor>,
    default_executing_limit: usize,
    default_ready_limit: Option<usize>,
    /// Paused queues keep running the loop but skip promotion and dispatch.
    running: AtomicBool,
    shutdown: AtomicBool,
    last_status: Mutex<Option<QueueStatus>>,
}

impl QueueManager {
    /// Spawn the kick loop and return the manager handle.
    pub fn start(
        core: Arc<WorkspaceCore>,
        supervisor: Arc<ExecutionSupervisor>,
        settings: &Settings,
        kick_rx: mpsc::UnboundedReceiver<()>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            core,
            supervisor,
            default_executing_limit: settings.default_executing_limit,
            default_ready_limit: settings.default_ready_limit,
            running: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            last_status: Mutex::new(None),
        });
        let loop_handle = manager.clone();
        tokio::spawn(async move { loop_handle.kick_loop(kick_rx).await });
        manager
    }

    /// Resume processing and re-evaluate immediately.
    pub fn resume(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.core.request_kick();
    }

    /// Pause processing. The loop stays alive; passes become no-ops.
    pub fn pause(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop accepting kicks entirely. Used on daemon shutdown / eviction.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.core.request_kick();
    }

    pub async fn get_status(&self) -> QueueStatus {
        self.compute_status().await.unwrap_or_default()
    }

    // ─── Kick loop ───────────────────────────────────────────────────────────

    /// Single-flight: at most one pass runs at a time. Kicks that arrive
    /// mid-pass stay queued and collapse into one rerun at the top.
    async fn kick_loop(self: Arc<Self>, mut kick_rx: mpsc::UnboundedReceiver<()>) {
        info!(workspace = %self.core.workspace_id(), "queue loop started");
        while let Some(()) = kick_rx.recv().await {
            while kick_rx.try_recv().is_ok() {}
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.run_pass().await {
                // One failing pass (or task) never takes the loop down.
                warn!(workspace = %self.core.workspace_id(), err = %e, "queue pass failed");
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
        }
        info!(workspace = %self.core.workspace_id(), "queue loop stopped");
    }

    async fn run_pass(&self) -> anyhow::Result<()> {
        let config = self.core.config().await;
        let processing = self.running.load(Ordering::SeqCst) && config.queue_processing.enabled;

        // Snapshot at the start of the pass; intra-pass changes are observed
        // on the next kick.
        let mut tasks = self.core.store.discover_tasks(TaskScope::Active).await?;

        if processing {
            let executing_limit = config.executing_limit(self.default_executing_limit);
            let ready_limit = config.ready_limit(self.default_ready_limit);

            // Promotions: backlog -> ready for planned tasks.
            if config.workflow_automation.backlog_to_ready {
                let mut ready_count = count_phase(&tasks, Phase::Ready);
                let candidates: Vec<Task> = tasks
                    .iter()
                    .filter(|t| {
                        t.phase() == Phase::Backlog
                            && t.frontmatter.planning_status == PlanningStatus::Completed
                            && !t.frontmatter.acceptance_criteria.is_empty()
                    })
                    .cloned()
                    .collect();
                for task in candidates {
                    if ready_limit.map(|cap| ready_count >= cap).unwrap_or(false) {
                        break;
                    }
                    if let Some(moved) = self.promote(&task, Phase::Ready, &tasks).await {
                        replace(&mut tasks, moved);
                        ready_count += 1;
                    }
                }
            }

            // Promotions: ready -> executing, in order, under the WIP cap.
            // Parked tasks occupy the phase but not a slot.
            if config.workflow_automation.ready_to_executing {
                let mut occupied = tasks
                    .iter()
                    .filter(|t| t.phase() == Phase::Executing && !t.frontmatter.awaiting_user_input)
                    .count();
                let ready: Vec<Task> = tasks
                    .iter()
                    .filter(|t| t.phase() == Phase::Ready)
                    .cloned()
                    .collect();
                for task in ready {
                    if occupied >= executing_limit {
                        break;
                    }
                    if let Some(moved) = self.promote(&task, Phase::Executing, &tasks).await {
                        replace(&mut tasks, moved);
                        occupied += 1;
                    }
                }
            }

            // Dispatch: executing tasks with no live supervisor start one,
            // unless parked.
            let live = self.supervisor.active_execution_count().await;
            let mut slots = executing_limit.saturating_sub(live);
            for task in tasks.iter().filter(|t| t.phase() == Phase::Executing) {
                if slots == 0 {
                    break;
                }
                if task.frontmatter.awaiting_user_input {
                    debug!(task = %task.id(), "skipping parked task");
                    continue;
                }
                if self.supervisor.has_active(task.id()).await {
                    continue;
                }
                slots -= 1;
                let supervisor = self.supervisor.clone();
                let task_id = task.id().to_string();
                tokio::spawn(async move {
                    if let Err(e) = supervisor.execute_task(&task_id, None).await {
                        warn!(task = %task_id, err = %e, "execution dispatch failed");
                    }
                });
            }

            // Planning dispatch: one planning run per workspace at a time.
            if self.supervisor.active_planning_count().await == 0 {
                let candidate = tasks.iter().find(|t| {
                    t.phase() == Phase::Backlog
                        && t.frontmatter.planning_status == PlanningStatus::None
                        && !t.description.trim().is_empty()
                        && t.frontmatter.planning_skipped != Some(true)
                });
                if let Some(task) = candidate {
                    if !self.supervisor.has_active(task.id()).await {
                        let supervisor = self.supervisor.clone();
                        let task_id = task.id().to_string();
                        tokio::spawn(async move {
                            if let Err(e) = supervisor.plan_task(&task_id).await {
                                warn!(task = %task_id, err = %e, "planning dispatch failed");
                            }
                        });
                    }
                }
            }
        }

        self.emit_status_if_changed().await;
        Ok(())
    }

    async fn promote(&self, task: &Task, target: Phase, peers: &[Task]) -> Option<Task> {
        match self
            .core
            .store
            .move_task_to_phase(task, target, Actor::System, None, Some(peers))
            .await
        {
            Ok(moved) => {
                self.core
                    .activity
                    .append_system(
                        Some(moved.id().to_string()),
                        SystemEventKind::PhaseChange,
                        format!("{} moved {} -> {}", moved.id(), task.phase(), target),
                        None,
                    )
                    .await;
                self.core.broadcaster.broadcast(
                    "task:moved",
                    json!({
                        "taskId": moved.id(),
                        "from": task.phase().as_str(),
                        "to": target.as_str(),
                    }),
                );
                Some(moved)
            }
            Err(e) => {
                // One ineligible task must not block the rest of the pass.
                debug!(task = %task.id(), err = %e, "promotion skipped");
                None
            }
        }
    }

    async fn compute_status(&self) -> anyhow::Result<QueueStatus> {
        let tasks = self.core.store.discover_tasks(TaskScope::Active).await?;
        let config = self.core.config().await;
        Ok(QueueStatus {
            processing: self.running.load(Ordering::SeqCst) && config.queue_processing.enabled,
            backlog: count_phase(&tasks, Phase::Backlog),
            ready: count_phase(&tasks, Phase::Ready),
            executing: count_phase(&tasks, Phase::Executing),
            complete: count_phase(&tasks, Phase::Complete),
            parked: tasks
                .iter()
                .filter(|t| t.phase() == Phase::Executing && t.frontmatter.awaiting_user_input)
                .count(),
            executing_live: self.supervisor.active_execution_count().await,
            planning_live: self.supervisor.active_planning_count().await,
        })
    }

    async fn emit_status_if_changed(&self) {
        let Ok(status) = self.compute_status().await else {
            return;
        };
        let mut last = self.last_status.lock().await;
        if last.as_ref() != Some(&status) {
            self.core.broadcaster.broadcast(
                "queue:status",
                serde_json::to_value(&status).unwrap_or_default(),
            );
            *last = Some(status);
        }
    }
}

fn count_phase(tasks: &[Task], phase: Phase) -> usize {
    tasks.iter().filter(|t| t.phase() == phase).count()
}

fn replace(tasks: &mut [Task], updated: Task) {
    if let Some(slot) = tasks.iter_mut().find(|t| t.id() == updated.id()) {
        *slot = updated;
    }
}
