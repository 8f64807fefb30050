//! Per-workspace configuration, stored as `<artifactRoot>/factory.json`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_task_locations() -> Vec<PathBuf> {
    vec![PathBuf::from("tasks")]
}

fn default_task_location() -> PathBuf {
    PathBuf::from("tasks")
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WipLimits {
    /// Cap on the `ready` lane. Absent = unbounded (global defaults may cap).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<usize>,
    /// Cap on concurrent `executing` slots. Absent = global default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executing: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueProcessing {
    /// When false the queue manager runs but never starts new executions.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for QueueProcessing {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowAutomation {
    #[serde(default)]
    pub backlog_to_ready: bool,
    #[serde(default)]
    pub ready_to_executing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    /// Directories holding tasks, relative to the artifact root unless
    /// absolute. Ordered; discovery walks them in sequence.
    #[serde(default = "default_task_locations")]
    pub task_locations: Vec<PathBuf>,
    #[serde(default = "default_task_location")]
    pub default_task_location: PathBuf,
    #[serde(default)]
    pub wip_limits: WipLimits,
    #[serde(default)]
    pub queue_processing: QueueProcessing,
    #[serde(default)]
    pub workflow_automation: WorkflowAutomation,
    /// Presentational only; round-tripped, never enforced here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_integration: Option<serde_json::Value>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            task_locations: default_task_locations(),
            default_task_location: default_task_location(),
            wip_limits: WipLimits::default(),
            queue_processing: QueueProcessing::default(),
            workflow_automation: WorkflowAutomation::default(),
            git_integration: None,
        }
    }
}

impl WorkspaceConfig {
    /// Executing-slot cap: workspace setting, else the global default.
    pub fn executing_limit(&self, global_default: usize) -> usize {
        self.wip_limits.executing.unwrap_or(global_default).max(1)
    }

    /// Ready-lane cap: workspace setting, else the global default (which may
    /// itself be unbounded).
    pub fn ready_limit(&self, global_default: Option<usize>) -> Option<usize> {
        self.wip_limits.ready.or(global_default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = WorkspaceConfig::default();
        assert!(cfg.queue_processing.enabled);
        assert!(!cfg.workflow_automation.backlog_to_ready);
        assert_eq!(cfg.executing_limit(1), 1);
        assert_eq!(cfg.ready_limit(None), None);
    }

    #[test]
    fn parses_sparse_json() {
        let cfg: WorkspaceConfig =
            serde_json::from_str(r#"{"wipLimits":{"executing":3}}"#).unwrap();
        assert_eq!(cfg.executing_limit(1), 3);
        assert_eq!(cfg.task_locations, vec![PathBuf::from("tasks")]);
        assert!(cfg.queue_processing.enabled);
    }

    #[test]
    fn workspace_limits_override_globals() {
        let cfg: WorkspaceConfig =
            serde_json::from_str(r#"{"wipLimits":{"ready":5}}"#).unwrap();
        assert_eq!(cfg.ready_limit(Some(10)), Some(5));
        assert_eq!(cfg.executing_limit(2), 2);
    }
}
