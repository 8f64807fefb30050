//! Task data model: phases, frontmatter, history, plans, usage metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

// ─── Phase ────────────────────────────────────────────────────────────────────

/// Lifecycle phase of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Backlog,
    Ready,
    Executing,
    Complete,
    Archived,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Backlog => "backlog",
            Phase::Ready => "ready",
            Phase::Executing => "executing",
            Phase::Complete => "complete",
            Phase::Archived => "archived",
        }
    }

    /// Parse a phase string, folding legacy values into the current set.
    /// `planning` (and any other unknown value) maps to `backlog`.
    pub fn parse_lenient(s: &str) -> Phase {
        match s.trim() {
            "backlog" => Phase::Backlog,
            "ready" => Phase::Ready,
            "executing" => Phase::Executing,
            "complete" => Phase::Complete,
            "archived" => Phase::Archived,
            other => {
                tracing::debug!(phase = other, "legacy phase value migrated to backlog");
                Phase::Backlog
            }
        }
    }

    pub fn all() -> [Phase; 5] {
        [
            Phase::Backlog,
            Phase::Ready,
            Phase::Executing,
            Phase::Complete,
            Phase::Archived,
        ]
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Backlog
    }
}

/// Valid phase transitions.
pub fn valid_transition(from: Phase, to: Phase) -> bool {
    use Phase::*;
    matches!(
        (from, to),
        (Backlog, Ready)
            | (Backlog, Executing)
            | (Backlog, Complete)
            | (Backlog, Archived)
            | (Ready, Backlog)
            | (Ready, Executing)
            | (Ready, Archived)
            | (Executing, Backlog)
            | (Executing, Ready)
            | (Executing, Complete)
            | (Executing, Archived)
            | (Complete, Ready)
            | (Complete, Executing)
            | (Complete, Archived)
            | (Archived, Backlog)
            | (Archived, Complete)
    )
}

// ─── Actors and history ──────────────────────────────────────────────────────

/// Who caused a phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    User,
    Agent,
    System,
}

/// One entry in a task's transition history. Appended on every successful
/// phase move; entries are immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ─── Plan and criteria ───────────────────────────────────────────────────────

/// Check state of a single acceptance criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckState {
    Pass,
    Fail,
    #[default]
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptanceCriterion {
    pub text: String,
    #[serde(default)]
    pub state: CheckState,
}

impl AcceptanceCriterion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            state: CheckState::Pending,
        }
    }
}

/// Plan produced by a planning run (via the `save_plan` tool).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub goal: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub validation: Vec<String>,
    #[serde(default)]
    pub cleanup: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_plan: Option<String>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanningStatus {
    #[default]
    None,
    Running,
    Completed,
    Error,
}

// ─── Blocked state ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BlockedState {
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

// ─── Model configuration ─────────────────────────────────────────────────────

/// Model selection for a planning or execution run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub provider: String,
    pub model_id: String,
}

// ─── Usage metrics ───────────────────────────────────────────────────────────

/// Normalised usage extracted from one assistant message.
/// `total_tokens` defaults to the sum of the four token fields when the
/// engine provides no explicit total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSample {
    pub provider: String,
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
}

impl UsageSample {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: impl Into<String>,
        model_id: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
        cache_read_tokens: u64,
        cache_write_tokens: u64,
        total_tokens: Option<u64>,
        cost: f64,
    ) -> Self {
        let sum = input_tokens + output_tokens + cache_read_tokens + cache_write_tokens;
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            input_tokens,
            output_tokens,
            cache_read_tokens,
            cache_write_tokens,
            total_tokens: total_tokens.unwrap_or(sum),
            cost,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub cost: f64,
}

/// Per-model usage row, keyed by `(provider, model_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub provider: String,
    pub model_id: String,
    #[serde(flatten)]
    pub totals: UsageTotals,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetrics {
    #[serde(default)]
    pub totals: UsageTotals,
    #[serde(default)]
    pub by_model: Vec<ModelUsage>,
}

impl UsageMetrics {
    /// Additively merge one sample into the totals and the matching
    /// `(provider, model_id)` row.
    pub fn record(&mut self, sample: &UsageSample) {
        let add = |t: &mut UsageTotals| {
            t.input += sample.input_tokens;
            t.output += sample.output_tokens;
            t.cache_read += sample.cache_read_tokens;
            t.cache_write += sample.cache_write_tokens;
            t.total += sample.total_tokens;
            t.cost += sample.cost;
        };
        add(&mut self.totals);
        match self
            .by_model
            .iter_mut()
            .find(|m| m.provider == sample.provider && m.model_id == sample.model_id)
        {
            Some(row) => add(&mut row.totals),
            None => {
                let mut totals = UsageTotals::default();
                add(&mut totals);
                self.by_model.push(ModelUsage {
                    provider: sample.provider.clone(),
                    model_id: sample.model_id.clone(),
                    totals,
                });
            }
        }
    }
}

// ─── Frontmatter ─────────────────────────────────────────────────────────────

/// Known frontmatter fields plus a sidecar of preserved unknown keys.
/// Unknown keys are round-tripped untouched and never read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFrontmatter {
    pub id: String,
    #[serde(default, deserialize_with = "phase_lenient")]
    pub phase: Phase,
    #[serde(default)]
    pub order: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    /// Seconds from `started` to `completed`; set on first entry to `complete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_time: Option<i64>,
    /// Seconds from `created` to `completed`; set on first entry to `complete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_time: Option<i64>,
    #[serde(default)]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_execution_skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_execution_skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_planning_skills: Vec<String>,
    /// Per-skill `{ key -> value }` overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_configs: Option<BTreeMap<String, BTreeMap<String, String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_model_config: Option<ModelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning_model_config: Option<ModelConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub execution_fallback_models: Vec<ModelConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub planning_fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub blocked: BlockedState,
    /// Times this task has been blocked; monotonic.
    #[serde(default)]
    pub blocked_count: u32,
    /// Total seconds spent blocked; monotonic.
    #[serde(default)]
    pub blocked_duration: i64,
    #[serde(default)]
    pub planning_status: PlanningStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning_skipped: Option<bool>,
    /// Parked: in `executing` with no live supervisor, waiting on the user.
    #[serde(default)]
    pub awaiting_user_input: bool,
    #[serde(default)]
    pub usage_metrics: UsageMetrics,
    /// Absolute path of the external agent-session record. The engine owns
    /// the bytes; the task holds only the reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_file: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

fn phase_lenient<'de, D>(de: D) -> std::result::Result<Phase, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    Ok(Phase::parse_lenient(&raw))
}

impl TaskFrontmatter {
    pub fn new(id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            phase: Phase::Backlog,
            order: 0,
            title: None,
            created: now,
            updated: now,
            started: None,
            completed: None,
            cycle_time: None,
            lead_time: None,
            acceptance_criteria: Vec::new(),
            plan: None,
            pre_execution_skills: Vec::new(),
            post_execution_skills: Vec::new(),
            pre_planning_skills: Vec::new(),
            skill_configs: None,
            execution_model_config: None,
            planning_model_config: None,
            execution_fallback_models: Vec::new(),
            planning_fallback_models: Vec::new(),
            blocked: BlockedState::default(),
            blocked_count: 0,
            blocked_duration: 0,
            planning_status: PlanningStatus::None,
            planning_skipped: None,
            awaiting_user_input: false,
            usage_metrics: UsageMetrics::default(),
            session_file: None,
            extra: BTreeMap::new(),
        }
    }
}

// ─── Task document ───────────────────────────────────────────────────────────

/// On-disk shape: one YAML mapping holding the frontmatter fields at the top
/// level plus `description` and `history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDocument {
    #[serde(flatten)]
    pub frontmatter: TaskFrontmatter,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub history: Vec<PhaseTransition>,
}

/// In-memory task: the parsed document plus its file path.
#[derive(Debug, Clone)]
pub struct Task {
    pub frontmatter: TaskFrontmatter,
    pub description: String,
    pub history: Vec<PhaseTransition>,
    pub file_path: PathBuf,
}

impl Task {
    pub fn id(&self) -> &str {
        &self.frontmatter.id
    }

    pub fn phase(&self) -> Phase {
        self.frontmatter.phase
    }

    /// Directory holding `task.yaml`, `attachments/`, and archive snapshots.
    pub fn dir(&self) -> &std::path::Path {
        self.file_path.parent().unwrap_or(std::path::Path::new("."))
    }

    pub fn into_document(self) -> TaskDocument {
        TaskDocument {
            frontmatter: self.frontmatter,
            description: self.description,
            history: self.history,
        }
    }

    pub fn from_document(doc: TaskDocument, file_path: PathBuf) -> Self {
        Self {
            frontmatter: doc.frontmatter,
            description: doc.description,
            history: doc.history,
            file_path,
        }
    }
}

// ─── Transition checks ───────────────────────────────────────────────────────

/// Outcome of `can_move_to_phase`: allowed, or denied with a reason the UI
/// can show directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl TransitionCheck {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Check whether `task` may move to `target`, applying the transition table
/// and the phase-specific guards.
pub fn can_move_to_phase(task: &Task, target: Phase) -> TransitionCheck {
    let from = task.frontmatter.phase;
    if from == target {
        return TransitionCheck::deny(format!("task is already in {target}"));
    }
    if !valid_transition(from, target) {
        return TransitionCheck::deny(format!("transition {from} -> {target} is not allowed"));
    }

    // Entering ready (or jumping straight from backlog to executing) requires
    // evidence of planning: at least one criterion, an explicit skip, or a
    // saved plan.
    let needs_criteria =
        target == Phase::Ready || (from == Phase::Backlog && target == Phase::Executing);
    if needs_criteria
        && task.frontmatter.acceptance_criteria.is_empty()
        && task.frontmatter.planning_skipped != Some(true)
        && task.frontmatter.plan.is_none()
    {
        return TransitionCheck::deny("at least one acceptance criterion is required");
    }

    if target == Phase::Executing
        && task.frontmatter.planning_status == PlanningStatus::Running
        && task.frontmatter.plan.is_none()
    {
        return TransitionCheck::deny("planning still running");
    }

    TransitionCheck::allow()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
