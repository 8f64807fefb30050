//! Global daemon settings.
//!
//! Priority (highest to lowest): CLI / env  >  TOML at
//! `<dataHome>/config.toml`  >  built-in defaults. Workspace-level config
//! (`factory.json`) overrides these per workspace; task fields override both.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

use crate::supervisor::guardrails::Guardrails;

const DEFAULT_AGENT_COMMAND: &str = "pi";
const DEFAULT_EXECUTING_LIMIT: usize = 1;
const DEFAULT_PLANNING_DEBOUNCE_MS: u64 = 500;

// ─── TOML config file ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
struct GuardrailsToml {
    /// Full planning run timeout in milliseconds (default: 1,800,000).
    planning_timeout_ms: Option<u64>,
    /// Full execution run timeout in milliseconds (default: 1,800,000).
    execution_timeout_ms: Option<u64>,
    /// Planning tool-call budget, `read` excluded (default: 40).
    max_tool_calls: Option<u32>,
    /// Seconds allowed before the first engine event (default: 20).
    no_first_event_secs: Option<u64>,
    /// Seconds of stream silence after message_start (default: 60).
    stream_silence_secs: Option<u64>,
    /// Seconds allowed after a tool result with no progress (default: 120).
    post_tool_stall_secs: Option<u64>,
    /// Wall-clock cap per turn in seconds (default: 600).
    max_turn_secs: Option<u64>,
}

/// `<dataHome>/config.toml` — all fields are optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Log level filter string, e.g. "debug", "info,factoryd=trace".
    log: Option<String>,
    /// Agent engine CLI command (default: "pi").
    agent_command: Option<String>,
    /// Default executing WIP limit for workspaces that set none (default: 1).
    default_executing_limit: Option<usize>,
    /// Default ready-lane cap for workspaces that set none (default: none).
    default_ready_limit: Option<usize>,
    /// Planning-message write debounce in milliseconds (default: 500).
    planning_debounce_ms: Option<u64>,
    guardrails: Option<GuardrailsToml>,
}

fn load_toml(data_home: &Path) -> Option<TomlConfig> {
    let path = data_home.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── Settings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_home: PathBuf,
    pub log: String,
    /// Agent engine CLI command.
    pub agent_command: String,
    pub default_executing_limit: usize,
    pub default_ready_limit: Option<usize>,
    pub planning_debounce_ms: u64,
    guardrails: Guardrails,
}

impl Settings {
    /// Build settings from CLI/env args plus the optional TOML file.
    pub fn new(data_home: Option<PathBuf>, log: Option<String>) -> Self {
        let data_home = data_home.unwrap_or_else(default_data_home);
        let toml = load_toml(&data_home).unwrap_or_default();

        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let agent_command = std::env::var("FACTORY_AGENT_COMMAND")
            .ok()
            .or(toml.agent_command)
            .unwrap_or_else(|| DEFAULT_AGENT_COMMAND.to_string());

        let g = toml.guardrails.unwrap_or_default();
        let defaults = Guardrails::default();
        let guardrails = Guardrails {
            planning_timeout: g
                .planning_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.planning_timeout),
            execution_timeout: g
                .execution_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.execution_timeout),
            max_tool_calls: g.max_tool_calls.unwrap_or(defaults.max_tool_calls),
            no_first_event: g
                .no_first_event_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.no_first_event),
            stream_silence: g
                .stream_silence_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.stream_silence),
            post_tool_stall: g
                .post_tool_stall_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.post_tool_stall),
            max_turn_duration: g
                .max_turn_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_turn_duration),
        };

        Self {
            data_home,
            log,
            agent_command,
            default_executing_limit: toml
                .default_executing_limit
                .unwrap_or(DEFAULT_EXECUTING_LIMIT),
            default_ready_limit: toml.default_ready_limit,
            planning_debounce_ms: toml
                .planning_debounce_ms
                .unwrap_or(DEFAULT_PLANNING_DEBOUNCE_MS),
            guardrails,
        }
    }

    /// Settings rooted at an explicit directory with all defaults; used by
    /// tests and tools.
    pub fn for_data_home(data_home: &Path) -> Self {
        Self::new(Some(data_home.to_path_buf()), None)
    }

    pub fn guardrails(&self) -> Guardrails {
        self.guardrails.clone()
    }

    pub fn with_guardrails(mut self, guardrails: Guardrails) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn planning_debounce(&self) -> Duration {
        Duration::from_millis(self.planning_debounce_ms)
    }
}

/// `~/.taskfactory`, or `./.taskfactory` when HOME is unset.
fn default_data_home() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".taskfactory");
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(profile) = std::env::var("USERPROFILE") {
            return PathBuf::from(profile).join(".taskfactory");
        }
    }
    PathBuf::from(".taskfactory")
}
