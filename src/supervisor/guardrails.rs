//! Guardrail configuration and the per-turn stall watchdog.
//!
//! Stall detection, tool-call budget, and the run timeout are independent;
//! each is modelled as a deadline folded into one combinator so the first
//! trip wins and the cause is recorded.

use std::time::Duration;
use tokio::time::Instant;

use crate::agent::events::{AssistantDelta, EngineEvent};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Guardrails {
    /// Full planning run timeout.
    pub planning_timeout: Duration,
    /// Full execution run timeout.
    pub execution_timeout: Duration,
    /// Planning tool-call budget (`tool_execution_end` count, `read` excluded).
    pub max_tool_calls: u32,
    /// No engine event after `prompt`.
    pub no_first_event: Duration,
    /// No assistant text after `message_start`.
    pub stream_silence: Duration,
    /// No assistant delta or tool start after a `tool_execution_end`.
    pub post_tool_stall: Duration,
    /// Wall-clock cap per turn regardless of heartbeats.
    pub max_turn_duration: Duration,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            planning_timeout: Duration::from_millis(1_800_000),
            execution_timeout: Duration::from_millis(1_800_000),
            max_tool_calls: 40,
            no_first_event: Duration::from_secs(20),
            stream_silence: Duration::from_secs(60),
            post_tool_stall: Duration::from_secs(120),
            max_turn_duration: Duration::from_secs(600),
        }
    }
}

// ─── Stall phases ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallPhase {
    NoFirstEvent,
    StreamSilence,
    PostTool,
    MaxTurnDuration,
}

impl StallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StallPhase::NoFirstEvent => "no-first-event",
            StallPhase::StreamSilence => "stream-silence",
            StallPhase::PostTool => "post-tool",
            StallPhase::MaxTurnDuration => "max-turn-duration",
        }
    }
}

// ─── Watchdog ────────────────────────────────────────────────────────────────

/// Tracks the live deadlines for one turn. Feed every engine event through
/// `observe`; poll `next_deadline` to know when (and why) to trip.
pub struct TurnWatchdog {
    config: Guardrails,
    max_turn_deadline: Instant,
    no_first_event_deadline: Option<Instant>,
    stream_silence_deadline: Option<Instant>,
    post_tool_deadline: Option<Instant>,
}

impl TurnWatchdog {
    /// Arm for a turn that just prompted.
    pub fn armed(config: &Guardrails) -> Self {
        let now = Instant::now();
        Self {
            max_turn_deadline: now + config.max_turn_duration,
            no_first_event_deadline: Some(now + config.no_first_event),
            stream_silence_deadline: None,
            post_tool_deadline: None,
            config: config.clone(),
        }
    }

    /// Update deadlines from one observed event.
    pub fn observe(&mut self, event: &EngineEvent) {
        let now = Instant::now();
        // Any event satisfies the no-first-event watchdog.
        self.no_first_event_deadline = None;

        match event {
            EngineEvent::MessageStart => {
                self.stream_silence_deadline = Some(now + self.config.stream_silence);
            }
            EngineEvent::MessageUpdate { delta } => {
                if matches!(delta, AssistantDelta::TextDelta { .. }) {
                    self.stream_silence_deadline = None;
                }
                self.post_tool_deadline = None;
            }
            EngineEvent::ToolExecutionStart { .. } => {
                self.post_tool_deadline = None;
                self.stream_silence_deadline = None;
            }
            EngineEvent::ToolExecutionEnd { .. } => {
                self.post_tool_deadline = Some(now + self.config.post_tool_stall);
            }
            EngineEvent::MessageEnd { .. } | EngineEvent::TurnEnd { .. } => {
                self.stream_silence_deadline = None;
                self.post_tool_deadline = None;
            }
            _ => {}
        }
    }

    /// Earliest pending deadline and the stall phase it would report.
    pub fn next_deadline(&self) -> (Instant, StallPhase) {
        let mut best = (self.max_turn_deadline, StallPhase::MaxTurnDuration);
        if let Some(d) = self.no_first_event_deadline {
            if d < best.0 {
                best = (d, StallPhase::NoFirstEvent);
            }
        }
        if let Some(d) = self.stream_silence_deadline {
            if d < best.0 {
                best = (d, StallPhase::StreamSilence);
            }
        }
        if let Some(d) = self.post_tool_deadline {
            if d < best.0 {
                best = (d, StallPhase::PostTool);
            }
        }
        best
    }
}

// ─── Tool budget ─────────────────────────────────────────────────────────────

/// Counts completed tool calls against the planning budget. `read` calls are
/// free.
#[derive(Debug)]
pub struct ToolBudget {
    max: u32,
    used: u32,
}

impl ToolBudget {
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// Record a completed tool call; returns true once the budget is blown.
    pub fn charge(&mut self, tool_name: &str) -> bool {
        if tool_name == "read" {
            return false;
        }
        self.used += 1;
        self.used > self.max
    }

    pub fn used(&self) -> u32 {
        self.used
    }
}
