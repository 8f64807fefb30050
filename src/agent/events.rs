//! Engine event surface consumed from the external coding-agent engine.
//!
//! Events arrive as a tagged stream; the wire shape is line-delimited JSON
//! with a `type` discriminator (`agent_start`, `message_update`, …).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tasks::model::UsageSample;

// ─── Messages ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    Length,
    Error,
    Aborted,
    #[serde(other)]
    Unknown,
}

/// Raw usage payload as reported by the engine; any field may be absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsagePayload {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub cache_read_tokens: Option<u64>,
    #[serde(default)]
    pub cache_write_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub usage: Option<UsagePayload>,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AssistantMessage {
    /// Normalise the usage payload into a sample keyed by
    /// `(provider, model)`. Absent token fields count as zero; an absent
    /// total defaults to the sum of the four token fields.
    pub fn usage_sample(&self) -> Option<UsageSample> {
        let usage = self.usage.as_ref()?;
        Some(UsageSample::new(
            self.provider.clone(),
            self.model.clone(),
            usage.input_tokens.unwrap_or(0),
            usage.output_tokens.unwrap_or(0),
            usage.cache_read_tokens.unwrap_or(0),
            usage.cache_write_tokens.unwrap_or(0),
            usage.total_tokens,
            usage.cost.unwrap_or(0.0),
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistantDelta {
    TextDelta { text: String },
    ThinkingDelta { text: String },
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    AgentStart,
    MessageStart,
    MessageUpdate {
        #[serde(rename = "assistantMessageEvent")]
        delta: AssistantDelta,
    },
    MessageEnd {
        message: AssistantMessage,
    },
    TurnEnd {
        message: AssistantMessage,
        #[serde(default)]
        tool_results: Vec<Value>,
    },
    ToolExecutionStart {
        tool_name: String,
        tool_call_id: String,
        #[serde(default)]
        args: Value,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        #[serde(default)]
        data: Value,
    },
    ToolExecutionEnd {
        tool_name: String,
        tool_call_id: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Value,
    },
    AutoCompactionStart {
        #[serde(default)]
        reason: String,
    },
    AutoCompactionEnd {
        #[serde(default)]
        aborted: bool,
        #[serde(default)]
        will_retry: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    AutoRetryStart {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        #[serde(default)]
        error_message: String,
    },
    AutoRetryEnd {
        success: bool,
        attempt: u32,
    },
}

/// Context-window usage reported by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsage {
    #[serde(default)]
    pub tokens: Option<u64>,
    pub context_window: u64,
    #[serde(default)]
    pub percent: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_roundtrip() {
        let line = r#"{"type":"tool_execution_end","tool_name":"bash","tool_call_id":"t1","is_error":false,"result":{"output":"ok"}}"#;
        let event: EngineEvent = serde_json::from_str(line).unwrap();
        match &event {
            EngineEvent::ToolExecutionEnd { tool_name, .. } => assert_eq!(tool_name, "bash"),
            other => panic!("unexpected event: {other:?}"),
        }
        let out = serde_json::to_string(&event).unwrap();
        assert!(out.contains("\"type\":\"tool_execution_end\""));
    }

    #[test]
    fn message_end_usage_normalises() {
        let line = r#"{"type":"message_end","message":{"role":"assistant","content":"done","provider":"acme","model":"m1","stopReason":"end_turn","usage":{"inputTokens":7,"outputTokens":3}}}"#;
        let event: EngineEvent = serde_json::from_str(line).unwrap();
        let EngineEvent::MessageEnd { message } = event else {
            panic!("wrong variant");
        };
        let sample = message.usage_sample().unwrap();
        assert_eq!(sample.total_tokens, 10);
        assert_eq!(sample.provider, "acme");
    }

    #[test]
    fn unknown_stop_reason_is_tolerated() {
        let msg: AssistantMessage = serde_json::from_str(
            r#"{"role":"assistant","content":"","provider":"p","model":"m","stopReason":"new_fangled"}"#,
        )
        .unwrap();
        assert_eq!(msg.stop_reason, StopReason::Unknown);
    }
}
