//! The chunk vocabulary shared by every stage of a run.
//!
//! A [`Chunk`] is one tagged event in the generation stream. On the wire it
//! has the shape `{ "type": ..., "runId": ..., "stepId": ..., "payload": ... }`.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::generation::FinishReason;
use super::usage::Usage;
use crate::error::{ErrorCategory, OutflowError};

/// Unique run identifier.
pub type RunId = Uuid;

/// Unique step identifier, scoped to one request/response cycle of a run.
pub type StepId = Uuid;

/// One event in a run's chunk stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    #[serde(flatten)]
    pub payload: ChunkPayload,
}

impl Chunk {
    pub fn new(run_id: RunId, step_id: Option<StepId>, payload: ChunkPayload) -> Self {
        Self {
            run_id,
            step_id,
            payload,
        }
    }

    /// Wire `type` tag of this chunk.
    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }

    /// Whether this chunk closes the run's stream.
    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }

    /// Decode the bytes of a `file` chunk.
    pub fn file_bytes(&self) -> Result<Vec<u8>, OutflowError> {
        match &self.payload {
            ChunkPayload::File { data, .. } => STANDARD
                .decode(data)
                .map_err(|e| OutflowError::InvalidArgument(format!("invalid file data: {e}"))),
            other => Err(OutflowError::InvalidArgument(format!(
                "expected a file chunk, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Request-side metadata recorded when a step starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    pub step_number: usize,
    pub message_count: usize,
    #[serde(default)]
    pub tools: Vec<String>,
}

/// Response-side metadata reported by the provider when a step finishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// Variant-specific chunk payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ChunkPayload {
    // -- Lifecycle --
    Start {
        #[serde(default)]
        metadata: HashMap<String, String>,
    },
    StepStart {
        request: RequestMetadata,
    },
    StepFinish {
        finish_reason: FinishReason,
        #[serde(default)]
        usage: Usage,
        #[serde(default)]
        response: ResponseMetadata,
        #[serde(default)]
        warnings: Vec<String>,
    },
    Finish {
        finish_reason: FinishReason,
        #[serde(default)]
        usage: Usage,
    },
    Abort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error {
        message: String,
        category: ErrorCategory,
    },
    Tripwire {
        processor: String,
        reason: String,
    },

    // -- Text --
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        text: String,
    },
    TextEnd {
        id: String,
    },

    // -- Reasoning --
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        text: String,
    },
    ReasoningEnd {
        id: String,
    },

    // -- Tools --
    ToolCallInputStart {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        dynamic: bool,
    },
    ToolCallInputDelta {
        tool_call_id: String,
        delta: String,
    },
    ToolCallInputEnd {
        tool_call_id: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
        #[serde(default)]
        dynamic: bool,
    },
    ToolCallApproval {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ToolCallSuspended {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: serde_json::Value,
        #[serde(default)]
        dynamic: bool,
    },
    ToolError {
        tool_call_id: String,
        tool_name: String,
        error: String,
    },

    // -- Auxiliary --
    Source {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    File {
        media_type: String,
        /// Base64-encoded contents.
        data: String,
    },
    Object {
        value: serde_json::Value,
    },
    Raw {
        value: serde_json::Value,
    },
}

impl ChunkPayload {
    /// Build a `file` payload from raw bytes.
    pub fn file_from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self::File {
            media_type: media_type.into(),
            data: STANDARD.encode(bytes),
        }
    }

    /// Build an `error` payload from an error value.
    pub fn error(err: &OutflowError) -> Self {
        Self::Error {
            message: err.to_string(),
            category: err.category(),
        }
    }

    /// Wire `type` tag of this payload.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::StepStart { .. } => "step-start",
            Self::StepFinish { .. } => "step-finish",
            Self::Finish { .. } => "finish",
            Self::Abort { .. } => "abort",
            Self::Error { .. } => "error",
            Self::Tripwire { .. } => "tripwire",
            Self::TextStart { .. } => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd { .. } => "text-end",
            Self::ReasoningStart { .. } => "reasoning-start",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ReasoningEnd { .. } => "reasoning-end",
            Self::ToolCallInputStart { .. } => "tool-call-input-start",
            Self::ToolCallInputDelta { .. } => "tool-call-input-delta",
            Self::ToolCallInputEnd { .. } => "tool-call-input-end",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolCallApproval { .. } => "tool-call-approval",
            Self::ToolCallSuspended { .. } => "tool-call-suspended",
            Self::ToolResult { .. } => "tool-result",
            Self::ToolError { .. } => "tool-error",
            Self::Source { .. } => "source",
            Self::File { .. } => "file",
            Self::Object { .. } => "object",
            Self::Raw { .. } => "raw",
        }
    }

    /// Lifecycle chunks are owned by the engine and bypass stream processors.
    pub fn is_lifecycle(&self) -> bool {
        match self {
            Self::Start { .. }
            | Self::StepStart { .. }
            | Self::StepFinish { .. }
            | Self::Finish { .. }
            | Self::Abort { .. }
            | Self::Error { .. }
            | Self::Tripwire { .. } => true,
            Self::TextStart { .. }
            | Self::TextDelta { .. }
            | Self::TextEnd { .. }
            | Self::ReasoningStart { .. }
            | Self::ReasoningDelta { .. }
            | Self::ReasoningEnd { .. }
            | Self::ToolCallInputStart { .. }
            | Self::ToolCallInputDelta { .. }
            | Self::ToolCallInputEnd { .. }
            | Self::ToolCall { .. }
            | Self::ToolCallApproval { .. }
            | Self::ToolCallSuspended { .. }
            | Self::ToolResult { .. }
            | Self::ToolError { .. }
            | Self::Source { .. }
            | Self::File { .. }
            | Self::Object { .. }
            | Self::Raw { .. } => false,
        }
    }

    /// Exactly one of these ends every run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finish { .. } | Self::Error { .. } | Self::Abort { .. }
        )
    }

    /// Text carried by a text or reasoning delta.
    pub fn delta_text(&self) -> Option<&str> {
        match self {
            Self::TextDelta { text, .. } | Self::ReasoningDelta { text, .. } => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_uses_type_run_id_and_payload() {
        let run_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();
        let chunk = Chunk::new(
            run_id,
            Some(step_id),
            ChunkPayload::TextDelta {
                id: "t1".into(),
                text: "Hello".into(),
            },
        );
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["type"], "text-delta");
        assert_eq!(value["runId"], run_id.to_string());
        assert_eq!(value["stepId"], step_id.to_string());
        assert_eq!(value["payload"]["text"], "Hello");
        assert_eq!(chunk.type_name(), "text-delta");
    }

    #[test]
    fn tool_payload_fields_are_camel_case() {
        let chunk = Chunk::new(
            Uuid::new_v4(),
            None,
            ChunkPayload::ToolCall {
                tool_call_id: "call-1".into(),
                tool_name: "getWeather".into(),
                args: serde_json::json!({"city": "Oslo"}),
                dynamic: false,
            },
        );
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["type"], "tool-call");
        assert_eq!(value["payload"]["toolCallId"], "call-1");
        assert!(value.get("stepId").is_none());

        let parsed: Chunk = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, chunk);
    }

    #[test]
    fn terminal_and_lifecycle_classification() {
        let finish = ChunkPayload::Finish {
            finish_reason: FinishReason::Stop,
            usage: Usage::default(),
        };
        assert!(finish.is_terminal());
        assert!(finish.is_lifecycle());
        let tripwire = ChunkPayload::Tripwire {
            processor: "limiter".into(),
            reason: "budget".into(),
        };
        assert!(!tripwire.is_terminal());
        assert!(tripwire.is_lifecycle());
        assert!(!ChunkPayload::Raw {
            value: serde_json::Value::Null
        }
        .is_lifecycle());
    }

    #[test]
    fn file_payload_round_trips_bytes() {
        let chunk = Chunk::new(
            Uuid::new_v4(),
            None,
            ChunkPayload::file_from_bytes("image/png", &[0x89, 0x50, 0x4e, 0x47]),
        );
        assert_eq!(chunk.file_bytes().unwrap(), vec![0x89, 0x50, 0x4e, 0x47]);
    }
}
