//! Run-level status and result types.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::step::StepResult;
use crate::types::{
    AgentToolCall, AgentToolResult, FinishReason, ModelMessage, RunId, Usage,
};

/// Run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Everything a finished run resolves to.
///
/// Built once at terminal status from the processed chunk accumulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub finish_reason: FinishReason,
    /// Processed text of every step, concatenated.
    pub text: String,
    pub reasoning_text: String,
    /// Usage summed over all steps.
    pub usage: Usage,
    pub steps: Vec<StepResult>,
    /// Persisted transcript: processed steps with result processors applied.
    pub messages: Vec<ModelMessage>,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tripwire_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn tool_calls(&self) -> Vec<AgentToolCall> {
        self.steps
            .iter()
            .flat_map(|s| s.tool_calls.iter().cloned())
            .collect()
    }

    pub fn tool_results(&self) -> Vec<AgentToolResult> {
        self.steps
            .iter()
            .flat_map(|s| s.tool_results.iter().cloned())
            .collect()
    }

    /// Outcome for a run whose producer went away without finishing.
    pub(crate) fn lost(run_id: RunId) -> Self {
        Self {
            run_id,
            status: RunStatus::Error,
            finish_reason: FinishReason::Error,
            text: String::new(),
            reasoning_text: String::new(),
            usage: Usage::default(),
            steps: Vec::new(),
            messages: Vec::new(),
            warnings: Vec::new(),
            object: None,
            tripwire_reason: None,
            error: Some("run ended without a terminal outcome".to_string()),
        }
    }
}

/// Buffer diagnostics for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionStats {
    /// Chunks currently held by the broadcaster.
    pub buffered_chunks: usize,
    /// Step results currently held by the run accumulator.
    pub retained_steps: usize,
    /// Attached subscribers.
    pub subscribers: usize,
    /// Chunks evicted by the safety ceiling.
    pub evicted_chunks: u64,
    /// Whether the run's buffers have been released.
    pub released: bool,
}
