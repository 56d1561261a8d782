//! Approval and resume types for tool calls that wait on the outside world.

use serde::{Deserialize, Serialize};

/// How calls to tools that require approval are handled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Decline without asking.
    Never,
    /// Emit `tool-call-approval` and wait for a resume signal.
    #[default]
    Ask,
    /// Approve without asking.
    Always,
}

/// Why a tool call is parked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    Approval,
    Suspended,
}

/// A tool call waiting for a [`ResumeSignal`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub kind: WaitKind,
}

/// What the caller decided for a parked tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum ResumeDecision {
    /// Run the tool (approval) or ask it again (suspension).
    Approve,
    /// Fail the call with a `tool-error`.
    Decline {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Use this value as the tool's result without running it.
    Result { value: serde_json::Value },
}

/// Resume input for a parked run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumeSignal {
    /// Target call; `None` matches whichever call is parked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(flatten)]
    pub decision: ResumeDecision,
}

impl ResumeSignal {
    pub fn approve(tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            decision: ResumeDecision::Approve,
        }
    }

    pub fn decline(tool_call_id: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            decision: ResumeDecision::Decline { reason },
        }
    }

    pub fn result(tool_call_id: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            decision: ResumeDecision::Result { value },
        }
    }

    /// Whether this signal is addressed to `tool_call_id`.
    pub fn targets(&self, tool_call_id: &str) -> bool {
        self.tool_call_id
            .as_deref()
            .map_or(true, |id| id == tool_call_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_wire_shape() {
        let signal = ResumeSignal::result("call_1", serde_json::json!({"ok": true}));
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "tool_call_id": "call_1",
                "decision": "result",
                "value": {"ok": true}
            })
        );
        let back: ResumeSignal = serde_json::from_value(json).unwrap();
        assert_eq!(back, signal);
    }

    #[test]
    fn untargeted_signal_matches_any_call() {
        let signal = ResumeSignal {
            tool_call_id: None,
            decision: ResumeDecision::Approve,
        };
        assert!(signal.targets("a"));
        assert!(!ResumeSignal::approve("a").targets("b"));
    }
}
