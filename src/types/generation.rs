//! Finish reasons.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Why a step or a run finished.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    /// The tool loop hit the configured step budget.
    MaxSteps,
    /// A processor halted the run on purpose.
    Tripwire,
    Aborted,
    Unknown,
}

impl FinishReason {
    /// Whether this reason means the model is waiting on tool results.
    pub fn wants_tools(self) -> bool {
        matches!(self, Self::ToolCalls)
    }

    /// Whether the run was cut short rather than concluding on its own.
    pub fn is_truncation(self) -> bool {
        matches!(self, Self::Length | Self::MaxSteps)
    }
}
