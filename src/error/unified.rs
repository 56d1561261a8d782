//! Error classification and recovery.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Broad error category, surfaced on `error` chunks so subscribers can route on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    Provider,
    ToolExecution,
    Processor,
    Tripwire,
    Protocol,
    Configuration,
    Serialization,
    Timeout,
    Aborted,
    Unknown,
}

/// Suggested recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySuggestion {
    RetryWithBackoff,
    IncreaseTimeout,
    CheckConfiguration,
    CheckToolImplementation,
    CheckProcessorConfiguration,
    ReportBug,
    ContactSupport,
    None,
}
