//! Error types for Outflow.

pub mod unified;

pub use unified::{ErrorCategory, RecoverySuggestion};

use thiserror::Error;

/// Primary error type for all Outflow operations.
#[derive(Error, Debug)]
pub enum OutflowError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Tool execution error ({tool_name}): {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Processor error ({processor}): {message}")]
    Processor { processor: String, message: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Run aborted")]
    Aborted,

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl OutflowError {
    /// Create a provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a processor error.
    pub fn processor(processor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Processor {
            processor: processor.into(),
            message: message.into(),
        }
    }

    /// Create a tool execution error.
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Provider { .. } | Self::Stream(_) => ErrorCategory::Provider,
            Self::ToolExecution { .. } | Self::ToolNotFound(_) => ErrorCategory::ToolExecution,
            Self::Processor { .. } => ErrorCategory::Processor,
            Self::ProtocolViolation(_) => ErrorCategory::Protocol,
            Self::Configuration(_) | Self::Toml(_) => ErrorCategory::Configuration,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Aborted => ErrorCategory::Aborted,
            Self::InvalidArgument(_) | Self::InvalidState(_) | Self::Io(_) => {
                ErrorCategory::Unknown
            }
        }
    }

    /// Whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Provider | ErrorCategory::Timeout
        )
    }

    /// Suggest recovery actions.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self.category() {
            ErrorCategory::Provider => RecoverySuggestion::RetryWithBackoff,
            ErrorCategory::Timeout => RecoverySuggestion::IncreaseTimeout,
            ErrorCategory::Configuration => RecoverySuggestion::CheckConfiguration,
            ErrorCategory::ToolExecution => RecoverySuggestion::CheckToolImplementation,
            ErrorCategory::Processor | ErrorCategory::Tripwire => {
                RecoverySuggestion::CheckProcessorConfiguration
            }
            ErrorCategory::Protocol => RecoverySuggestion::ReportBug,
            ErrorCategory::Aborted => RecoverySuggestion::None,
            _ => RecoverySuggestion::ContactSupport,
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, OutflowError>;
