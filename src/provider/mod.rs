//! Model provider seam.
//!
//! A provider turns one [`ProviderRequest`] into the raw chunk payloads of a
//! single step. The engine owns run and step identity: it stamps ids onto
//! every payload, emits the lifecycle chunks itself, and treats any lifecycle
//! payload other than `step-finish` or `error` coming from a provider as a
//! protocol violation.

pub mod replay;

pub use replay::ReplayProvider;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::OutflowError;
use crate::types::{ChunkPayload, ModelMessage, RunId, StepId};

/// Raw payload stream for one step.
pub type ProviderStream = BoxStream<'static, Result<ChunkPayload, OutflowError>>;

/// A request sent to a model provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub run_id: RunId,
    pub step_id: StepId,
    /// Zero-based step index within the run.
    pub step_number: usize,
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// Tool definition sent to the provider API.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Core trait implemented by model providers.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name, used in errors and logs.
    fn provider_name(&self) -> &str;

    /// Start streaming one step.
    async fn stream_step(&self, request: &ProviderRequest) -> Result<ProviderStream, OutflowError>;
}
