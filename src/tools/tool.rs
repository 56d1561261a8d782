//! Tool trait and closure-based tool wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::arguments::ToolArguments;
use super::schema::ToolParameters;
use crate::error::OutflowError;
use crate::types::{RunId, StepId};

/// Context available during tool execution.
#[derive(Debug, Clone)]
pub struct ToolExecutionContext {
    pub run_id: RunId,
    pub step_id: StepId,
    pub tool_call_id: String,
    pub tool_name: String,
    /// Set when the call is re-executed after an approval.
    pub approved: bool,
    /// Cancelled when the run is aborted or the tool times out.
    pub cancel: CancellationToken,
}

/// What a tool handed back to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// The call finished with a result.
    Completed(serde_json::Value),
    /// The call may only proceed once someone approves it.
    ApprovalRequired { reason: Option<String> },
    /// The call waits for an externally supplied result.
    Suspended { payload: serde_json::Value },
}

impl From<serde_json::Value> for ToolOutcome {
    fn from(value: serde_json::Value) -> Self {
        Self::Completed(value)
    }
}

/// Core tool trait. Implement to create custom tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match what the model calls).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters(&self) -> &ToolParameters;

    /// Whether calls go through the engine's approval policy before executing.
    fn requires_approval(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolExecutionContext,
    ) -> Result<ToolOutcome, OutflowError>;
}

type ToolHandler = dyn Fn(
        ToolArguments,
        ToolExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutcome, OutflowError>> + Send>>
    + Send
    + Sync;

/// Closure-based tool for quick tool creation.
pub struct AgentTool {
    name: String,
    description: String,
    parameters: ToolParameters,
    requires_approval: bool,
    handler: Arc<ToolHandler>,
}

impl AgentTool {
    /// Create a tool from a closure returning a JSON result.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolParameters,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments, ToolExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, OutflowError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self::with_outcome(name, description, parameters, move |args, ctx| {
            let fut = handler(args, ctx);
            async move { fut.await.map(ToolOutcome::Completed) }
        })
    }

    /// Create a tool from a closure that may ask for approval or suspend.
    pub fn with_outcome<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolParameters,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments, ToolExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutcome, OutflowError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            requires_approval: false,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }

    /// Route every call through the approval policy.
    pub fn needs_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    fn requires_approval(&self) -> bool {
        self.requires_approval
    }

    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolExecutionContext,
    ) -> Result<ToolOutcome, OutflowError> {
        (self.handler)(args.clone(), ctx.clone()).await
    }
}

impl std::fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("requires_approval", &self.requires_approval)
            .finish()
    }
}
