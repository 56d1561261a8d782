//! Tool execution and the continue-or-finish decision.
//!
//! The run loop is a small state machine:
//!
//! ```text
//! StepOpen --step sealed, wants tools--> AwaitingTool --all resolved--> Continuing --> StepOpen
//!     \                                        \
//!      `--step sealed, done--> Finalizing       `--budget spent / unresolved--> Finalizing
//! ```
//!
//! [`decide_after_step`] is the single place the step budget is checked.

use std::time::Duration;

use tracing::{debug, info};

use super::approvals::{ApprovalPolicy, PendingToolCall, ResumeDecision, WaitKind};
use crate::error::OutflowError;
use crate::step::StepResult;
use crate::tools::{ToolArguments, ToolExecutionContext, ToolOutcome, ToolRegistry};
use crate::types::{AgentToolCall, ChunkPayload, FinishReason};
use crate::util::with_timeout;

/// Where the run loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// A provider step is streaming.
    StepOpen,
    /// The step's tool calls are executing or parked.
    AwaitingTool,
    /// Tool results are in; the next step is being prepared.
    Continuing,
    /// The run is producing its terminal chunk.
    Finalizing,
}

/// What to do once a step has sealed and its tools have run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    Continue,
    Finish(FinishReason),
}

/// Decide whether to start another step.
///
/// Continues only when the step asked for tools, every call it made has a
/// result or an error, and fewer than `max_steps` steps have run.
pub fn decide_after_step(step: &StepResult, steps_taken: usize, max_steps: usize) -> StepDecision {
    if !step.finish_reason.wants_tools() || step.tool_calls.is_empty() {
        return StepDecision::Finish(step.finish_reason);
    }
    let unresolved = step.unresolved_tool_calls();
    if !unresolved.is_empty() {
        debug!(
            step_id = %step.step_id,
            unresolved = unresolved.len(),
            "tool calls left unresolved, finishing run"
        );
        return StepDecision::Finish(FinishReason::ToolCalls);
    }
    if steps_taken >= max_steps {
        info!(step_id = %step.step_id, steps_taken, max_steps, "step budget exhausted");
        return StepDecision::Finish(FinishReason::MaxSteps);
    }
    StepDecision::Continue
}

/// Progress of one tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallProgress {
    /// Emit this `tool-result` or `tool-error`; the call is resolved.
    Done(ChunkPayload),
    /// Emit `chunk`, then park until a resume signal arrives.
    Waiting {
        chunk: ChunkPayload,
        pending: PendingToolCall,
    },
}

/// Runs tool calls against a registry under an approval policy.
#[derive(Debug, Clone)]
pub struct ToolCoordinator {
    registry: ToolRegistry,
    policy: ApprovalPolicy,
    timeout: Option<Duration>,
}

impl ToolCoordinator {
    pub fn new(registry: ToolRegistry, policy: ApprovalPolicy, timeout: Option<Duration>) -> Self {
        Self {
            registry,
            policy,
            timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// First attempt at a call.
    pub async fn invoke(
        &self,
        call: &AgentToolCall,
        ctx: &mut ToolExecutionContext,
    ) -> CallProgress {
        let Some(tool) = self.registry.lookup(&call.name) else {
            return tool_error(call, &OutflowError::ToolNotFound(call.name.clone()));
        };
        if tool.requires_approval() && !ctx.approved {
            match self.policy {
                ApprovalPolicy::Never => {
                    debug!(tool = %call.name, "approval declined by policy");
                    return tool_error_message(call, "approval declined by policy");
                }
                ApprovalPolicy::Always => ctx.approved = true,
                ApprovalPolicy::Ask => return wait_for_approval(call, None),
            }
        }
        self.execute(call, ctx).await
    }

    /// Continue a parked call with the caller's decision.
    pub async fn resume(
        &self,
        call: &AgentToolCall,
        pending: &PendingToolCall,
        decision: ResumeDecision,
        ctx: &mut ToolExecutionContext,
    ) -> CallProgress {
        match decision {
            ResumeDecision::Approve => {
                if pending.kind == WaitKind::Approval {
                    ctx.approved = true;
                }
                self.execute(call, ctx).await
            }
            ResumeDecision::Decline { reason } => {
                let what = match pending.kind {
                    WaitKind::Approval => "approval declined",
                    WaitKind::Suspended => "suspended call declined",
                };
                let message = match reason {
                    Some(reason) => format!("{what}: {reason}"),
                    None => what.to_string(),
                };
                tool_error_message(call, &message)
            }
            ResumeDecision::Result { value } => tool_result(call, value),
        }
    }

    async fn execute(&self, call: &AgentToolCall, ctx: &ToolExecutionContext) -> CallProgress {
        let Some(tool) = self.registry.lookup(&call.name) else {
            return tool_error(call, &OutflowError::ToolNotFound(call.name.clone()));
        };
        let args = ToolArguments::new(call.arguments.clone());
        if let Err(message) = tool.parameters().validate(args.raw()) {
            return tool_error_message(call, &format!("invalid arguments: {message}"));
        }

        debug!(tool = %call.name, tool_call_id = %call.id, approved = ctx.approved, "executing tool");
        let run = tool.execute(&args, ctx);
        let outcome = match self.timeout {
            Some(limit) => with_timeout(limit, run).await,
            None => run.await,
        };
        if matches!(outcome, Err(OutflowError::Timeout(_))) {
            ctx.cancel.cancel();
        }

        match outcome {
            Ok(ToolOutcome::Completed(value)) => tool_result(call, value),
            Ok(ToolOutcome::ApprovalRequired { reason }) => wait_for_approval(call, reason),
            Ok(ToolOutcome::Suspended { payload }) => CallProgress::Waiting {
                chunk: ChunkPayload::ToolCallSuspended {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    payload,
                },
                pending: pending(call, WaitKind::Suspended),
            },
            Err(err) => tool_error(call, &err),
        }
    }
}

fn pending(call: &AgentToolCall, kind: WaitKind) -> PendingToolCall {
    PendingToolCall {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        args: call.arguments.clone(),
        kind,
    }
}

fn wait_for_approval(call: &AgentToolCall, reason: Option<String>) -> CallProgress {
    CallProgress::Waiting {
        chunk: ChunkPayload::ToolCallApproval {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
            reason,
        },
        pending: pending(call, WaitKind::Approval),
    }
}

fn tool_result(call: &AgentToolCall, result: serde_json::Value) -> CallProgress {
    CallProgress::Done(ChunkPayload::ToolResult {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        result,
        dynamic: call.dynamic,
    })
}

fn tool_error(call: &AgentToolCall, err: &OutflowError) -> CallProgress {
    debug!(tool = %call.name, tool_call_id = %call.id, error = %err, "tool failed");
    let message = match err {
        OutflowError::ToolExecution { message, .. } => message.clone(),
        other => other.to_string(),
    };
    tool_error_message(call, &message)
}

fn tool_error_message(call: &AgentToolCall, message: &str) -> CallProgress {
    CallProgress::Done(ChunkPayload::ToolError {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        error: message.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{AgentTool, ToolParameters};
    use crate::types::{AgentToolResult, RequestMetadata, ResponseMetadata, Usage};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn call(name: &str, args: serde_json::Value) -> AgentToolCall {
        AgentToolCall {
            id: "call_1".into(),
            name: name.into(),
            arguments: args,
            dynamic: false,
        }
    }

    fn ctx() -> ToolExecutionContext {
        ToolExecutionContext {
            run_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            tool_call_id: "call_1".into(),
            tool_name: "weather".into(),
            approved: false,
            cancel: CancellationToken::new(),
        }
    }

    fn step(finish_reason: FinishReason, calls: usize, results: usize) -> StepResult {
        StepResult {
            step_id: Uuid::new_v4(),
            step_number: 0,
            text: String::new(),
            reasoning: String::new(),
            tool_calls: (0..calls)
                .map(|i| AgentToolCall {
                    id: format!("c{i}"),
                    name: "t".into(),
                    arguments: json!({}),
                    dynamic: false,
                })
                .collect(),
            tool_results: (0..results)
                .map(|i| AgentToolResult {
                    tool_call_id: format!("c{i}"),
                    tool_name: "t".into(),
                    result: json!(null),
                    is_error: false,
                    dynamic: false,
                })
                .collect(),
            files: vec![],
            sources: vec![],
            object: None,
            usage: Usage::default(),
            warnings: vec![],
            finish_reason,
            request: RequestMetadata::default(),
            response: ResponseMetadata::default(),
        }
    }

    fn weather_registry() -> ToolRegistry {
        ToolRegistry::new().with_tool(AgentTool::new(
            "weather",
            "Current weather",
            ToolParameters::object().string("city", "City", true).build(),
            |args, _ctx| async move { Ok(json!({"city": args.get_str("city")?, "temp": 21})) },
        ))
    }

    #[test]
    fn finishes_when_step_does_not_want_tools() {
        assert_eq!(
            decide_after_step(&step(FinishReason::Stop, 0, 0), 1, 5),
            StepDecision::Finish(FinishReason::Stop)
        );
    }

    #[test]
    fn continues_when_resolved_and_under_budget() {
        assert_eq!(
            decide_after_step(&step(FinishReason::ToolCalls, 2, 2), 1, 5),
            StepDecision::Continue
        );
    }

    #[test]
    fn finishes_with_max_steps_when_budget_spent() {
        assert_eq!(
            decide_after_step(&step(FinishReason::ToolCalls, 1, 1), 3, 3),
            StepDecision::Finish(FinishReason::MaxSteps)
        );
    }

    #[test]
    fn unresolved_calls_end_the_loop() {
        assert_eq!(
            decide_after_step(&step(FinishReason::ToolCalls, 2, 1), 1, 5),
            StepDecision::Finish(FinishReason::ToolCalls)
        );
    }

    #[tokio::test]
    async fn executes_known_tool() {
        let coordinator = ToolCoordinator::new(weather_registry(), ApprovalPolicy::Ask, None);
        let progress = coordinator
            .invoke(&call("weather", json!({"city": "Oslo"})), &mut ctx())
            .await;
        let CallProgress::Done(ChunkPayload::ToolResult { result, .. }) = progress else {
            panic!("expected tool result, got {progress:?}");
        };
        assert_eq!(result["city"], "Oslo");
    }

    #[tokio::test]
    async fn unknown_tool_and_bad_args_become_tool_errors() {
        let coordinator = ToolCoordinator::new(weather_registry(), ApprovalPolicy::Ask, None);
        let missing = coordinator.invoke(&call("nope", json!({})), &mut ctx()).await;
        assert!(matches!(
            missing,
            CallProgress::Done(ChunkPayload::ToolError { ref error, .. }) if error.contains("nope")
        ));
        let invalid = coordinator.invoke(&call("weather", json!({})), &mut ctx()).await;
        assert!(matches!(
            invalid,
            CallProgress::Done(ChunkPayload::ToolError { ref error, .. }) if error.contains("city")
        ));
    }

    fn gated_registry() -> ToolRegistry {
        ToolRegistry::new().with_tool(
            AgentTool::new("deploy", "Deploy", ToolParameters::empty(), |_args, ctx| async move {
                Ok(json!({"approved": ctx.approved}))
            })
            .needs_approval(),
        )
    }

    #[tokio::test]
    async fn approval_policy_applies_to_gated_tools() {
        let ask = ToolCoordinator::new(gated_registry(), ApprovalPolicy::Ask, None);
        let progress = ask.invoke(&call("deploy", json!({})), &mut ctx()).await;
        let CallProgress::Waiting { pending, chunk } = progress else {
            panic!("expected approval wait");
        };
        assert_eq!(pending.kind, WaitKind::Approval);
        assert_eq!(chunk.type_name(), "tool-call-approval");

        let never = ToolCoordinator::new(gated_registry(), ApprovalPolicy::Never, None);
        assert!(matches!(
            never.invoke(&call("deploy", json!({})), &mut ctx()).await,
            CallProgress::Done(ChunkPayload::ToolError { .. })
        ));

        let always = ToolCoordinator::new(gated_registry(), ApprovalPolicy::Always, None);
        assert_eq!(
            always.invoke(&call("deploy", json!({})), &mut ctx()).await,
            tool_result(&call("deploy", json!({})), json!({"approved": true}))
        );
    }

    #[tokio::test]
    async fn resume_decisions() {
        let coordinator = ToolCoordinator::new(gated_registry(), ApprovalPolicy::Ask, None);
        let c = call("deploy", json!({}));
        let parked = pending(&c, WaitKind::Approval);

        let approved = coordinator
            .resume(&c, &parked, ResumeDecision::Approve, &mut ctx())
            .await;
        assert_eq!(approved, tool_result(&c, json!({"approved": true})));

        let declined = coordinator
            .resume(
                &c,
                &parked,
                ResumeDecision::Decline {
                    reason: Some("not today".into()),
                },
                &mut ctx(),
            )
            .await;
        assert_eq!(
            declined,
            tool_error_message(&c, "approval declined: not today")
        );

        let supplied = coordinator
            .resume(
                &c,
                &parked,
                ResumeDecision::Result { value: json!(42) },
                &mut ctx(),
            )
            .await;
        assert_eq!(supplied, tool_result(&c, json!(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tools_time_out_and_are_cancelled() {
        let registry = ToolRegistry::new().with_tool(AgentTool::new(
            "slow",
            "Slow",
            ToolParameters::empty(),
            |_args, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(null))
            },
        ));
        let coordinator =
            ToolCoordinator::new(registry, ApprovalPolicy::Ask, Some(Duration::from_millis(50)));
        let mut context = ctx();
        let progress = coordinator.invoke(&call("slow", json!({})), &mut context).await;
        assert!(matches!(
            progress,
            CallProgress::Done(ChunkPayload::ToolError { ref error, .. }) if error.contains("50ms")
        ));
        assert!(context.cancel.is_cancelled());
    }
}
