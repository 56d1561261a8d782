//! The run engine.
//!
//! [`Engine::start`] spawns one producer task per run. The producer waits
//! until the output is first observed, then loops: open a step, stream the
//! provider's payloads through the stream processors into the broadcaster
//! and the run accumulator, execute the step's tool calls, seal the step,
//! and decide whether another step follows. Exactly one terminal chunk
//! (`finish`, `error` or `abort`) ends every run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::accumulator::RunAccumulator;
use super::approvals::{PendingToolCall, ResumeDecision, ResumeSignal};
use super::broadcast::Broadcaster;
use super::coordinator::{decide_after_step, CallProgress, LoopState, StepDecision, ToolCoordinator};
use super::output::{ModelOutput, RunControl, StartGate};
use super::types::{RunOutcome, RunStatus};
use crate::config::EngineConfig;
use crate::error::OutflowError;
use crate::processor::{PipelineOutput, PipelineState, ProcessorPipeline};
use crate::provider::{ModelProvider, ProviderRequest, ProviderStream};
use crate::sink::{TranscriptRecord, TranscriptSink};
use crate::step::StepAccumulator;
use crate::tools::{Tool, ToolExecutionContext, ToolRegistry};
use crate::types::{
    Chunk, ChunkPayload, FinishReason, ModelMessage, RequestMetadata, ResponseMetadata, RunId,
    StepId, Usage,
};

type RunTable = Arc<Mutex<HashMap<RunId, RunControl>>>;

/// Input for one run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Conversation so far. Every step is sent these plus the run's own
    /// processed transcript.
    pub messages: Vec<ModelMessage>,
    /// Copied onto the run's `start` chunk.
    pub metadata: HashMap<String, String>,
    /// Fixed run id; generated when absent.
    pub run_id: Option<RunId>,
}

impl RunRequest {
    pub fn new(messages: Vec<ModelMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// Starts and controls runs against one provider.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use outflow::prelude::*;
///
/// # async fn example() -> std::result::Result<(), OutflowError> {
/// let provider = ReplayProvider::from_jsonl(
///     r#"{"type":"text-start","payload":{"id":"t"}}
/// {"type":"text-delta","payload":{"id":"t","text":"Hello"}}
/// {"type":"text-end","payload":{"id":"t"}}
/// {"type":"step-finish","payload":{"finishReason":"stop"}}"#,
/// )?;
/// let engine = Engine::new(Arc::new(provider));
/// let output = engine.start(RunRequest::new(vec![ModelMessage::user("hi")]))?;
/// println!("{}", output.text().await);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Engine {
    provider: Arc<dyn ModelProvider>,
    tools: ToolRegistry,
    pipeline: ProcessorPipeline,
    sink: Option<Arc<dyn TranscriptSink>>,
    config: EngineConfig,
    runs: RunTable,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("provider", &self.provider.provider_name())
            .field("tools", &self.tools)
            .field("pipeline", &self.pipeline)
            .field("sink", &self.sink.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl Engine {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            tools: ToolRegistry::new(),
            pipeline: ProcessorPipeline::new(),
            sink: None,
            config: EngineConfig::default(),
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools = self.tools.with_tool(tool);
        self
    }

    pub fn with_pipeline(mut self, pipeline: ProcessorPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn TranscriptSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a run. Nothing is requested from the provider until the
    /// returned output is first observed. Must be called within a Tokio
    /// runtime.
    pub fn start(&self, request: RunRequest) -> Result<ModelOutput, OutflowError> {
        self.config.validate()?;
        let run_id = request.run_id.unwrap_or_else(Uuid::new_v4);

        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        if runs.contains_key(&run_id) {
            return Err(OutflowError::InvalidArgument(format!(
                "run {run_id} is already active"
            )));
        }

        let broadcaster = Broadcaster::new(run_id, self.config.buffer);
        let accumulator = RunAccumulator::new(run_id, &self.config.buffer);
        let retained_steps = accumulator.retained_counter();
        let (resume_tx, resume_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let control = RunControl {
            run_id,
            cancel: CancellationToken::new(),
            gate: Arc::new(StartGate::default()),
            resume_tx,
            pending: Arc::new(Mutex::new(None)),
            broadcaster: broadcaster.clone(),
        };

        let producer = Producer {
            run_id,
            provider: Arc::clone(&self.provider),
            coordinator: ToolCoordinator::new(
                self.tools.clone(),
                self.config.approval_policy,
                self.config.tool_timeout_ms.map(Duration::from_millis),
            ),
            pipeline_state: self.pipeline.new_state(),
            pipeline: self.pipeline.clone(),
            sink: self.sink.clone(),
            config: self.config.clone(),
            messages: request.messages,
            metadata: request.metadata,
            accumulator,
            broadcaster: broadcaster.clone(),
            control: control.clone(),
            resume_rx,
            outcome_tx,
            state: LoopState::StepOpen,
            _guard: RunGuard {
                run_id,
                broadcaster: broadcaster.clone(),
                runs: Arc::clone(&self.runs),
            },
        };
        runs.insert(run_id, control.clone());
        drop(runs);

        debug!(%run_id, provider = self.provider.provider_name(), "run created");
        tokio::spawn(producer.run());
        Ok(ModelOutput::new(control, outcome_rx, retained_steps))
    }

    /// Abort an active run. Returns `false` for unknown or finished runs.
    pub fn abort(&self, run_id: RunId) -> bool {
        let control = self.control(run_id);
        control.is_some_and(|control| control.abort())
    }

    /// Resume a run parked on a tool call.
    pub fn resume(&self, run_id: RunId, signal: ResumeSignal) -> Result<(), OutflowError> {
        match self.control(run_id) {
            Some(control) => control.resume(signal),
            None => Err(OutflowError::InvalidArgument(format!(
                "run {run_id} is not active"
            ))),
        }
    }

    /// Tool call an active run is parked on, if any.
    pub fn pending_tool_call(&self, run_id: RunId) -> Option<PendingToolCall> {
        self.control(run_id).and_then(|control| control.pending())
    }

    /// Runs that have not yet ended.
    pub fn active_runs(&self) -> Vec<RunId> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    fn control(&self, run_id: RunId) -> Option<RunControl> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&run_id)
            .cloned()
    }
}

/// Closes the broadcaster and forgets the run however the producer exits.
struct RunGuard {
    run_id: RunId,
    broadcaster: Broadcaster,
    runs: RunTable,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.broadcaster.close();
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run_id);
    }
}

/// How the run loop ended.
#[derive(Debug)]
enum RunEnd {
    Tripwire { processor: String, reason: String },
    Failed(OutflowError),
    Aborted,
}

impl From<OutflowError> for RunEnd {
    fn from(err: OutflowError) -> Self {
        match err {
            OutflowError::Aborted => Self::Aborted,
            other => Self::Failed(other),
        }
    }
}

struct Producer {
    run_id: RunId,
    provider: Arc<dyn ModelProvider>,
    coordinator: ToolCoordinator,
    pipeline: ProcessorPipeline,
    pipeline_state: PipelineState,
    sink: Option<Arc<dyn TranscriptSink>>,
    config: EngineConfig,
    messages: Vec<ModelMessage>,
    metadata: HashMap<String, String>,
    accumulator: RunAccumulator,
    broadcaster: Broadcaster,
    control: RunControl,
    resume_rx: mpsc::UnboundedReceiver<ResumeSignal>,
    outcome_tx: watch::Sender<Option<Arc<RunOutcome>>>,
    state: LoopState,
    _guard: RunGuard,
}

impl Producer {
    async fn run(mut self) {
        tokio::select! {
            biased;
            _ = self.control.cancel.cancelled() => {}
            _ = self.control.gate.wait() => {}
        }
        let end = if self.control.cancel.is_cancelled() {
            Err(RunEnd::Aborted)
        } else {
            self.drive().await
        };
        self.finish(end).await;
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            debug!(run_id = %self.run_id, from = ?self.state, to = ?next, "run state");
            self.state = next;
        }
    }

    async fn drive(&mut self) -> Result<FinishReason, RunEnd> {
        info!(
            run_id = %self.run_id,
            provider = self.provider.provider_name(),
            max_steps = self.config.max_steps,
            "run started"
        );
        let start = ChunkPayload::Start {
            metadata: self.metadata.clone(),
        };
        self.emit(Chunk::new(self.run_id, None, start)).await?;

        loop {
            let step_number = self.accumulator.steps_taken();
            self.run_step(step_number).await?;
            self.transition(LoopState::Continuing);
            let Some(step) = self.accumulator.last_step() else {
                return Err(RunEnd::Failed(OutflowError::InvalidState(
                    "step ended without sealing".into(),
                )));
            };
            match decide_after_step(step, self.accumulator.steps_taken(), self.config.max_steps) {
                StepDecision::Continue => {}
                StepDecision::Finish(reason) => return Ok(reason),
            }
        }
    }

    async fn run_step(&mut self, step_number: usize) -> Result<(), RunEnd> {
        self.transition(LoopState::StepOpen);
        let step_id = Uuid::new_v4();
        self.accumulator.begin_step(step_id, step_number)?;
        // Validates the provider's raw payloads before any processor runs.
        let mut strict = StepAccumulator::strict(step_id, step_number);

        let mut messages = self.messages.clone();
        messages.extend_from_slice(self.accumulator.transcript());
        let tools = self.coordinator.registry().definitions();
        let request_meta = RequestMetadata {
            step_number,
            message_count: messages.len(),
            tools: tools.iter().map(|tool| tool.name.clone()).collect(),
        };
        self.emit_step(&mut strict, ChunkPayload::StepStart { request: request_meta })
            .await?;

        let request = ProviderRequest {
            run_id: self.run_id,
            step_id,
            step_number,
            messages,
            tools,
        };
        debug!(run_id = %self.run_id, %step_id, step_number, "requesting step");
        let mut stream = tokio::select! {
            biased;
            _ = self.control.cancel.cancelled() => return Err(RunEnd::Aborted),
            opened = self.open_stream(&request) => opened?,
        };

        let mut finish: Option<(FinishReason, ChunkPayload)> = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.control.cancel.cancelled() => return Err(RunEnd::Aborted),
                next = stream.next() => next,
            };
            let Some(item) = next else { break };
            let payload = item?;

            if finish.is_some() {
                return Err(self.violation(step_id, &payload, "after step-finish"));
            }
            if let ChunkPayload::StepFinish { finish_reason, .. } = &payload {
                let reason = *finish_reason;
                finish = Some((reason, payload));
                continue;
            }
            if let ChunkPayload::Error { message, .. } = &payload {
                return Err(RunEnd::Failed(OutflowError::provider(
                    self.provider.provider_name(),
                    message.clone(),
                )));
            }
            if payload.is_lifecycle()
                || matches!(
                    payload,
                    ChunkPayload::ToolCallApproval { .. } | ChunkPayload::ToolCallSuspended { .. }
                )
            {
                return Err(self.violation(step_id, &payload, "is owned by the engine"));
            }
            self.emit_step(&mut strict, payload).await?;
        }
        drop(stream);

        // Inputs the provider finished streaming but never confirmed.
        for call in strict.finished_tool_inputs() {
            let payload = ChunkPayload::ToolCall {
                tool_call_id: call.id,
                tool_name: call.name,
                args: call.arguments,
                dynamic: call.dynamic,
            };
            self.emit_step(&mut strict, payload).await?;
        }

        let (reason, finish) = match finish {
            Some(finish) => finish,
            None => {
                let reason = if strict.tool_calls().is_empty() {
                    FinishReason::Stop
                } else {
                    FinishReason::ToolCalls
                };
                warn!(run_id = %self.run_id, %step_id, %reason, "provider stream ended without step-finish");
                (reason, step_finish(reason, Usage::default()))
            }
        };

        if reason.wants_tools() {
            self.transition(LoopState::AwaitingTool);
            self.run_tools(step_id).await?;
        }
        self.emit_step(&mut strict, finish).await
    }

    async fn open_stream(&self, request: &ProviderRequest) -> Result<ProviderStream, OutflowError> {
        let provider = &self.provider;
        let stream = match &self.config.provider_retry {
            Some(policy) => policy.execute(|| provider.stream_step(request)).await?,
            None => provider.stream_step(request).await?,
        };
        Ok(self.with_idle_timeout(stream))
    }

    fn with_idle_timeout(&self, stream: ProviderStream) -> ProviderStream {
        let idle_ms = self.config.stream_idle_timeout_ms;
        if idle_ms == 0 {
            return stream;
        }
        tokio_stream::StreamExt::timeout(stream, Duration::from_millis(idle_ms))
            .map(move |item| item.unwrap_or(Err(OutflowError::Timeout(idle_ms))))
            .boxed()
    }

    fn violation(&self, step_id: StepId, payload: &ChunkPayload, what: &str) -> RunEnd {
        let message = format!(
            "provider {} sent {} {what}",
            self.provider.provider_name(),
            payload.type_name()
        );
        error!(run_id = %self.run_id, %step_id, %message, "protocol violation");
        RunEnd::Failed(OutflowError::ProtocolViolation(message))
    }

    /// Execute the open step's unresolved tool calls in order.
    async fn run_tools(&mut self, step_id: StepId) -> Result<(), RunEnd> {
        for call in self.accumulator.open_tool_calls() {
            let mut ctx = ToolExecutionContext {
                run_id: self.run_id,
                step_id,
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                approved: false,
                cancel: self.control.cancel.child_token(),
            };
            debug!(run_id = %self.run_id, tool = %call.name, tool_call_id = %call.id, "executing tool call");
            let mut progress = tokio::select! {
                biased;
                _ = self.control.cancel.cancelled() => return Err(RunEnd::Aborted),
                progress = self.coordinator.invoke(&call, &mut ctx) => progress,
            };
            loop {
                match progress {
                    CallProgress::Done(payload) => {
                        self.emit(Chunk::new(self.run_id, Some(step_id), payload))
                            .await?;
                        break;
                    }
                    CallProgress::Waiting { chunk, pending } => {
                        self.emit(Chunk::new(self.run_id, Some(step_id), chunk))
                            .await?;
                        let decision = self.wait_for_resume(&pending).await?;
                        progress = tokio::select! {
                            biased;
                            _ = self.control.cancel.cancelled() => return Err(RunEnd::Aborted),
                            progress = self.coordinator.resume(&call, &pending, decision, &mut ctx) => progress,
                        };
                    }
                }
            }
        }
        Ok(())
    }

    async fn wait_for_resume(&mut self, pending: &PendingToolCall) -> Result<ResumeDecision, RunEnd> {
        // Anything queued belongs to an earlier park.
        while self.resume_rx.try_recv().is_ok() {}
        self.control.set_pending(Some(pending.clone()));
        info!(
            run_id = %self.run_id,
            tool_call_id = %pending.tool_call_id,
            kind = ?pending.kind,
            "tool call waiting for resume"
        );
        let decision = loop {
            let signal = tokio::select! {
                biased;
                _ = self.control.cancel.cancelled() => break Err(RunEnd::Aborted),
                signal = self.resume_rx.recv() => signal,
            };
            match signal {
                Some(signal) if signal.targets(&pending.tool_call_id) => break Ok(signal.decision),
                Some(signal) => {
                    warn!(
                        run_id = %self.run_id,
                        target = ?signal.tool_call_id,
                        waiting = %pending.tool_call_id,
                        "ignoring resume signal for another call"
                    );
                }
                None => break Err(RunEnd::Aborted),
            }
        };
        self.control.set_pending(None);
        decision
    }

    /// Stamp a step payload, validate it against the raw step, and emit it.
    async fn emit_step(
        &mut self,
        strict: &mut StepAccumulator,
        payload: ChunkPayload,
    ) -> Result<(), RunEnd> {
        let chunk = Chunk::new(self.run_id, Some(strict.step_id()), payload);
        strict.apply(&chunk)?;
        self.emit(chunk).await
    }

    /// Push a chunk through the stream processors and publish what survives.
    async fn emit(&mut self, chunk: Chunk) -> Result<(), RunEnd> {
        if self.control.cancel.is_cancelled() {
            return Err(RunEnd::Aborted);
        }
        let output = self
            .pipeline
            .process_chunk(chunk, &mut self.pipeline_state)
            .await?;
        if self.control.cancel.is_cancelled() {
            return Err(RunEnd::Aborted);
        }
        match output {
            PipelineOutput::Emit(chunk) => Ok(self.publish(chunk)?),
            PipelineOutput::Dropped { .. } => Ok(()),
            PipelineOutput::Tripwire { processor, reason } => {
                Err(RunEnd::Tripwire { processor, reason })
            }
        }
    }

    /// Record and broadcast under one lock, so an accepted abort can never
    /// land between the two.
    fn publish(&mut self, chunk: Chunk) -> Result<(), OutflowError> {
        let accumulator = &mut self.accumulator;
        self.broadcaster
            .publish_with(chunk, |chunk| accumulator.apply(chunk).map(|_| ()))
    }

    async fn finish(mut self, end: Result<FinishReason, RunEnd>) {
        // An abort accepted before this point decides how the run ends.
        let end = if self.broadcaster.begin_finalize() {
            end
        } else {
            Err(RunEnd::Aborted)
        };
        self.transition(LoopState::Finalizing);
        let (status, reason, messages) = match end {
            Ok(reason) => self.finish_success(reason).await,
            Err(RunEnd::Tripwire { processor, reason }) => {
                match self.record_tripwire(processor, reason) {
                    Ok(()) => self.finish_success(FinishReason::Tripwire).await,
                    Err(err) => self.finish_failed(err).await,
                }
            }
            Err(RunEnd::Failed(err)) => self.finish_failed(err).await,
            Err(RunEnd::Aborted) => self.finish_aborted().await,
        };

        let Producer {
            run_id,
            accumulator,
            outcome_tx,
            ..
        } = self;
        let outcome = accumulator.into_outcome(status, reason, messages);
        info!(
            %run_id,
            %status,
            finish_reason = %reason,
            steps = outcome.steps.len(),
            total_tokens = outcome.usage.total_tokens,
            "run finished"
        );
        outcome_tx.send_replace(Some(Arc::new(outcome)));
    }

    fn record_tripwire(&mut self, processor: String, reason: String) -> Result<(), OutflowError> {
        warn!(run_id = %self.run_id, %processor, %reason, "tripwire raised");
        let step_id = self.accumulator.open_step_id();
        self.publish(Chunk::new(
            self.run_id,
            step_id,
            ChunkPayload::Tripwire { processor, reason },
        ))?;
        if let Some(step_id) = step_id {
            self.publish(Chunk::new(
                self.run_id,
                Some(step_id),
                step_finish(FinishReason::Tripwire, Usage::default()),
            ))?;
        }
        Ok(())
    }

    async fn finish_success(&mut self, reason: FinishReason) -> (RunStatus, FinishReason, Vec<ModelMessage>) {
        match self.result_messages(RunStatus::Success, reason).await {
            Ok(messages) => match self.persist(RunStatus::Success, reason, &messages).await {
                Ok(()) => {
                    let usage = self.accumulator.usage().clone();
                    self.terminal(ChunkPayload::Finish {
                        finish_reason: reason,
                        usage,
                    });
                    (RunStatus::Success, reason, messages)
                }
                Err(err) => self.finish_failed(err).await,
            },
            Err(err) => self.finish_failed(err).await,
        }
    }

    async fn finish_failed(&mut self, err: OutflowError) -> (RunStatus, FinishReason, Vec<ModelMessage>) {
        error!(
            run_id = %self.run_id,
            error = %err,
            category = %err.category(),
            "run failed"
        );
        self.accumulator.close_open_step(FinishReason::Error);
        self.terminal(ChunkPayload::error(&err));
        let messages = self
            .persist_best_effort(RunStatus::Error, FinishReason::Error)
            .await;
        (RunStatus::Error, FinishReason::Error, messages)
    }

    async fn finish_aborted(&mut self) -> (RunStatus, FinishReason, Vec<ModelMessage>) {
        info!(run_id = %self.run_id, "run aborted");
        self.accumulator.close_open_step(FinishReason::Aborted);
        self.terminal(ChunkPayload::Abort {
            reason: Some("aborted by caller".into()),
        });
        let messages = self
            .persist_best_effort(RunStatus::Aborted, FinishReason::Aborted)
            .await;
        (RunStatus::Aborted, FinishReason::Aborted, messages)
    }

    /// Publish the run's one terminal chunk.
    fn terminal(&mut self, payload: ChunkPayload) {
        let chunk = Chunk::new(self.run_id, None, payload);
        if let Err(err) = self.accumulator.apply(&chunk) {
            warn!(run_id = %self.run_id, error = %err, "terminal chunk not recorded");
        }
        if let Err(err) = self.broadcaster.publish(chunk) {
            warn!(run_id = %self.run_id, error = %err, "terminal chunk not published");
        }
    }

    async fn result_messages(
        &self,
        status: RunStatus,
        reason: FinishReason,
    ) -> Result<Vec<ModelMessage>, OutflowError> {
        let ctx = self.accumulator.result_context(status, reason);
        self.pipeline
            .process_result(self.accumulator.transcript().to_vec(), &ctx)
            .await
    }

    async fn persist(
        &self,
        status: RunStatus,
        reason: FinishReason,
        messages: &[ModelMessage],
    ) -> Result<(), OutflowError> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let record = TranscriptRecord {
            run_id: self.run_id,
            status,
            finish_reason: reason,
            usage: self.accumulator.usage().clone(),
            messages: messages.to_vec(),
            created_at: Utc::now(),
        };
        sink.persist(&record).await
    }

    async fn persist_best_effort(&self, status: RunStatus, reason: FinishReason) -> Vec<ModelMessage> {
        let messages = match self.result_messages(status, reason).await {
            Ok(messages) => messages,
            Err(err) => {
                // Unprocessed transcripts are never persisted.
                warn!(run_id = %self.run_id, error = %err, "result processing failed, skipping persistence");
                return self.accumulator.transcript().to_vec();
            }
        };
        if let Err(err) = self.persist(status, reason, &messages).await {
            warn!(run_id = %self.run_id, error = %err, "persisting transcript failed");
        }
        messages
    }
}

fn step_finish(finish_reason: FinishReason, usage: Usage) -> ChunkPayload {
    ChunkPayload::StepFinish {
        finish_reason,
        usage,
        response: ResponseMetadata::default(),
        warnings: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ReplayProvider;

    fn hello() -> Vec<ChunkPayload> {
        vec![
            ChunkPayload::TextStart { id: "t".into() },
            ChunkPayload::TextDelta {
                id: "t".into(),
                text: "hello".into(),
            },
            ChunkPayload::TextEnd { id: "t".into() },
            step_finish(FinishReason::Stop, Usage::new(2, 1)),
        ]
    }

    #[tokio::test]
    async fn production_waits_for_first_observation() {
        let provider = Arc::new(ReplayProvider::new(vec![hello()]));
        let engine = Engine::new(provider.clone());
        let output = engine
            .start(RunRequest::new(vec![ModelMessage::user("hi")]))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(provider.requests().is_empty());
        assert_eq!(output.current_status(), RunStatus::Running);

        assert_eq!(output.text().await, "hello");
        assert_eq!(provider.requests().len(), 1);
        assert_eq!(output.finish_reason().await, FinishReason::Stop);
    }

    #[tokio::test]
    async fn abort_before_start_emits_only_abort() {
        let provider = Arc::new(ReplayProvider::new(vec![hello()]));
        let engine = Engine::new(provider.clone());
        let output = engine.start(RunRequest::default()).unwrap();
        let stream = output.subscribe();

        assert!(engine.abort(output.run_id()));
        let chunks: Vec<Chunk> = stream.collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].type_name(), "abort");
        assert_eq!(output.status().await, RunStatus::Aborted);
        assert!(provider.requests().is_empty());
        assert!(!engine.abort(output.run_id()));
    }

    #[tokio::test]
    async fn finished_runs_leave_the_run_table() {
        let provider = Arc::new(ReplayProvider::new(vec![hello()]));
        let engine = Engine::new(provider);
        let run_id = Uuid::new_v4();
        let output = engine
            .start(RunRequest::default().with_run_id(run_id))
            .unwrap();
        assert_eq!(engine.active_runs(), vec![run_id]);
        assert!(matches!(
            engine.start(RunRequest::default().with_run_id(run_id)),
            Err(OutflowError::InvalidArgument(_))
        ));

        output.consume_stream().await;
        tokio::task::yield_now().await;
        assert!(engine.active_runs().is_empty());
        assert!(matches!(
            engine.resume(run_id, ResumeSignal::approve("x")),
            Err(OutflowError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn dropping_an_unobserved_output_ends_the_run() {
        let provider = Arc::new(ReplayProvider::new(vec![hello()]));
        let sink = Arc::new(crate::sink::MemorySink::new());
        let engine = Engine::new(provider.clone()).with_sink(sink.clone());
        let run_id = Uuid::new_v4();
        let output = engine
            .start(RunRequest::default().with_run_id(run_id))
            .unwrap();
        drop(output);

        for _ in 0..100 {
            if engine.active_runs().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(engine.active_runs().is_empty());
        assert!(provider.requests().is_empty());
        assert_eq!(sink.get(&run_id).unwrap().status, RunStatus::Aborted);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_start() {
        let provider = Arc::new(ReplayProvider::new(vec![hello()]));
        let engine = Engine::new(provider).with_config(EngineConfig {
            max_steps: 0,
            ..EngineConfig::default()
        });
        assert!(matches!(
            engine.start(RunRequest::default()),
            Err(OutflowError::Configuration(_))
        ));
    }
}
