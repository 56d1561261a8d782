//! The caller-facing handle of a run.
//!
//! A [`ModelOutput`] is cheap to clone. Every getter awaits the run's
//! terminal outcome; [`ModelOutput::subscribe`] gives an independent replay
//! of the processed chunk stream. Production is lazy: nothing is requested
//! from the provider until the first subscribe, getter, or
//! [`ModelOutput::consume_stream`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::approvals::{PendingToolCall, ResumeSignal};
use super::broadcast::{Broadcaster, ChunkStream};
use super::types::{RetentionStats, RunOutcome, RunStatus};
use crate::error::OutflowError;
use crate::step::StepResult;
use crate::types::{
    AgentToolCall, AgentToolResult, ChunkPayload, FinishReason, ModelMessage, RunId, Usage,
};

/// Opens once; the producer waits on it before requesting anything.
#[derive(Debug, Default)]
pub(crate) struct StartGate {
    open: AtomicBool,
    notify: Notify,
}

impl StartGate {
    pub(crate) fn open(&self) {
        if !self.open.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) async fn wait(&self) {
        if self.is_open() {
            return;
        }
        // notify_one stores a permit, so an open() racing this await is not lost.
        self.notify.notified().await;
    }
}

/// Control surface shared by a run's output handles and the engine.
#[derive(Debug, Clone)]
pub(crate) struct RunControl {
    pub(crate) run_id: RunId,
    pub(crate) cancel: CancellationToken,
    pub(crate) gate: Arc<StartGate>,
    pub(crate) resume_tx: mpsc::UnboundedSender<ResumeSignal>,
    pub(crate) pending: Arc<Mutex<Option<PendingToolCall>>>,
    pub(crate) broadcaster: Broadcaster,
}

impl RunControl {
    /// Cancel the run. Returns `false` when it already ended, is finalizing,
    /// or was aborted.
    pub(crate) fn abort(&self) -> bool {
        if !self.broadcaster.begin_abort() {
            return false;
        }
        info!(run_id = %self.run_id, "abort requested");
        self.cancel.cancel();
        // Let a producer that never started observe the abort.
        self.gate.open();
        true
    }

    pub(crate) fn pending(&self) -> Option<PendingToolCall> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_pending(&self, pending: Option<PendingToolCall>) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = pending;
    }

    /// Hand a resume signal to the parked call it targets. The parked call
    /// is claimed, so each park accepts exactly one signal.
    pub(crate) fn resume(&self, signal: ResumeSignal) -> Result<(), OutflowError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(waiting) = pending.as_ref() else {
            return Err(OutflowError::InvalidState(format!(
                "run {} has no tool call waiting for a resume signal",
                self.run_id
            )));
        };
        if !signal.targets(&waiting.tool_call_id) {
            return Err(OutflowError::InvalidArgument(format!(
                "resume signal for {} but {} is waiting",
                signal.tool_call_id.as_deref().unwrap_or_default(),
                waiting.tool_call_id
            )));
        }
        let tool_call_id = waiting.tool_call_id.clone();
        self.resume_tx
            .send(signal)
            .map_err(|_| OutflowError::InvalidState(format!("run {} has ended", self.run_id)))?;
        *pending = None;
        debug!(run_id = %self.run_id, %tool_call_id, "resume signal accepted");
        Ok(())
    }
}

#[derive(Debug)]
struct OutputInner {
    control: RunControl,
    outcome: watch::Receiver<Option<Arc<RunOutcome>>>,
    retained_steps: Arc<AtomicUsize>,
}

impl Drop for OutputInner {
    fn drop(&mut self) {
        // Nobody can observe a run that never started, so stop its producer.
        if !self.control.gate.is_open() && self.control.abort() {
            debug!(run_id = %self.control.run_id, "output dropped before start, run aborted");
        }
        self.control.broadcaster.unhold();
    }
}

/// Handle to a running (or finished) model output.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    inner: Arc<OutputInner>,
}

impl ModelOutput {
    pub(crate) fn new(
        control: RunControl,
        outcome: watch::Receiver<Option<Arc<RunOutcome>>>,
        retained_steps: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            inner: Arc::new(OutputInner {
                control,
                outcome,
                retained_steps,
            }),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.inner.control.run_id
    }

    /// Attach a new subscriber. It sees every chunk still buffered, in
    /// order, then live chunks until the terminal chunk.
    pub fn subscribe(&self) -> ChunkStream {
        let subscription = self.inner.control.broadcaster.subscribe();
        self.inner.control.gate.open();
        subscription.into_stream()
    }

    /// Subscriber view of just the processed text deltas.
    pub fn text_stream(&self) -> BoxStream<'static, String> {
        self.subscribe()
            .filter_map(|chunk| async move {
                match chunk.payload {
                    ChunkPayload::TextDelta { text, .. } => Some(text),
                    _ => None,
                }
            })
            .boxed()
    }

    /// Drive the run to completion without rendering it.
    pub async fn consume_stream(&self) -> Arc<RunOutcome> {
        self.outcome().await
    }

    /// The terminal outcome, starting the run if needed.
    pub async fn outcome(&self) -> Arc<RunOutcome> {
        self.inner.control.gate.open();
        let mut rx = self.inner.outcome.clone();
        let resolved = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.as_ref().map(Arc::clone),
            Err(_) => None,
        };
        resolved.unwrap_or_else(|| Arc::new(RunOutcome::lost(self.run_id())))
    }

    /// Status right now, without waiting or starting the run.
    pub fn current_status(&self) -> RunStatus {
        self.inner
            .outcome
            .borrow()
            .as_ref()
            .map_or(RunStatus::Running, |outcome| outcome.status)
    }

    /// Terminal status.
    pub async fn status(&self) -> RunStatus {
        self.outcome().await.status
    }

    pub async fn text(&self) -> String {
        self.outcome().await.text.clone()
    }

    pub async fn reasoning_text(&self) -> String {
        self.outcome().await.reasoning_text.clone()
    }

    pub async fn usage(&self) -> Usage {
        self.outcome().await.usage.clone()
    }

    pub async fn finish_reason(&self) -> FinishReason {
        self.outcome().await.finish_reason
    }

    pub async fn tool_calls(&self) -> Vec<AgentToolCall> {
        self.outcome().await.tool_calls()
    }

    pub async fn tool_results(&self) -> Vec<AgentToolResult> {
        self.outcome().await.tool_results()
    }

    pub async fn steps(&self) -> Vec<StepResult> {
        self.outcome().await.steps.clone()
    }

    /// Persisted transcript, after result processors.
    pub async fn messages(&self) -> Vec<ModelMessage> {
        self.outcome().await.messages.clone()
    }

    pub async fn warnings(&self) -> Vec<String> {
        self.outcome().await.warnings.clone()
    }

    pub async fn object(&self) -> Option<serde_json::Value> {
        self.outcome().await.object.clone()
    }

    pub async fn tripwire_reason(&self) -> Option<String> {
        self.outcome().await.tripwire_reason.clone()
    }

    pub async fn error(&self) -> Option<String> {
        self.outcome().await.error.clone()
    }

    /// Cancel the run. Idempotent; a no-op once the run is terminal.
    pub fn abort(&self) -> bool {
        self.inner.control.abort()
    }

    /// Tool call the run is parked on, if any.
    pub fn pending_tool_call(&self) -> Option<PendingToolCall> {
        self.inner.control.pending()
    }

    /// Resume a parked tool call.
    pub fn resume(&self, signal: ResumeSignal) -> Result<(), OutflowError> {
        self.inner.control.resume(signal)
    }

    /// Buffer diagnostics.
    pub fn retention(&self) -> RetentionStats {
        let broadcaster = &self.inner.control.broadcaster;
        RetentionStats {
            buffered_chunks: broadcaster.buffered_chunks(),
            retained_steps: self.inner.retained_steps.load(Ordering::Acquire),
            subscribers: broadcaster.subscriber_count(),
            evicted_chunks: broadcaster.evicted_chunks(),
            released: broadcaster.is_released(),
        }
    }
}
