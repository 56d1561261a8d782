//! Run accumulator: the processed view of a run that final results are
//! built from.
//!
//! Fed with chunks *after* stream processing, so the transcript it produces
//! is exactly what subscribers were shown. Step results are kept only until
//! the run finalizes; [`RunAccumulator::into_outcome`] moves everything out
//! and leaves nothing retained.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::types::{RunOutcome, RunStatus};
use crate::config::BufferPolicy;
use crate::error::OutflowError;
use crate::processor::ResultContext;
use crate::step::{StepAccumulator, StepResult};
use crate::types::{AgentToolCall, Chunk, ChunkPayload, FinishReason, ModelMessage, RunId, StepId, Usage};

#[derive(Debug)]
pub struct RunAccumulator {
    run_id: RunId,
    current: Option<StepAccumulator>,
    steps: VecDeque<StepResult>,
    steps_taken: usize,
    evicted_steps: usize,
    max_retained_steps: usize,
    transcript: Vec<ModelMessage>,
    text: String,
    reasoning: String,
    usage: Usage,
    warnings: Vec<String>,
    object: Option<serde_json::Value>,
    tripwire: Option<String>,
    error: Option<String>,
    retained: Arc<AtomicUsize>,
}

impl RunAccumulator {
    pub fn new(run_id: RunId, policy: &BufferPolicy) -> Self {
        Self {
            run_id,
            current: None,
            steps: VecDeque::new(),
            steps_taken: 0,
            evicted_steps: 0,
            max_retained_steps: policy.max_retained_steps.max(1),
            transcript: Vec::new(),
            text: String::new(),
            reasoning: String::new(),
            usage: Usage::default(),
            warnings: Vec::new(),
            object: None,
            tripwire: None,
            error: None,
            retained: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Live count of retained steps (sealed plus the open one), readable
    /// from other tasks.
    pub fn retained_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.retained)
    }

    /// Open a new step. The previous step must have sealed.
    pub fn begin_step(&mut self, step_id: StepId, step_number: usize) -> Result<(), OutflowError> {
        if let Some(open) = &self.current {
            return Err(OutflowError::InvalidState(format!(
                "step {} still open when starting step {step_id}",
                open.step_id()
            )));
        }
        self.current = Some(StepAccumulator::lenient(step_id, step_number));
        self.sync_retained();
        Ok(())
    }

    /// Apply one processed chunk. Returns the step result when the chunk
    /// sealed the current step.
    pub fn apply(&mut self, chunk: &Chunk) -> Result<Option<&StepResult>, OutflowError> {
        match &chunk.payload {
            ChunkPayload::Tripwire { reason, .. } => {
                self.tripwire = Some(reason.clone());
                return Ok(None);
            }
            ChunkPayload::Error { message, .. } => {
                self.error = Some(message.clone());
                return Ok(None);
            }
            ChunkPayload::Start { .. } | ChunkPayload::Finish { .. } | ChunkPayload::Abort { .. } => {
                return Ok(None);
            }
            _ => {}
        }

        let Some(current) = self.current.as_mut() else {
            return Err(OutflowError::ProtocolViolation(format!(
                "{} chunk with no open step",
                chunk.type_name()
            )));
        };
        current.apply(chunk)?;
        if !current.is_sealed() {
            return Ok(None);
        }
        let Some(sealed) = self.current.take() else {
            return Ok(None);
        };
        let step = sealed.into_result()?;
        self.push_step(step);
        Ok(self.steps.back())
    }

    /// Close the open step, if any, with `finish_reason`. Used when a run
    /// ends mid-step.
    pub fn close_open_step(&mut self, finish_reason: FinishReason) -> Option<&StepResult> {
        let open = self.current.take()?;
        self.push_step(open.snapshot(finish_reason));
        self.steps.back()
    }

    fn push_step(&mut self, step: StepResult) {
        debug!(
            run_id = %self.run_id,
            step_id = %step.step_id,
            finish_reason = %step.finish_reason,
            text_len = step.text.len(),
            tool_calls = step.tool_calls.len(),
            "step sealed"
        );
        self.text.push_str(&step.text);
        self.reasoning.push_str(&step.reasoning);
        self.usage.merge(&step.usage);
        self.warnings.extend(step.warnings.iter().cloned());
        if step.object.is_some() {
            self.object = step.object.clone();
        }
        self.transcript.extend(step.to_messages());
        self.steps_taken += 1;
        self.steps.push_back(step);

        while self.steps.len() > self.max_retained_steps {
            if let Some(evicted) = self.steps.pop_front() {
                self.evicted_steps += 1;
                warn!(
                    run_id = %self.run_id,
                    step_id = %evicted.step_id,
                    max_retained_steps = self.max_retained_steps,
                    "step retention ceiling reached, dropping oldest step result"
                );
            }
        }
        self.sync_retained();
    }

    fn sync_retained(&self) {
        let open = usize::from(self.current.is_some());
        self.retained.store(self.steps.len() + open, Ordering::Release);
    }

    pub fn has_open_step(&self) -> bool {
        self.current.is_some()
    }

    /// Tool calls in the open step that have no result or error yet.
    pub fn open_tool_calls(&self) -> Vec<AgentToolCall> {
        let Some(step) = self.current.as_ref() else {
            return Vec::new();
        };
        step.tool_calls()
            .iter()
            .filter(|call| {
                !step
                    .tool_results()
                    .iter()
                    .any(|result| result.tool_call_id == call.id)
            })
            .cloned()
            .collect()
    }

    /// Id of the open step, if any.
    pub fn open_step_id(&self) -> Option<StepId> {
        self.current.as_ref().map(StepAccumulator::step_id)
    }

    pub fn last_step(&self) -> Option<&StepResult> {
        self.steps.back()
    }

    /// Steps sealed so far, including any dropped by the retention ceiling.
    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    pub fn evicted_steps(&self) -> usize {
        self.evicted_steps
    }

    /// Processed transcript of the run so far.
    pub fn transcript(&self) -> &[ModelMessage] {
        &self.transcript
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tripwire_reason(&self) -> Option<&str> {
        self.tripwire.as_deref()
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Context handed to result processors.
    pub fn result_context(&self, status: RunStatus, finish_reason: FinishReason) -> ResultContext {
        ResultContext {
            run_id: self.run_id,
            status,
            finish_reason,
            steps: self.steps.iter().cloned().collect(),
        }
    }

    /// Move everything into the run's outcome, releasing the accumulator's
    /// buffers. `messages` is the transcript after result processing.
    pub fn into_outcome(
        mut self,
        status: RunStatus,
        finish_reason: FinishReason,
        messages: Vec<ModelMessage>,
    ) -> RunOutcome {
        self.retained.store(0, Ordering::Release);
        RunOutcome {
            run_id: self.run_id,
            status,
            finish_reason,
            text: std::mem::take(&mut self.text),
            reasoning_text: std::mem::take(&mut self.reasoning),
            usage: std::mem::take(&mut self.usage),
            steps: std::mem::take(&mut self.steps).into(),
            messages,
            warnings: std::mem::take(&mut self.warnings),
            object: self.object.take(),
            tripwire_reason: self.tripwire.take(),
            error: self.error.take(),
        }
    }
}
