//! Processors: user-supplied transforms over a run's output.
//!
//! A [`StreamProcessor`] sees each content chunk as it streams and may
//! rewrite it, drop it, or trip the run. A [`ResultProcessor`] runs once over
//! the finished transcript. The transcript is rebuilt from chunks *after*
//! stream processing, so whatever a stream processor did to the live output
//! is also what gets persisted.

pub mod builtin;
pub mod pipeline;

pub use builtin::*;
pub use pipeline::{PipelineOutput, PipelineState, ProcessorPipeline};

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::OutflowError;
use crate::run::types::RunStatus;
use crate::step::StepResult;
use crate::types::{Chunk, ChunkPayload, FinishReason, ModelMessage, RunId};

/// What a stream processor decided to do with a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorOutcome {
    /// Pass the (possibly rewritten) chunk downstream.
    Emit(Chunk),
    /// Suppress the chunk.
    Drop,
    /// Halt the run gracefully.
    Tripwire { reason: String },
}

/// Per-run, per-processor scratch space.
///
/// Owned by the run's pipeline state; a processor only ever sees its own.
#[derive(Debug)]
pub struct ProcessorState {
    text: String,
    reasoning: String,
    chunks_seen: u64,
    started_at: Instant,
    data: serde_json::Map<String, serde_json::Value>,
}

impl Default for ProcessorState {
    fn default() -> Self {
        Self {
            text: String::new(),
            reasoning: String::new(),
            chunks_seen: 0,
            started_at: Instant::now(),
            data: serde_json::Map::new(),
        }
    }
}

impl ProcessorState {
    /// Record an incoming chunk before the processor sees it.
    pub(crate) fn observe(&mut self, chunk: &Chunk) {
        self.chunks_seen += 1;
        match &chunk.payload {
            ChunkPayload::TextDelta { text, .. } => self.text.push_str(text),
            ChunkPayload::ReasoningDelta { text, .. } => self.reasoning.push_str(text),
            _ => {}
        }
    }

    /// Text deltas this processor has received in the run, including the current one.
    pub fn accumulated_text(&self) -> &str {
        &self.text
    }

    /// Reasoning deltas this processor has received in the run.
    pub fn accumulated_reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Number of chunks this processor has received, including the current one.
    pub fn chunks_seen(&self) -> u64 {
        self.chunks_seen
    }

    /// Time since the state was created for this run.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.data.remove(key)
    }
}

/// Stream-stage processor.
#[async_trait]
pub trait StreamProcessor: Send + Sync {
    /// Name used in logs, errors and tripwire chunks.
    fn name(&self) -> &str;

    /// Process one content chunk.
    async fn process(
        &self,
        chunk: Chunk,
        state: &mut ProcessorState,
    ) -> Result<ProcessorOutcome, OutflowError>;
}

/// Read-only context handed to result processors.
#[derive(Debug, Clone)]
pub struct ResultContext {
    pub run_id: RunId,
    pub status: RunStatus,
    pub finish_reason: FinishReason,
    /// Processed step results, including provider request/response metadata.
    pub steps: Vec<StepResult>,
}

/// Result-stage processor.
#[async_trait]
pub trait ResultProcessor: Send + Sync {
    fn name(&self) -> &str;

    /// Transform the finished, already-processed transcript.
    async fn process(
        &self,
        messages: Vec<ModelMessage>,
        ctx: &ResultContext,
    ) -> Result<Vec<ModelMessage>, OutflowError>;
}
