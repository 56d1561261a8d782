//! Ordered processor pipeline.

use std::sync::Arc;

use tracing::debug;

use super::{ProcessorOutcome, ProcessorState, ResultContext, ResultProcessor, StreamProcessor};
use crate::error::OutflowError;
use crate::types::{Chunk, ModelMessage};

/// Result of pushing one chunk through the stream stage.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutput {
    Emit(Chunk),
    Dropped { processor: String },
    Tripwire { processor: String, reason: String },
}

/// Per-run scratch space for every stream processor of a pipeline.
#[derive(Debug, Default)]
pub struct PipelineState {
    states: Vec<ProcessorState>,
}

impl PipelineState {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Stream processors applied in order to content chunks, and result
/// processors applied in order to the final transcript.
#[derive(Clone, Default)]
pub struct ProcessorPipeline {
    stream: Vec<Arc<dyn StreamProcessor>>,
    result: Vec<Arc<dyn ResultProcessor>>,
}

impl std::fmt::Debug for ProcessorPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorPipeline")
            .field(
                "stream",
                &self.stream.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field(
                "result",
                &self.result.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ProcessorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream_processor(mut self, processor: Arc<dyn StreamProcessor>) -> Self {
        self.stream.push(processor);
        self
    }

    pub fn with_result_processor(mut self, processor: Arc<dyn ResultProcessor>) -> Self {
        self.result.push(processor);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stream.is_empty() && self.result.is_empty()
    }

    /// Fresh scratch space for one run.
    pub fn new_state(&self) -> PipelineState {
        PipelineState {
            states: self.stream.iter().map(|_| ProcessorState::default()).collect(),
        }
    }

    /// Run a chunk through every stream processor in order.
    ///
    /// Lifecycle chunks pass through untouched. A processor may not turn a
    /// content chunk into a lifecycle chunk, and the run and step ids of the
    /// input are kept on whatever it emits.
    pub async fn process_chunk(
        &self,
        chunk: Chunk,
        state: &mut PipelineState,
    ) -> Result<PipelineOutput, OutflowError> {
        if chunk.payload.is_lifecycle() {
            return Ok(PipelineOutput::Emit(chunk));
        }
        if state.states.len() != self.stream.len() {
            return Err(OutflowError::InvalidState(format!(
                "pipeline state has {} slots for {} processors",
                state.states.len(),
                self.stream.len()
            )));
        }

        let (run_id, step_id) = (chunk.run_id, chunk.step_id);
        let mut current = chunk;
        for (processor, slot) in self.stream.iter().zip(state.states.iter_mut()) {
            slot.observe(&current);
            let outcome = processor
                .process(current, slot)
                .await
                .map_err(|err| wrap_error(processor.name(), err))?;
            match outcome {
                ProcessorOutcome::Emit(mut next) => {
                    if next.payload.is_lifecycle() {
                        return Err(OutflowError::processor(
                            processor.name(),
                            format!("emitted lifecycle chunk {}", next.type_name()),
                        ));
                    }
                    next.run_id = run_id;
                    next.step_id = step_id;
                    current = next;
                }
                ProcessorOutcome::Drop => {
                    debug!(processor = processor.name(), "chunk dropped by processor");
                    return Ok(PipelineOutput::Dropped {
                        processor: processor.name().to_string(),
                    });
                }
                ProcessorOutcome::Tripwire { reason } => {
                    debug!(processor = processor.name(), %reason, "processor tripwire");
                    return Ok(PipelineOutput::Tripwire {
                        processor: processor.name().to_string(),
                        reason,
                    });
                }
            }
        }
        Ok(PipelineOutput::Emit(current))
    }

    /// Run the result stage over the processed transcript.
    pub async fn process_result(
        &self,
        mut messages: Vec<ModelMessage>,
        ctx: &ResultContext,
    ) -> Result<Vec<ModelMessage>, OutflowError> {
        for processor in &self.result {
            messages = processor
                .process(messages, ctx)
                .await
                .map_err(|err| wrap_error(processor.name(), err))?;
        }
        Ok(messages)
    }
}

fn wrap_error(name: &str, err: OutflowError) -> OutflowError {
    match err {
        OutflowError::Processor { .. } => err,
        other => OutflowError::processor(name, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::builtin::{ChunkFilter, TextMapper};
    use crate::processor::ProcessorState;
    use crate::types::{ChunkPayload, FinishReason, Usage};
    use async_trait::async_trait;
    use uuid::Uuid;

    fn delta(text: &str) -> Chunk {
        Chunk::new(
            Uuid::new_v4(),
            Some(Uuid::new_v4()),
            ChunkPayload::TextDelta {
                id: "t".into(),
                text: text.into(),
            },
        )
    }

    struct Failing;

    #[async_trait]
    impl StreamProcessor for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn process(
            &self,
            _chunk: Chunk,
            _state: &mut ProcessorState,
        ) -> Result<ProcessorOutcome, OutflowError> {
            Err(OutflowError::InvalidArgument("boom".into()))
        }
    }

    struct Counter;

    #[async_trait]
    impl StreamProcessor for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn process(
            &self,
            chunk: Chunk,
            state: &mut ProcessorState,
        ) -> Result<ProcessorOutcome, OutflowError> {
            state.set("seen", serde_json::json!(state.chunks_seen()));
            Ok(ProcessorOutcome::Emit(chunk))
        }
    }

    #[tokio::test]
    async fn processors_apply_in_order() {
        let pipeline = ProcessorPipeline::new()
            .with_stream_processor(Arc::new(TextMapper::new(|t| t.to_uppercase())))
            .with_stream_processor(Arc::new(TextMapper::new(|t| format!("{t}!"))));
        let mut state = pipeline.new_state();
        let out = pipeline.process_chunk(delta("hi"), &mut state).await.unwrap();
        let PipelineOutput::Emit(chunk) = out else {
            panic!("expected emit");
        };
        assert_eq!(chunk.payload.delta_text(), Some("HI!"));
    }

    #[tokio::test]
    async fn drop_short_circuits_later_processors() {
        let pipeline = ProcessorPipeline::new()
            .with_stream_processor(Arc::new(ChunkFilter::new(|c: &Chunk| {
                c.payload.delta_text() != Some("drop")
            })))
            .with_stream_processor(Arc::new(Counter));
        let mut state = pipeline.new_state();
        let out = pipeline
            .process_chunk(delta("drop"), &mut state)
            .await
            .unwrap();
        assert!(matches!(out, PipelineOutput::Dropped { .. }));
        assert_eq!(state.states[1].chunks_seen(), 0);
    }

    #[tokio::test]
    async fn lifecycle_chunks_bypass_processors() {
        let pipeline = ProcessorPipeline::new().with_stream_processor(Arc::new(Failing));
        let mut state = pipeline.new_state();
        let finish = Chunk::new(
            Uuid::new_v4(),
            None,
            ChunkPayload::Finish {
                finish_reason: FinishReason::Stop,
                usage: Usage::default(),
            },
        );
        let out = pipeline
            .process_chunk(finish.clone(), &mut state)
            .await
            .unwrap();
        assert_eq!(out, PipelineOutput::Emit(finish));
    }

    #[tokio::test]
    async fn errors_are_attributed_to_the_processor() {
        let pipeline = ProcessorPipeline::new().with_stream_processor(Arc::new(Failing));
        let mut state = pipeline.new_state();
        let err = pipeline
            .process_chunk(delta("x"), &mut state)
            .await
            .unwrap_err();
        match err {
            OutflowError::Processor { processor, .. } => assert_eq!(processor, "failing"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn state_is_per_processor() {
        let pipeline = ProcessorPipeline::new()
            .with_stream_processor(Arc::new(Counter))
            .with_stream_processor(Arc::new(Counter));
        let mut state = pipeline.new_state();
        pipeline.process_chunk(delta("a"), &mut state).await.unwrap();
        pipeline.process_chunk(delta("b"), &mut state).await.unwrap();
        assert_eq!(state.states[0].get("seen"), Some(&serde_json::json!(2)));
        assert_eq!(state.states[0].accumulated_text(), "ab");
        assert_eq!(state.len(), 2);
    }
}
