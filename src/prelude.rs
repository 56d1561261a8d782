//! Convenience re-exports for common use.

pub use crate::config::{BufferPolicy, EngineConfig};
pub use crate::error::{ErrorCategory, OutflowError, Result};
pub use crate::processor::{
    ProcessorOutcome, ProcessorPipeline, ProcessorState, RegexRedactor, ResultProcessor,
    StreamProcessor,
};
pub use crate::provider::{ModelProvider, ProviderRequest, ProviderStream, ReplayProvider};
pub use crate::run::{
    ApprovalPolicy, Engine, ModelOutput, ResumeSignal, RunOutcome, RunRequest, RunStatus,
};
pub use crate::sink::{MemorySink, TranscriptSink};
pub use crate::step::StepResult;
pub use crate::tools::{AgentTool, Tool, ToolArguments, ToolParameters};
pub use crate::types::{Chunk, ChunkPayload, FinishReason, ModelMessage, Usage};
