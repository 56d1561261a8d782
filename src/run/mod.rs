//! Runs: the producer loop, its processed accumulation, the chunk
//! broadcaster and the caller-facing [`ModelOutput`].

pub mod accumulator;
pub mod approvals;
pub mod broadcast;
pub mod coordinator;
pub mod engine;
pub mod output;
pub mod types;

pub use accumulator::RunAccumulator;
pub use approvals::{ApprovalPolicy, PendingToolCall, ResumeDecision, ResumeSignal, WaitKind};
pub use broadcast::{Broadcaster, ChunkStream, Subscription};
pub use coordinator::{decide_after_step, CallProgress, LoopState, StepDecision, ToolCoordinator};
pub use engine::{Engine, RunRequest};
pub use output::ModelOutput;
pub use types::{RetentionStats, RunOutcome, RunStatus};
