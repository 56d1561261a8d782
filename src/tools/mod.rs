//! Tools the coordinator can execute on behalf of the model.

pub mod arguments;
pub mod registry;
pub mod schema;
pub mod tool;

pub use arguments::ToolArguments;
pub use registry::ToolRegistry;
pub use schema::{validate_arguments, ParameterBuilder, ToolParameters};
pub use tool::{AgentTool, Tool, ToolExecutionContext, ToolOutcome};
