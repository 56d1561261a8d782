//! Outflow: model-output streaming engine for LLM agent runs.
//!
//! A run drives a model provider step by step, pushes every chunk through
//! user-supplied stream processors, executes tool calls between steps, and
//! fans the processed stream out to any number of subscribers. Final results
//! (text, usage, steps, the persisted transcript) are built from the same
//! processed chunks the subscribers saw.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use outflow::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let provider = ReplayProvider::from_jsonl(&std::fs::read_to_string("events.jsonl")?)?;
//! let engine = Engine::new(Arc::new(provider)).with_pipeline(
//!     ProcessorPipeline::new()
//!         .with_stream_processor(Arc::new(RegexRedactor::new(r"sk-[A-Za-z0-9]+", "[redacted]")?)),
//! );
//! let output = engine.start(RunRequest::new(vec![ModelMessage::user("Hello!")]))?;
//! let mut text = output.text_stream();
//! while let Some(delta) = text.next().await {
//!     print!("{delta}");
//! }
//! println!("\n{:?}", output.usage().await);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod prelude;
pub mod processor;
pub mod provider;
pub mod run;
pub mod sink;
pub mod step;
pub mod stop;
pub mod tools;
pub mod types;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;
