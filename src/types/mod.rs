//! Core types for Outflow.

pub mod chunk;
pub mod generation;
pub mod message;
pub mod usage;

pub use chunk::*;
pub use generation::*;
pub use message::*;
pub use usage::*;
