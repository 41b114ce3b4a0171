//! Codeloop - a generate, execute, analyze control loop for code-writing agents
//!
//! Each iteration produces one code artifact, runs it on a local or remote
//! backend, feeds the result to an analyzer exactly once, and closes the
//! artifact before the next iteration may start. Session state is split into
//! a durable tier that survives invocations and an ephemeral tier that never
//! leaves the current iteration.

pub mod backend;
pub mod error;
pub mod id;
pub mod orchestrator;
pub mod registry;
pub mod state;
pub mod storage;

pub use error::{CodeloopError, Result};
