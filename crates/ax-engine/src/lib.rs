//! Execution lifecycle engine.
//!
//! Composes the store from `ax-core` with the state machine guard, the
//! progress tracker, the background task supervisor and the task runner,
//! and exposes them through [`orchestrator::ExecutionOrchestrator`].

pub mod approval;
pub mod collaborators;
pub mod events;
pub mod guard;
pub mod orchestrator;
pub mod progress;
pub mod remote;
pub mod supervisor;
pub mod task_runner;
