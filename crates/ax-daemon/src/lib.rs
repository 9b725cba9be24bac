//! Long-running host for the execution orchestrator.

pub mod daemon;
