//! Logging setup shared by the orchestrator binaries and tests.
//!
//! All crates emit through `tracing`; this crate only decides where the
//! events go and in which format.

pub mod logging;
