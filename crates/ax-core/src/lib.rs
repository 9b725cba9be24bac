//! Core data model, error taxonomy, configuration and persistence for the
//! execution lifecycle.

pub mod config;
pub mod error;
pub mod store;
pub mod types;
