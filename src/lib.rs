//! Conductor – a distributed action-invocation engine
//!
//! Conductor lets a host application execute named actions that may run
//! locally, on a remote peer process, or inside a procedure-learning engine,
//! while every process on a shared message bus observes the same stream of
//! executions. The crate provides:
//! - The invocation state machine (status transitions, listeners, waits)
//! - A UID-indexed concurrent cache with parent-before-child watch ordering
//! - The dispatcher that claims or declines remote execution requests
//! - The reconstructor that rebuilds invocation state from status broadcasts
//! - A one-shot, cancelable continuation primitive for multi-hop requests

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Engine core modules implementing the distributed invocation protocol
pub mod engine;

// Re-export key types for convenience
pub use engine::{Engine, EngineConfig};

/// Current version of the Conductor engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
