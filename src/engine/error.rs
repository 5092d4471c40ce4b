//! Error types for the invocation engine
//!
//! Per-subsystem error enums with conversions into the top-level
//! [`EngineError`] at module boundaries. Anything that can be expressed as
//! the outcome of a remote action is converted into a status message at the
//! dispatcher/reconstructor boundary instead of crossing a process boundary
//! as an error value.

use std::time::Duration;
use thiserror::Error;

use super::invocation::Status;
use super::message::Uid;

/// Bounded-wait failures. Recoverable almost everywhere: call sites degrade
/// to "proceed without parent", "abandon with a leak warning", or "decline".
#[derive(Debug, Clone, Error)]
pub enum WaitError {
    /// A uid could not be resolved within the allotted time.
    #[error("uid {uid} not resolved within {timeout:?}")]
    Timeout {
        /// The uid that was being waited for
        uid: Uid,
        /// How long the caller was willing to wait
        timeout: Duration,
    },

    /// An awaited status class was not reached within the allotted time.
    #[error("invocation {uid} did not leave {status:?} within {timeout:?}")]
    StatusTimeout {
        /// Invocation that was being observed
        uid: Uid,
        /// Status the invocation was still in when the wait expired
        status: Status,
        /// How long the caller was willing to wait
        timeout: Duration,
    },
}

/// Convenience result alias for bounded waits
pub type WaitResult<T> = std::result::Result<T, WaitError>;

/// Status-transition failures raised by the invocation state machine
#[derive(Debug, Error)]
pub enum TransitionError {
    /// The requested transition violates the transition table.
    #[error("illegal status transition from {from:?} to {to:?}")]
    Illegal {
        /// Status the invocation was in
        from: Status,
        /// Status that was requested
        to: Status,
    },

    /// A direct transition was attempted on an invocation this process does
    /// not execute. Remote invocations change status only through echoed
    /// status messages.
    #[error("invocation {0} is not executed by this process")]
    NotOwner(Uid),

    /// Cancellation was requested outside of RUNNING/PAUSED.
    #[error("cannot cancel an invocation in status {0:?}")]
    NotCancelable(Status),

    /// The combined serialized parameter payload exceeds the configured
    /// maximum; the attempted ENDED transition is redirected to FAILED.
    #[error("serialized parameters total {actual} bytes, exceeding the {limit} byte limit")]
    SizeLimit {
        /// Total serialized size of all bound parameters
        actual: usize,
        /// Configured maximum
        limit: usize,
    },

    /// A parameter could not be marshaled while computing the payload size.
    #[error("marshaling failed: {0}")]
    Marshal(#[from] MarshalError),
}

/// Convenience result alias for status transitions
pub type TransitionResult<T> = std::result::Result<T, TransitionError>;

/// Value/wire conversion failures while binding parameters
#[derive(Debug, Clone, Error)]
pub enum MarshalError {
    /// A specific parameter could not be converted.
    #[error("parameter {index}: {detail}")]
    Param {
        /// Zero-based parameter index
        index: usize,
        /// Description of the conversion failure
        detail: String,
    },

    /// A value could not be converted independent of parameter position.
    #[error("{0}")]
    Value(String),

    /// The message carried a different number of values than the definition
    /// declares.
    #[error("expected {expected} serialized values, got {actual}")]
    Arity {
        /// Parameter count the definition declares
        expected: usize,
        /// Value count carried by the message
        actual: usize,
    },
}

/// Reasons an inbound execution request cannot be claimed by this process.
/// Answered with a `RequestIgnored` reply, never surfaced as an error.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// No definition is registered under the requested action name.
    #[error("no definition for action '{0}'")]
    UnknownAction(String),

    /// The definition has no locally registered executor.
    #[error("action '{0}' has no local executor")]
    NoLocalExecutor(String),

    /// The executor is the procedure-learning engine, which claims its own
    /// requests.
    #[error("action '{0}' is executed by the learning engine")]
    LearningEngine(String),
}

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bounded-wait timeout
    #[error("wait error: {0}")]
    Wait(#[from] WaitError),

    /// Illegal or unauthorized status transition
    #[error("transition error: {0}")]
    Transition(#[from] TransitionError),

    /// Parameter marshaling failure
    #[error("marshal error: {0}")]
    Marshal(#[from] MarshalError),

    /// Request could not be claimed
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Message bus failure
    #[error("bus error: {0}")]
    Bus(#[from] super::bus::BusError),

    /// No definition exists for the requested action name. The only
    /// synchronous pre-flight failure: there is nothing to ask a remote peer
    /// to do.
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    /// An action finished with a structured error, surfaced to a synchronous
    /// caller.
    #[error("action failed: {0}")]
    Action(super::message::ErrorInfo),
}

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
