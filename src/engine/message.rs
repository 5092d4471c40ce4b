//! Wire identities and message shapes
//!
//! Defines the transaction identifier, the process identity, the structured
//! wire error, and the closed set of messages this engine produces and
//! consumes. The bus transport (serialization, routing, delivery) is an
//! external collaborator; only the shapes live here.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one process on the message bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new random ClientId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique transaction identifier
///
/// Issued monotonically by the bus authority. Serves both as invocation
/// identity and as message correlation key; the originator tag supports the
/// targeted bootstrap race-avoidance check in the dispatcher. A uid is never
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid {
    /// Process that requested this uid from the bus authority
    pub originator: ClientId,
    /// Monotonic sequence number within the originator
    pub seq: u64,
}

impl Uid {
    /// Create a uid from its parts
    pub fn new(originator: ClientId, seq: u64) -> Self {
        Self { originator, seq }
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.originator, self.seq)
    }
}

/// Structured error carried across process boundaries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ErrorInfo {
    /// Optional machine-readable error code
    pub code: Option<String>,
    /// Human-readable error message
    pub message: String,
    /// Arbitrary structured details
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ErrorInfo {
    /// Create an error with a message and no code
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Create an error with a machine-readable code
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// The error delivered when an invocation is cancelled
    pub fn cancelled() -> Self {
        Self::with_code("cancelled", "execution cancelled")
    }

    /// True if this error carries the given code
    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

impl From<&super::error::EngineError> for ErrorInfo {
    fn from(err: &super::error::EngineError) -> Self {
        use super::error::EngineError;
        let code = match err {
            EngineError::Wait(_) => "timeout",
            EngineError::Transition(_) => "illegal-transition",
            EngineError::Marshal(_) => "marshal",
            EngineError::Dispatch(_) => "unclaimable",
            EngineError::Bus(_) => "bus",
            EngineError::UnknownAction(_) => "unknown-action",
            EngineError::Action(info) => return info.clone(),
        };
        Self::with_code(code, err.to_string())
    }
}

/// Command a debugger issues in reply to a breakpoint notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepCommand {
    /// Execute the pending sub-action without stepping into it
    Over,
    /// Step into the pending sub-action
    Into,
    /// Resume free-running execution
    Resume,
}

/// Request that some eligible process execute an action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Transaction identifier for the new invocation
    pub uid: Uid,
    /// Uid of the invocation that caused this one, if any
    pub parent_uid: Option<Uid>,
    /// Name of the action to execute
    pub action: String,
    /// Serialized input values, one per input parameter
    pub inputs: Vec<String>,
    /// Whether execution should pause at sub-action boundaries
    pub stepped: bool,
    /// Process that published this request
    pub sender: ClientId,
}

/// Decline reply: this process cannot execute the requested action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestIgnored {
    /// Uid of the declined request
    pub uid: Uid,
    /// Process that declined
    pub sender: ClientId,
}

/// Broadcast: an invocation started executing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartStatus {
    /// Transaction identifier
    pub uid: Uid,
    /// Parent invocation, if any
    pub parent_uid: Option<Uid>,
    /// Action name; `None` denotes a composite gesture container
    pub action: Option<String>,
    /// Cross-process ordering number, present only for top-level invocations
    pub serial: Option<u64>,
    /// Serialized input values
    pub inputs: Vec<String>,
    /// Whether the execution is stepped
    pub stepped: bool,
    /// Process executing the invocation
    pub sender: ClientId,
}

/// Broadcast: an invocation finished successfully
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessStatus {
    /// Transaction identifier
    pub uid: Uid,
    /// Serialized output values, one per output parameter
    pub outputs: Vec<String>,
    /// Process that executed the invocation
    pub sender: ClientId,
}

/// Broadcast: an invocation failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorStatus {
    /// Transaction identifier
    pub uid: Uid,
    /// Structured failure description
    pub error: ErrorInfo,
    /// Process reporting the failure
    pub sender: ClientId,
}

/// Broadcast: nobody executed the request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IgnoredStatus {
    /// Transaction identifier
    pub uid: Uid,
    /// Process reporting the outcome
    pub sender: ClientId,
}

/// Broadcast: a stepped execution paused at a sub-action boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakpointNotify {
    /// Transaction identifier of the paused invocation
    pub uid: Uid,
    /// Position of the pending sub-action within its container
    pub position: usize,
    /// Name of the pending sub-action, if known
    pub sub_action: Option<String>,
    /// Process executing the invocation
    pub sender: ClientId,
}

/// Reply to a breakpoint notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakpointResponse {
    /// Transaction identifier of the paused invocation
    pub uid: Uid,
    /// How execution should proceed
    pub command: StepCommand,
    /// Process issuing the command
    pub sender: ClientId,
}

/// Advisory request to cancel a running invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Transaction identifier of the invocation to cancel
    pub uid: Uid,
    /// Process requesting cancellation
    pub sender: ClientId,
}

/// Discriminant for subscription filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// [`ExecuteRequest`]
    Execute,
    /// [`RequestIgnored`]
    RequestIgnored,
    /// [`StartStatus`]
    Start,
    /// [`SuccessStatus`]
    Success,
    /// [`ErrorStatus`]
    Error,
    /// [`IgnoredStatus`]
    Ignored,
    /// [`BreakpointNotify`]
    BreakpointNotify,
    /// [`BreakpointResponse`]
    BreakpointResponse,
    /// [`CancelRequest`]
    Cancel,
}

impl MessageKind {
    /// All execution-status kinds, in no particular order. The reconstructor
    /// subscribes to exactly this set.
    pub const STATUS: [MessageKind; 5] = [
        MessageKind::Start,
        MessageKind::Success,
        MessageKind::Error,
        MessageKind::Ignored,
        MessageKind::BreakpointNotify,
    ];
}

/// Closed set of messages exchanged over the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusMessage {
    /// Request that some eligible process execute an action
    Execute(ExecuteRequest),
    /// Decline reply to an execution request
    RequestIgnored(RequestIgnored),
    /// Execution started
    Start(StartStatus),
    /// Execution finished successfully
    Success(SuccessStatus),
    /// Execution failed
    Error(ErrorStatus),
    /// Nobody executed the request
    Ignored(IgnoredStatus),
    /// Stepped execution paused
    BreakpointNotify(BreakpointNotify),
    /// Reply to a breakpoint notification
    BreakpointResponse(BreakpointResponse),
    /// Advisory cancellation request
    Cancel(CancelRequest),
}

impl BusMessage {
    /// Discriminant of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            BusMessage::Execute(_) => MessageKind::Execute,
            BusMessage::RequestIgnored(_) => MessageKind::RequestIgnored,
            BusMessage::Start(_) => MessageKind::Start,
            BusMessage::Success(_) => MessageKind::Success,
            BusMessage::Error(_) => MessageKind::Error,
            BusMessage::Ignored(_) => MessageKind::Ignored,
            BusMessage::BreakpointNotify(_) => MessageKind::BreakpointNotify,
            BusMessage::BreakpointResponse(_) => MessageKind::BreakpointResponse,
            BusMessage::Cancel(_) => MessageKind::Cancel,
        }
    }

    /// Transaction identifier this message correlates with
    pub fn uid(&self) -> Uid {
        match self {
            BusMessage::Execute(m) => m.uid,
            BusMessage::RequestIgnored(m) => m.uid,
            BusMessage::Start(m) => m.uid,
            BusMessage::Success(m) => m.uid,
            BusMessage::Error(m) => m.uid,
            BusMessage::Ignored(m) => m.uid,
            BusMessage::BreakpointNotify(m) => m.uid,
            BusMessage::BreakpointResponse(m) => m.uid,
            BusMessage::Cancel(m) => m.uid,
        }
    }

    /// Process that published this message
    pub fn sender(&self) -> ClientId {
        match self {
            BusMessage::Execute(m) => m.sender,
            BusMessage::RequestIgnored(m) => m.sender,
            BusMessage::Start(m) => m.sender,
            BusMessage::Success(m) => m.sender,
            BusMessage::Error(m) => m.sender,
            BusMessage::Ignored(m) => m.sender,
            BusMessage::BreakpointNotify(m) => m.sender,
            BusMessage::BreakpointResponse(m) => m.sender,
            BusMessage::Cancel(m) => m.sender,
        }
    }
}
