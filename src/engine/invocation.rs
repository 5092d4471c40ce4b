//! Invocation state machine
//!
//! Models one action occurrence: identity, arguments, status, and listeners.
//! Status transitions follow a fixed table; terminal statuses are absorbing.
//! Listener notification snapshots the registered sets under the lock and
//! delivers outside it, so listeners may mutate the sets freely. Every
//! transition signals the invocation's condition variable, which backs the
//! blocking wait helpers.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::EngineConfig;
use super::bus::MessageBus;
use super::error::{MarshalError, TransitionError, TransitionResult, WaitError, WaitResult};
use super::message::{BreakpointNotify, BusMessage, CancelRequest, ErrorInfo, Uid};
use super::model::{ActionDefinition, Value};

/// Lifecycle status of an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Constructed but not yet executing
    Created,
    /// Executing
    Running,
    /// Stopped at a breakpoint
    Paused,
    /// Finished successfully (terminal)
    Ended,
    /// Finished with an error (terminal)
    Failed,
}

impl Status {
    /// Whether this status admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Ended | Status::Failed)
    }
}

/// Kind of work an invocation represents
///
/// A closed set, dispatched by pattern match: either a plain action backed
/// by a definition, or a composite gesture container, which has no
/// definition name on the wire and no parameters.
#[derive(Clone)]
pub enum InvocationKind {
    /// A plain action with a resolved definition
    Action(Arc<dyn ActionDefinition>),
    /// A composite gesture container
    Gesture,
}

impl InvocationKind {
    /// The definition backing this invocation, if it is a plain action
    pub fn definition(&self) -> Option<&Arc<dyn ActionDefinition>> {
        match self {
            InvocationKind::Action(def) => Some(def),
            InvocationKind::Gesture => None,
        }
    }

    /// Whether this is a composite gesture container
    pub fn is_composite(&self) -> bool {
        matches!(self, InvocationKind::Gesture)
    }
}

/// Where a stepped execution is paused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseLocation {
    /// Position of the pending sub-action within its container
    pub position: usize,
    /// Name of the pending sub-action, if known
    pub sub_action: Option<String>,
}

/// Observer of one invocation's lifecycle
///
/// Implementable by host-application code; the engine itself attaches
/// internal listeners for cache eviction, status broadcast, and completion
/// delivery.
pub trait InvocationListener: Send + Sync {
    /// The invocation entered `status`.
    fn on_status(&self, invocation: &Invocation, status: Status);

    /// The invocation recorded `error`. Always followed by
    /// `on_status(Failed)`.
    fn on_error(&self, _invocation: &Invocation, _error: &ErrorInfo) {}
}

struct InvocationState {
    status: Status,
    last_error: Option<ErrorInfo>,
    params: Vec<Option<Value>>,
    listeners: Vec<Arc<dyn InvocationListener>>,
    internal: Vec<Arc<dyn InvocationListener>>,
    pause: Option<PauseLocation>,
}

/// Runtime record of one action occurrence
pub struct Invocation {
    uid: Uid,
    kind: InvocationKind,
    parent: Option<Arc<Invocation>>,
    serial: Option<u64>,
    local: bool,
    stepped: bool,
    max_payload: usize,
    bus: Arc<dyn MessageBus>,
    state: Mutex<InvocationState>,
    cond: Condvar,
}

impl Invocation {
    /// Construct a new invocation in status CREATED
    ///
    /// When a parent is given, construction waits best-effort (bounded by
    /// `config.start_gate_wait`) for the parent to leave CREATED, so a child
    /// never observes a parent that has not started unless the parent is
    /// genuinely still starting. A paused parent has started and does not
    /// gate its children. The wait is not fatal.
    pub fn new(
        kind: InvocationKind,
        uid: Uid,
        parent: Option<Arc<Invocation>>,
        serial: Option<u64>,
        local: bool,
        stepped: bool,
        bus: Arc<dyn MessageBus>,
        config: &EngineConfig,
    ) -> Self {
        if let Some(parent) = &parent {
            if let Err(err) = parent.wait_until_started(config.start_gate_wait) {
                debug!(parent = %parent.uid(), child = %uid, %err, "parent still created at start gate");
            }
        }

        let num_params = kind.definition().map(|d| d.num_params()).unwrap_or(0);
        Self {
            uid,
            kind,
            parent,
            serial,
            local,
            stepped,
            max_payload: config.max_payload_bytes,
            bus,
            state: Mutex::new(InvocationState {
                status: Status::Created,
                last_error: None,
                params: vec![None; num_params],
                listeners: Vec::new(),
                internal: Vec::new(),
                pause: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Transaction identifier
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Kind of work this invocation represents
    pub fn kind(&self) -> &InvocationKind {
        &self.kind
    }

    /// Invocation that caused this one, if any
    pub fn parent(&self) -> Option<&Arc<Invocation>> {
        self.parent.as_ref()
    }

    /// Cross-process ordering number; present only for top-level invocations
    pub fn serial(&self) -> Option<u64> {
        self.serial
    }

    /// Whether this process executes the action
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Whether execution pauses at sub-action boundaries
    pub fn is_stepped(&self) -> bool {
        self.stepped
    }

    /// Current status
    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    /// Most recently recorded error
    pub fn last_error(&self) -> Option<ErrorInfo> {
        self.state.lock().last_error.clone()
    }

    /// Where the invocation is paused, if it is
    pub fn pause(&self) -> Option<PauseLocation> {
        self.state.lock().pause.clone()
    }

    /// Value bound at parameter position `index`
    pub fn param(&self, index: usize) -> Option<Value> {
        self.state.lock().params.get(index).cloned().flatten()
    }

    /// Bind a value at parameter position `index`
    pub fn set_param(&self, index: usize, value: Value) -> Result<(), MarshalError> {
        let mut state = self.state.lock();
        match state.params.get_mut(index) {
            Some(slot) => {
                *slot = Some(value);
                Ok(())
            }
            None => Err(MarshalError::Param {
                index,
                detail: "no such parameter position".to_string(),
            }),
        }
    }

    /// Output values, in declaration order; unbound outputs are `Null`
    pub fn outputs(&self) -> Vec<Value> {
        let num_inputs = self.kind.definition().map(|d| d.num_inputs()).unwrap_or(0);
        let state = self.state.lock();
        state.params[num_inputs..]
            .iter()
            .map(|slot| slot.clone().unwrap_or(Value::Null))
            .collect()
    }

    /// Register an external listener. Has no effect once the invocation is
    /// terminal: terminal invocations notify nobody.
    pub fn add_listener(&self, listener: Arc<dyn InvocationListener>) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        state.listeners.push(listener);
    }

    /// Remove a previously registered external listener. Removing a listener
    /// that is not registered is a no-op.
    pub fn remove_listener(&self, listener: &Arc<dyn InvocationListener>) {
        let mut state = self.state.lock();
        state.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Register an internal listener. Internal listeners are notified after
    /// external listeners for the same event, so engine bookkeeping observes
    /// a consistent post-notification world.
    pub(crate) fn add_internal_listener(&self, listener: Arc<dyn InvocationListener>) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        state.internal.push(listener);
    }

    #[cfg(test)]
    fn listener_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.listeners.len(), state.internal.len())
    }

    /// Transition to `status`. Legal only for invocations this process
    /// executes; remote proxies change status through echoed messages.
    pub fn set_status(&self, status: Status) -> TransitionResult<()> {
        if !self.local {
            return Err(TransitionError::NotOwner(self.uid));
        }
        self.update_status(status)
    }

    /// Record `error` and fail. Legal only for invocations this process
    /// executes.
    pub fn fail(&self, error: ErrorInfo) -> TransitionResult<()> {
        if !self.local {
            return Err(TransitionError::NotOwner(self.uid));
        }
        self.deliver_error(error)
    }

    /// Transition driver for both local transitions and remote echoes.
    pub(crate) fn update_status(&self, target: Status) -> TransitionResult<()> {
        self.transition(target, None)
    }

    /// Deliver a structured error, driving a transition to FAILED. Used for
    /// local failures and for echoed remote Error statuses.
    pub(crate) fn deliver_error(&self, error: ErrorInfo) -> TransitionResult<()> {
        self.transition(Status::Failed, Some(error))
    }

    fn transition(&self, target: Status, incoming: Option<ErrorInfo>) -> TransitionResult<()> {
        let mut state = self.state.lock();
        let current = state.status;

        if current.is_terminal() {
            if target == current {
                // Idempotent re-delivery of the same terminal status.
                return Ok(());
            }
            return Err(TransitionError::Illegal {
                from: current,
                to: target,
            });
        }
        if target == Status::Created && current != Status::Created {
            return Err(TransitionError::Illegal {
                from: current,
                to: target,
            });
        }

        // A jump straight from CREATED to a terminal status is promoted
        // through RUNNING, so listeners never observe a skipped start.
        let mut steps = if current == Status::Created && target.is_terminal() {
            vec![Status::Running, target]
        } else {
            vec![target]
        };

        let mut error = incoming;
        if steps.last() == Some(&Status::Ended) {
            let total = self.payload_size(&state)?;
            if total > self.max_payload {
                if let Some(last) = steps.last_mut() {
                    *last = Status::Failed;
                }
                error = Some(ErrorInfo::with_code(
                    "size-limit",
                    TransitionError::SizeLimit {
                        actual: total,
                        limit: self.max_payload,
                    }
                    .to_string(),
                ));
            }
        }
        if steps.last() == Some(&Status::Failed) && error.is_none() && state.last_error.is_none() {
            error = Some(ErrorInfo::new("execution failed"));
        }
        if let Some(error) = &error {
            state.last_error = Some(error.clone());
        }

        let mut guard = Some(state);
        for step in steps {
            let mut state = match guard.take() {
                Some(state) => state,
                None => {
                    // Re-acquire between promotion steps. If a racing
                    // transition reached a terminal status first, it won.
                    let state = self.state.lock();
                    if state.status.is_terminal() {
                        return Ok(());
                    }
                    state
                }
            };
            state.status = step;
            if step == Status::Running {
                state.pause = None;
            }
            let external = state.listeners.clone();
            let internal = state.internal.clone();
            let notify_error = if step == Status::Failed {
                state.last_error.clone()
            } else {
                None
            };
            if step.is_terminal() {
                state.listeners.clear();
                state.internal.clear();
            }
            drop(state);

            if let Some(err) = &notify_error {
                for listener in &external {
                    listener.on_error(self, err);
                }
                for listener in &internal {
                    listener.on_error(self, err);
                }
            }
            for listener in &external {
                listener.on_status(self, step);
            }
            for listener in &internal {
                listener.on_status(self, step);
            }
            self.cond.notify_all();
        }
        Ok(())
    }

    fn payload_size(&self, state: &InvocationState) -> Result<usize, MarshalError> {
        let Some(definition) = self.kind.definition() else {
            return Ok(0);
        };
        let mut total = 0;
        for (index, slot) in state.params.iter().enumerate() {
            if let Some(value) = slot {
                let param = definition.param_type(index);
                let wire = param.marshal(value).map_err(|err| MarshalError::Param {
                    index,
                    detail: err.to_string(),
                })?;
                total += param.wire_size(&wire);
            }
        }
        Ok(total)
    }

    /// Marshal the bound input values to wire form. Unbound inputs marshal
    /// to the empty string.
    pub(crate) fn marshaled_inputs(&self) -> Result<Vec<String>, MarshalError> {
        self.marshaled_range(0, self.kind.definition().map(|d| d.num_inputs()).unwrap_or(0))
    }

    /// Marshal the bound output values to wire form.
    pub(crate) fn marshaled_outputs(&self) -> Result<Vec<String>, MarshalError> {
        let (from, to) = match self.kind.definition() {
            Some(def) => (def.num_inputs(), def.num_params()),
            None => (0, 0),
        };
        self.marshaled_range(from, to)
    }

    fn marshaled_range(&self, from: usize, to: usize) -> Result<Vec<String>, MarshalError> {
        let Some(definition) = self.kind.definition() else {
            return Ok(Vec::new());
        };
        let state = self.state.lock();
        let mut wires = Vec::with_capacity(to - from);
        for index in from..to {
            match &state.params[index] {
                Some(value) => {
                    let wire = definition
                        .param_type(index)
                        .marshal(value)
                        .map_err(|err| MarshalError::Param {
                            index,
                            detail: err.to_string(),
                        })?;
                    wires.push(wire);
                }
                None => wires.push(String::new()),
            }
        }
        Ok(wires)
    }

    /// Block while the invocation is CREATED or PAUSED, or until `timeout`
    /// elapses. Returns as soon as it is running or terminal: stepped
    /// executors use this to park at a breakpoint until a step command
    /// arrives.
    pub fn wait_until_running(&self, timeout: Duration) -> WaitResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while matches!(state.status, Status::Created | Status::Paused) {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                if !matches!(state.status, Status::Created | Status::Paused) {
                    return Ok(());
                }
                return Err(WaitError::StatusTimeout {
                    uid: self.uid,
                    status: state.status,
                    timeout,
                });
            }
        }
        Ok(())
    }

    /// Block while the invocation is still CREATED, or until `timeout`
    /// elapses. This is the parent start-gate: a paused parent has already
    /// started and must not delay its children.
    pub(crate) fn wait_until_started(&self, timeout: Duration) -> WaitResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.status == Status::Created {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                if state.status != Status::Created {
                    return Ok(());
                }
                return Err(WaitError::StatusTimeout {
                    uid: self.uid,
                    status: Status::Created,
                    timeout,
                });
            }
        }
        Ok(())
    }

    /// Block until the invocation reaches a terminal status; returns it
    pub fn wait_until_finished(&self) -> Status {
        let mut state = self.state.lock();
        while !state.status.is_terminal() {
            self.cond.wait(&mut state);
        }
        state.status
    }

    /// Request cancellation of a running or paused invocation
    ///
    /// Fire-and-forget: publishes one `CancelRequest` and returns whether
    /// the publish succeeded, not whether cancellation took effect. There is
    /// no retry and no acknowledgment; a lost cancel is a valid outcome.
    pub fn cancel(&self) -> TransitionResult<bool> {
        let status = self.status();
        if !matches!(status, Status::Running | Status::Paused) {
            return Err(TransitionError::NotCancelable(status));
        }
        let request = CancelRequest {
            uid: self.uid,
            sender: self.bus.client_id(),
        };
        match self.bus.send(BusMessage::Cancel(request)) {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(uid = %self.uid, %err, "cancel publish failed");
                Ok(false)
            }
        }
    }

    /// Pause a stepped local execution at a sub-action boundary and notify
    /// the bus. No-op for free-running executions. The executor should then
    /// block in [`wait_until_running`](Self::wait_until_running) until a
    /// step command resumes it.
    pub fn report_breakpoint(
        &self,
        position: usize,
        sub_action: Option<String>,
    ) -> TransitionResult<()> {
        if !self.local {
            return Err(TransitionError::NotOwner(self.uid));
        }
        if !self.stepped {
            debug!(uid = %self.uid, "breakpoint reported on free-running execution, ignoring");
            return Ok(());
        }
        self.record_pause(PauseLocation {
            position,
            sub_action: sub_action.clone(),
        })?;
        let notify = BreakpointNotify {
            uid: self.uid,
            position,
            sub_action,
            sender: self.bus.client_id(),
        };
        if let Err(err) = self.bus.send(BusMessage::BreakpointNotify(notify)) {
            warn!(uid = %self.uid, %err, "breakpoint publish failed");
        }
        Ok(())
    }

    /// Record a pause location and transition to PAUSED. Used locally by
    /// [`report_breakpoint`](Self::report_breakpoint) and by the
    /// reconstructor for remote breakpoint notifications.
    pub(crate) fn record_pause(&self, location: PauseLocation) -> TransitionResult<()> {
        {
            let mut state = self.state.lock();
            state.pause = Some(location);
        }
        self.update_status(Status::Paused)
    }
}
