//! Remote status reconstructor
//!
//! Consumes the broadcast execution-status stream and maintains local proxy
//! invocations for actions executed elsewhere. All processing happens on
//! exactly one worker thread draining an ordered channel: this single
//! consumer is what guarantees that a Start is fully processed before any
//! later status for the same (or a causally later) uid, without any
//! sequence numbers on the wire.
//!
//! The bus handler does only two things synchronously: discard self-sent
//! messages, and register the watch intent for Start messages before they
//! are queued, so a concurrent child dispatch can never race ahead of its
//! parent's registration.

use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::EngineConfig;
use super::bus::{BusHandler, MessageBus};
use super::cache::InvocationCache;
use super::error::{EngineError, MarshalError};
use super::invocation::{Invocation, InvocationKind, PauseLocation, Status};
use super::message::{
    BreakpointNotify, BreakpointResponse, BusMessage, ErrorInfo, ErrorStatus, IgnoredStatus,
    MessageKind, StartStatus, StepCommand, SuccessStatus, Uid,
};
use super::model::ActionModel;

enum WorkerEvent {
    Apply(BusMessage),
    Shutdown,
}

struct ReconstructorState {
    bus: Arc<dyn MessageBus>,
    model: Arc<dyn ActionModel>,
    cache: Arc<InvocationCache>,
    config: EngineConfig,
}

/// Rebuilds invocation state from the out-of-order status broadcast stream
pub struct StatusReconstructor {
    state: Arc<ReconstructorState>,
    tx: Sender<WorkerEvent>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl StatusReconstructor {
    /// Create the reconstructor and start its sequential worker thread
    pub fn new(
        bus: Arc<dyn MessageBus>,
        model: Arc<dyn ActionModel>,
        cache: Arc<InvocationCache>,
        config: EngineConfig,
    ) -> Self {
        let state = Arc::new(ReconstructorState {
            bus,
            model,
            cache,
            config,
        });
        let (tx, rx) = unbounded();
        let worker_state = state.clone();
        let worker = std::thread::Builder::new()
            .name("status-worker".to_string())
            .spawn(move || run_worker(worker_state, rx))
            .ok();
        if worker.is_none() {
            warn!("could not spawn status worker");
        }
        Self {
            state,
            tx,
            worker: Mutex::new(worker),
        }
    }

    /// Subscribe to the full execution-status stream on the bus
    pub fn subscribe(&self) {
        self.state.bus.subscribe(
            &MessageKind::STATUS,
            Arc::new(StatusSubscription {
                state: self.state.clone(),
                tx: self.tx.clone(),
            }),
        );
    }

    /// Accept one status message: discard self-sent, register the watch
    /// intent for Start, and queue it for the sequential worker.
    pub fn offer(&self, message: BusMessage) {
        offer(&self.state, &self.tx, message);
    }

    /// Process one status message on the calling thread
    ///
    /// Normally invoked only by the status worker; the caller must preserve
    /// per-uid Start-first ordering.
    pub fn apply(&self, message: BusMessage) {
        self.state.apply(message);
    }

    /// Stop the worker thread. Idempotent; queued messages drain first.
    pub fn shutdown(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = self.tx.send(WorkerEvent::Shutdown);
            if worker.join().is_err() {
                warn!("status worker terminated abnormally");
            }
        }
    }
}

struct StatusSubscription {
    state: Arc<ReconstructorState>,
    tx: Sender<WorkerEvent>,
}

impl BusHandler for StatusSubscription {
    fn on_message(&self, message: BusMessage) {
        offer(&self.state, &self.tx, message);
    }
}

fn offer(state: &Arc<ReconstructorState>, tx: &Sender<WorkerEvent>, message: BusMessage) {
    if message.sender() == state.bus.client_id() {
        return;
    }
    // Watch registration must precede any asynchronous processing of the
    // Start, so child dispatches referencing this uid as parent block until
    // the proxy is added.
    if let BusMessage::Start(start) = &message {
        state.cache.watch_for(&start.uid);
    }
    if tx.send(WorkerEvent::Apply(message)).is_err() {
        warn!("status worker is gone; dropping status message");
    }
}

fn run_worker(state: Arc<ReconstructorState>, rx: Receiver<WorkerEvent>) {
    while let Ok(event) = rx.recv() {
        match event {
            WorkerEvent::Apply(message) => state.apply(message),
            WorkerEvent::Shutdown => break,
        }
    }
}

impl ReconstructorState {
    fn apply(&self, message: BusMessage) {
        match message {
            BusMessage::Start(start) => {
                let uid = start.uid;
                let result = self.handle_start(start);
                // end_watch must be reached exactly once per Start message,
                // error paths included, or parent_ready blocks forever.
                self.cache.end_watch(&uid);
                if let Err(err) = result {
                    warn!(%uid, %err, "start status processing failed");
                }
            }
            BusMessage::Success(success) => {
                let uid = success.uid;
                if let Err(err) = self.handle_success(success) {
                    warn!(%uid, %err, "success status processing failed");
                }
                self.cache.end_watch(&uid);
            }
            BusMessage::Error(error) => {
                let uid = error.uid;
                if let Err(err) = self.handle_error(error) {
                    warn!(%uid, %err, "error status processing failed");
                }
                self.cache.end_watch(&uid);
            }
            BusMessage::Ignored(ignored) => {
                let uid = ignored.uid;
                if let Err(err) = self.handle_ignored(ignored) {
                    warn!(%uid, %err, "ignored status processing failed");
                }
                self.cache.end_watch(&uid);
            }
            BusMessage::BreakpointNotify(notify) => self.handle_breakpoint(notify),
            other => debug!(kind = ?other.kind(), "unexpected message kind at reconstructor"),
        }
    }

    fn handle_start(&self, start: StartStatus) -> Result<(), EngineError> {
        if let Ok(existing) = self.cache.get(&start.uid, Duration::ZERO) {
            // This process already holds the invocation (it is the claimer,
            // or the original requester); just echo the transition.
            existing.update_status(Status::Running)?;
            return Ok(());
        }

        let parent = match &start.parent_uid {
            Some(parent_uid) => match self.cache.get(parent_uid, self.config.base_wait) {
                Ok(parent) => Some(parent),
                Err(err) => {
                    warn!(uid = %start.uid, parent = %parent_uid, %err, "parent not resolved for remote start, proceeding without");
                    None
                }
            },
            None => None,
        };

        let kind = match &start.action {
            Some(name) => match self.model.lookup(name) {
                Some(definition) => InvocationKind::Action(definition),
                None => return Err(EngineError::UnknownAction(name.clone())),
            },
            // No action name on the wire denotes a composite gesture
            // container.
            None => InvocationKind::Gesture,
        };

        let invocation = Arc::new(Invocation::new(
            kind,
            start.uid,
            parent,
            start.serial,
            false,
            start.stepped,
            self.bus.clone(),
            &self.config,
        ));
        if let InvocationKind::Action(definition) = invocation.kind() {
            if start.inputs.len() != definition.num_inputs() {
                return Err(MarshalError::Arity {
                    expected: definition.num_inputs(),
                    actual: start.inputs.len(),
                }
                .into());
            }
            for (index, wire) in start.inputs.iter().enumerate() {
                let value = definition
                    .param_type(index)
                    .unmarshal(wire)
                    .map_err(|err| MarshalError::Param {
                        index,
                        detail: err.to_string(),
                    })?;
                invocation
                    .set_param(index, value)
                    .map_err(EngineError::Marshal)?;
            }
        }

        self.cache.add(invocation.clone());
        invocation.update_status(Status::Running)?;
        Ok(())
    }

    fn handle_success(&self, success: SuccessStatus) -> Result<(), EngineError> {
        let invocation = match self.fetch(&success.uid) {
            Some(invocation) => invocation,
            None => return Ok(()),
        };

        if let InvocationKind::Action(definition) = invocation.kind() {
            let num_inputs = definition.num_inputs();
            let num_outputs = definition.num_params() - num_inputs;
            if success.outputs.len() != num_outputs {
                let error = MarshalError::Arity {
                    expected: num_outputs,
                    actual: success.outputs.len(),
                };
                invocation.deliver_error(marshal_failure(&error))?;
                return Ok(());
            }
            for (offset, wire) in success.outputs.iter().enumerate() {
                let index = num_inputs + offset;
                match definition.param_type(index).unmarshal(wire) {
                    Ok(value) => invocation
                        .set_param(index, value)
                        .map_err(EngineError::Marshal)?,
                    Err(err) => {
                        // An output that cannot be bound fails the proxy
                        // rather than half-ending it.
                        let error = MarshalError::Param {
                            index,
                            detail: err.to_string(),
                        };
                        invocation.deliver_error(marshal_failure(&error))?;
                        return Ok(());
                    }
                }
            }
        }

        invocation.update_status(Status::Ended)?;
        Ok(())
    }

    fn handle_error(&self, error: ErrorStatus) -> Result<(), EngineError> {
        let invocation = match self.fetch(&error.uid) {
            Some(invocation) => invocation,
            None => return Ok(()),
        };
        invocation.deliver_error(error.error)?;
        Ok(())
    }

    fn handle_ignored(&self, ignored: IgnoredStatus) -> Result<(), EngineError> {
        let invocation = match self.fetch(&ignored.uid) {
            Some(invocation) => invocation,
            None => return Ok(()),
        };
        warn!(uid = %ignored.uid, "nobody executed the request; forcing the invocation to end");
        invocation.update_status(Status::Ended)?;
        Ok(())
    }

    fn handle_breakpoint(&self, notify: BreakpointNotify) {
        let invocation = match self.cache.get(&notify.uid, Duration::ZERO) {
            Ok(invocation) if !invocation.kind().is_composite() => invocation,
            // Unknown invocation, or a composite gesture boundary: stepping
            // into composites is unsupported, answer with step-over.
            _ => {
                let reply = BreakpointResponse {
                    uid: notify.uid,
                    command: StepCommand::Over,
                    sender: self.bus.client_id(),
                };
                if let Err(err) = self.bus.send(BusMessage::BreakpointResponse(reply)) {
                    warn!(uid = %notify.uid, %err, "step-over reply publish failed");
                }
                return;
            }
        };
        let location = PauseLocation {
            position: notify.position,
            sub_action: notify.sub_action,
        };
        if let Err(err) = invocation.record_pause(location) {
            warn!(uid = %notify.uid, %err, "breakpoint raced a terminal transition");
        }
    }

    // Fetch with the extended status timeout: success/error statuses may
    // depend on a chain of prior work. A miss is logged as a likely leak and
    // abandoned.
    fn fetch(&self, uid: &Uid) -> Option<Arc<Invocation>> {
        match self.cache.get(uid, self.config.status_wait()) {
            Ok(invocation) => Some(invocation),
            Err(err) => {
                warn!(%uid, %err, "status for unknown invocation; a proxy may have leaked");
                None
            }
        }
    }
}

fn marshal_failure(error: &MarshalError) -> ErrorInfo {
    ErrorInfo::with_code("marshal", error.to_string())
}
