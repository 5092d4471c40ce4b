//! Execution request dispatcher
//!
//! Consumes inbound execution requests and either claims them (this process
//! has a local executor for the action), declines them with a
//! `RequestIgnored` reply, or drops them (self-sent, or originating from the
//! bootstrap identity). Each request runs on its own named worker thread so
//! unrelated requests never block each other. Nothing escapes a worker:
//! every failure is converted into an outbound `ErrorStatus`.
//!
//! Cancellation requests and breakpoint step commands are the other two
//! inbound request types handled here; both are cheap zero-wait lookups.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::EngineConfig;
use super::broadcast::StatusBroadcaster;
use super::bus::{BusHandler, MessageBus};
use super::cache::InvocationCache;
use super::error::{DispatchError, EngineError, MarshalError};
use super::invocation::{Invocation, InvocationKind, Status};
use super::message::{
    BreakpointResponse, BusMessage, CancelRequest, ErrorInfo, ErrorStatus, ExecuteRequest,
    MessageKind, RequestIgnored,
};
use super::model::{ActionDefinition, ActionExecutor, ActionModel};

/// Consumer of inbound execution, cancellation, and step-command requests
#[derive(Clone)]
pub struct RequestDispatcher {
    bus: Arc<dyn MessageBus>,
    model: Arc<dyn ActionModel>,
    cache: Arc<InvocationCache>,
    config: EngineConfig,
}

impl RequestDispatcher {
    /// Create a dispatcher over the given collaborators
    pub fn new(
        bus: Arc<dyn MessageBus>,
        model: Arc<dyn ActionModel>,
        cache: Arc<InvocationCache>,
        config: EngineConfig,
    ) -> Self {
        Self {
            bus,
            model,
            cache,
            config,
        }
    }

    /// Subscribe to the inbound request kinds on the bus
    pub fn subscribe(&self) {
        self.bus.subscribe(
            &[
                MessageKind::Execute,
                MessageKind::Cancel,
                MessageKind::BreakpointResponse,
            ],
            Arc::new(self.clone()),
        );
    }

    /// Handle one execution request to completion
    ///
    /// This is the worker entry point; `on_message` runs it on a fresh
    /// thread per request. It never returns an error: failures become an
    /// outbound `ErrorStatus`.
    pub fn process(&self, request: ExecuteRequest) {
        if request.sender == self.bus.client_id() {
            return;
        }
        // Requests whose uid originates from the bootstrap identity are
        // dropped outright; this breaks the mutual-gather deadlock between
        // the two bootstrap peer roles.
        if let Some(bootstrap) = self.config.bootstrap_client {
            if request.uid.originator == bootstrap {
                debug!(uid = %request.uid, "dropping request from bootstrap identity");
                return;
            }
        }

        let Some(definition) = self.model.lookup(&request.action) else {
            self.decline(&request, DispatchError::UnknownAction(request.action.clone()));
            return;
        };
        let Some(executor) = definition.local_executor() else {
            self.decline(
                &request,
                DispatchError::NoLocalExecutor(request.action.clone()),
            );
            return;
        };
        if definition.is_learning_engine(&executor) {
            self.decline(
                &request,
                DispatchError::LearningEngine(request.action.clone()),
            );
            return;
        }

        if let Err(err) = self.execute(&request, definition, executor) {
            warn!(uid = %request.uid, action = %request.action, %err, "claimed request failed");
            let error = ErrorInfo::from(&err);
            // If the invocation made it into the cache, fail it so it is
            // evicted and local observers see the outcome.
            if let Ok(invocation) = self.cache.get(&request.uid, Duration::ZERO) {
                if let Err(err) = invocation.deliver_error(error.clone()) {
                    warn!(uid = %request.uid, %err, "could not fail claimed invocation");
                }
            }
            let status = ErrorStatus {
                uid: request.uid,
                error,
                sender: self.bus.client_id(),
            };
            if let Err(err) = self.bus.send(BusMessage::Error(status)) {
                warn!(uid = %request.uid, %err, "error status publish failed");
            }
        }
    }

    fn decline(&self, request: &ExecuteRequest, reason: DispatchError) {
        debug!(uid = %request.uid, %reason, "declining execution request");
        let reply = RequestIgnored {
            uid: request.uid,
            sender: self.bus.client_id(),
        };
        if let Err(err) = self.bus.send(BusMessage::RequestIgnored(reply)) {
            warn!(uid = %request.uid, %err, "decline publish failed");
        }
    }

    fn execute(
        &self,
        request: &ExecuteRequest,
        definition: Arc<dyn ActionDefinition>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Result<(), EngineError> {
        let parent = match &request.parent_uid {
            Some(parent_uid) => {
                // Serialize behind the parent's in-flight registration, then
                // resolve it. A timeout means "no parent", never a failure.
                if let Err(err) = self.cache.parent_ready(parent_uid, self.config.base_wait) {
                    warn!(uid = %request.uid, parent = %parent_uid, %err, "parent registration wait expired");
                }
                match self.cache.get(parent_uid, self.config.base_wait) {
                    Ok(parent) => Some(parent),
                    Err(err) => {
                        warn!(uid = %request.uid, parent = %parent_uid, %err, "parent not resolved, proceeding without");
                        None
                    }
                }
            }
            None => None,
        };

        if request.inputs.len() != definition.num_inputs() {
            return Err(MarshalError::Arity {
                expected: definition.num_inputs(),
                actual: request.inputs.len(),
            }
            .into());
        }

        let invocation = Arc::new(Invocation::new(
            InvocationKind::Action(definition.clone()),
            request.uid,
            parent,
            None,
            true,
            request.stepped,
            self.bus.clone(),
            &self.config,
        ));
        for (index, wire) in request.inputs.iter().enumerate() {
            let value = definition
                .param_type(index)
                .unmarshal(wire)
                .map_err(|err| MarshalError::Param {
                    index,
                    detail: err.to_string(),
                })?;
            invocation.set_param(index, value).map_err(EngineError::Marshal)?;
        }

        invocation.add_internal_listener(Arc::new(StatusBroadcaster::new(self.bus.clone())));
        self.cache.add(invocation.clone());
        invocation.update_status(Status::Running)?;

        match executor.execute(&invocation) {
            Ok(()) => {
                if !invocation.status().is_terminal() {
                    invocation.update_status(Status::Ended)?;
                }
            }
            Err(error) => {
                if let Err(err) = invocation.deliver_error(error) {
                    warn!(uid = %request.uid, %err, "executor failure could not be recorded");
                }
            }
        }
        Ok(())
    }

    /// Handle a cancellation request: a live, local, active invocation is
    /// failed with a `cancelled` error. Anything else is ignored; cancel has
    /// no delivery guarantee.
    pub fn process_cancel(&self, request: CancelRequest) {
        match self.cache.get(&request.uid, Duration::ZERO) {
            Ok(invocation)
                if invocation.is_local()
                    && matches!(invocation.status(), Status::Running | Status::Paused) =>
            {
                info!(uid = %request.uid, "cancelling execution");
                if let Err(err) = invocation.deliver_error(ErrorInfo::cancelled()) {
                    warn!(uid = %request.uid, %err, "cancellation raced a terminal transition");
                }
            }
            _ => debug!(uid = %request.uid, "cancel for unknown or inactive invocation, ignoring"),
        }
    }

    /// Handle a breakpoint step command: a live, local, paused invocation
    /// resumes. Step-into is unsupported and treated as step-over.
    pub fn process_step(&self, response: BreakpointResponse) {
        match self.cache.get(&response.uid, Duration::ZERO) {
            Ok(invocation)
                if invocation.is_local() && invocation.status() == Status::Paused =>
            {
                debug!(uid = %response.uid, command = ?response.command, "resuming paused execution");
                if let Err(err) = invocation.update_status(Status::Running) {
                    warn!(uid = %response.uid, %err, "step command raced a terminal transition");
                }
            }
            _ => debug!(uid = %response.uid, "step command for unknown or unpaused invocation"),
        }
    }
}

impl BusHandler for RequestDispatcher {
    fn on_message(&self, message: BusMessage) {
        match message {
            BusMessage::Execute(request) => {
                if request.sender == self.bus.client_id() {
                    return;
                }
                let worker = self.clone();
                let name = format!("exec-{}", request.uid);
                let spawned = std::thread::Builder::new()
                    .name(name)
                    .spawn(move || worker.process(request));
                if let Err(err) = spawned {
                    warn!(%err, "could not spawn execution worker");
                }
            }
            BusMessage::Cancel(request) => self.process_cancel(request),
            BusMessage::BreakpointResponse(response) => self.process_step(response),
            other => debug!(kind = ?other.kind(), "unexpected message kind at dispatcher"),
        }
    }
}
