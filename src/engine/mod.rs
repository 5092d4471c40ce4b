//! Distributed action-invocation engine
//!
//! One engine instance per process. It owns the invocation cache, consumes
//! inbound execution requests through the [`dispatcher`], reconstructs the
//! state of remotely executed invocations through the [`reconstructor`], and
//! offers hosts three ways in: fire-and-observe ([`Engine::start_action`]),
//! callback-driven ([`Engine::execute`]), and blocking
//! ([`Engine::run_action`]).
//!
//! The engine does not own a transport. A host supplies a [`bus::MessageBus`]
//! and an [`model::ActionModel`]; everything else is wired up here.

pub mod broadcast;
pub mod bus;
pub mod cache;
pub mod continuation;
pub mod dispatcher;
pub mod error;
pub mod invocation;
pub mod message;
pub mod model;
pub mod reconstructor;

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use self::broadcast::StatusBroadcaster;
use self::bus::MessageBus;
use self::cache::InvocationCache;
use self::continuation::{Callback, CancelScope, Cancelable, Continuation, blocking_pair};
use self::dispatcher::RequestDispatcher;
use self::error::{EngineError, MarshalError, Result};
use self::invocation::{Invocation, InvocationKind, InvocationListener, Status};
use self::message::{BusMessage, ClientId, ErrorInfo, ExecuteRequest};
use self::model::{ActionExecutor, ActionModel, Value};
use self::reconstructor::StatusReconstructor;

/// Tunable timeouts and limits for one engine instance
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Combined marshaled-parameter size above which a successful completion
    /// is turned into a failure
    pub max_payload_bytes: usize,
    /// Base timeout for cache lookups and request gathering
    pub base_wait: Duration,
    /// How long a child construction waits for its parent to leave CREATED
    pub start_gate_wait: Duration,
    /// Watch-map size above which the cache logs a leak warning
    pub watch_warning_threshold: usize,
    /// Bootstrap peer identity whose requests this process drops, if any
    pub bootstrap_client: Option<ClientId>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1 << 20,
            base_wait: Duration::from_secs(5),
            start_gate_wait: Duration::from_secs(2),
            watch_warning_threshold: 1024,
            bootstrap_client: None,
        }
    }
}

impl EngineConfig {
    /// Timeout for resolving the subject of a success or error status.
    /// Longer than [`base_wait`](Self::base_wait): these statuses may trail a
    /// chain of prior work.
    pub fn status_wait(&self) -> Duration {
        self.base_wait * 2
    }
}

enum LaunchPlan {
    Local(Arc<dyn ActionExecutor>),
    Remote,
}

/// Per-process engine instance
pub struct Engine {
    bus: Arc<dyn MessageBus>,
    model: Arc<dyn ActionModel>,
    cache: Arc<InvocationCache>,
    config: EngineConfig,
    serials: AtomicU64,
    reconstructor: StatusReconstructor,
}

impl Engine {
    /// Wire up an engine over the given bus and action model and subscribe
    /// its consumers
    pub fn new(
        bus: Arc<dyn MessageBus>,
        model: Arc<dyn ActionModel>,
        config: EngineConfig,
    ) -> Self {
        let cache = InvocationCache::new(config.watch_warning_threshold);
        let dispatcher =
            RequestDispatcher::new(bus.clone(), model.clone(), cache.clone(), config.clone());
        dispatcher.subscribe();
        let reconstructor =
            StatusReconstructor::new(bus.clone(), model.clone(), cache.clone(), config.clone());
        reconstructor.subscribe();
        Self {
            bus,
            model,
            cache,
            config,
            serials: AtomicU64::new(0),
            reconstructor,
        }
    }

    /// The invocation cache of this process
    pub fn cache(&self) -> &Arc<InvocationCache> {
        &self.cache
    }

    /// The bus this engine communicates over
    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// The status reconstructor of this process
    pub fn reconstructor(&self) -> &StatusReconstructor {
        &self.reconstructor
    }

    /// Start an action and return its invocation immediately
    ///
    /// The invocation is registered in the cache and execution proceeds
    /// asynchronously: locally on a worker thread when this process has an
    /// executor for the action, otherwise by publishing an execution request
    /// for some other process to claim. Observe progress through listeners or
    /// the blocking wait helpers on the returned invocation.
    pub fn start_action(
        &self,
        name: &str,
        inputs: Vec<Value>,
        parent: Option<Arc<Invocation>>,
    ) -> Result<Arc<Invocation>> {
        let (invocation, plan) = self.prepare(name, inputs, parent, false)?;
        self.launch(invocation.clone(), plan);
        Ok(invocation)
    }

    /// Start an action in stepped mode: execution pauses at sub-action
    /// boundaries and waits for step commands
    pub fn start_stepped(
        &self,
        name: &str,
        inputs: Vec<Value>,
        parent: Option<Arc<Invocation>>,
    ) -> Result<Arc<Invocation>> {
        let (invocation, plan) = self.prepare(name, inputs, parent, true)?;
        self.launch(invocation.clone(), plan);
        Ok(invocation)
    }

    /// Start an action and deliver its outcome to `callback`
    ///
    /// The callback receives the output values on success or the recorded
    /// error on failure, exactly once. The returned scope cancels the
    /// invocation and suppresses delivery.
    pub fn execute(
        &self,
        name: &str,
        inputs: Vec<Value>,
        parent: Option<Arc<Invocation>>,
        callback: Box<dyn Callback<Vec<Value>>>,
    ) -> Result<CancelScope> {
        let (invocation, plan) = self.prepare(name, inputs, parent, false)?;
        let continuation = Continuation::new(callback, Ok);
        Ok(self.attach_and_launch(&invocation, plan, continuation))
    }

    /// Start an action and block until it finishes or `timeout` elapses
    ///
    /// On timeout a claimed invocation is cancelled best-effort; one that
    /// was never claimed is failed locally so it does not linger in the
    /// cache. The timeout error is returned either way.
    pub fn run_action(
        &self,
        name: &str,
        inputs: Vec<Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        let (invocation, plan) = self.prepare(name, inputs, None, false)?;
        let (callback, waiter) = blocking_pair::<Vec<Value>>(invocation.uid());
        let callback: Box<dyn Callback<Vec<Value>>> = callback;
        let continuation = Continuation::new(callback, Ok);
        let scope = self.attach_and_launch(&invocation, plan, continuation);

        match waiter.wait(timeout) {
            Ok(Ok(outputs)) => Ok(outputs),
            Ok(Err(error)) => Err(EngineError::Action(error)),
            Err(err) => {
                scope.cancel();
                // Cancel only reaches a claimed execution. An unclaimed
                // request is still CREATED and has no remote party to report
                // an outcome, so fail the record here or it stays cached.
                if invocation.status() == Status::Created {
                    let error = ErrorInfo::from(&EngineError::Wait(err.clone()));
                    if let Err(err) = invocation.deliver_error(error) {
                        debug!(uid = %invocation.uid(), %err, "timed-out record already transitioned");
                    }
                }
                Err(EngineError::Wait(err))
            }
        }
    }

    /// Stop the background consumers. Queued status messages drain first.
    pub fn shutdown(&self) {
        self.reconstructor.shutdown();
    }

    fn prepare(
        &self,
        name: &str,
        inputs: Vec<Value>,
        parent: Option<Arc<Invocation>>,
        stepped: bool,
    ) -> Result<(Arc<Invocation>, LaunchPlan)> {
        let definition = self
            .model
            .lookup(name)
            .ok_or_else(|| EngineError::UnknownAction(name.to_string()))?;
        if inputs.len() != definition.num_inputs() {
            return Err(MarshalError::Arity {
                expected: definition.num_inputs(),
                actual: inputs.len(),
            }
            .into());
        }

        let uid = self.bus.next_uid();
        // Only top-level invocations carry a serial; children order under
        // their parent.
        let serial = match parent {
            None => Some(self.serials.fetch_add(1, Ordering::Relaxed) + 1),
            Some(_) => None,
        };
        let plan = match definition.local_executor() {
            Some(executor) => LaunchPlan::Local(executor),
            None => LaunchPlan::Remote,
        };
        let local = matches!(plan, LaunchPlan::Local(_));

        let invocation = Arc::new(Invocation::new(
            InvocationKind::Action(definition),
            uid,
            parent,
            serial,
            local,
            stepped,
            self.bus.clone(),
            &self.config,
        ));
        for (index, value) in inputs.into_iter().enumerate() {
            invocation
                .set_param(index, value)
                .map_err(EngineError::Marshal)?;
        }
        if local {
            // Remote claimers broadcast their own lifecycle; only local
            // executions mirror onto the bus from here.
            invocation.add_internal_listener(Arc::new(StatusBroadcaster::new(self.bus.clone())));
        }
        self.cache.add(invocation.clone());
        Ok((invocation, plan))
    }

    fn attach_and_launch(
        &self,
        invocation: &Arc<Invocation>,
        plan: LaunchPlan,
        continuation: Continuation<Vec<Value>, Vec<Value>>,
    ) -> CancelScope {
        let scope = continuation.scope();
        // The completion listener must be in place before execution can
        // start, or a fast completion slips past the callback.
        invocation.add_internal_listener(Arc::new(CompletionListener {
            callback: Mutex::new(Some(Box::new(continuation))),
        }));
        scope.register(Arc::new(InvocationCancel(invocation.clone())));
        self.launch(invocation.clone(), plan);
        scope
    }

    fn launch(&self, invocation: Arc<Invocation>, plan: LaunchPlan) {
        match plan {
            LaunchPlan::Local(executor) => {
                let name = format!("exec-{}", invocation.uid());
                let spawned = std::thread::Builder::new().name(name).spawn(move || {
                    if let Err(err) = invocation.update_status(Status::Running) {
                        warn!(uid = %invocation.uid(), %err, "invocation did not start");
                        return;
                    }
                    match executor.execute(&invocation) {
                        Ok(()) => {
                            if !invocation.status().is_terminal() {
                                if let Err(err) = invocation.update_status(Status::Ended) {
                                    warn!(uid = %invocation.uid(), %err, "completion raced a terminal transition");
                                }
                            }
                        }
                        Err(error) => {
                            if let Err(err) = invocation.deliver_error(error) {
                                warn!(uid = %invocation.uid(), %err, "executor failure could not be recorded");
                            }
                        }
                    }
                });
                if let Err(err) = spawned {
                    warn!(%err, "could not spawn execution worker");
                }
            }
            LaunchPlan::Remote => {
                let inputs = match invocation.marshaled_inputs() {
                    Ok(inputs) => inputs,
                    Err(err) => {
                        warn!(uid = %invocation.uid(), %err, "inputs did not marshal; request not published");
                        if let Err(err) =
                            invocation.deliver_error(ErrorInfo::with_code("marshal", err.to_string()))
                        {
                            warn!(uid = %invocation.uid(), %err, "marshal failure could not be recorded");
                        }
                        return;
                    }
                };
                let action = invocation
                    .kind()
                    .definition()
                    .map(|d| d.name().to_string())
                    .unwrap_or_default();
                let request = ExecuteRequest {
                    uid: invocation.uid(),
                    parent_uid: invocation.parent().map(|p| p.uid()),
                    action,
                    inputs,
                    stepped: invocation.is_stepped(),
                    sender: self.bus.client_id(),
                };
                let bus = self.bus.clone();
                let wait = self.config.base_wait;
                let name = format!("claim-{}", invocation.uid());
                // Gather runs on its own thread: replies are informational
                // only, the outcome arrives through the status stream.
                let spawned = std::thread::Builder::new().name(name).spawn(move || {
                    match bus.gather(BusMessage::Execute(request), wait) {
                        Ok(replies) => {
                            let declines = replies
                                .iter()
                                .filter(|m| matches!(m, BusMessage::RequestIgnored(_)))
                                .count();
                            debug!(uid = %invocation.uid(), replies = replies.len(), declines, "execution request gathered");
                        }
                        Err(err) => {
                            warn!(uid = %invocation.uid(), %err, "execution request gather failed");
                        }
                    }
                });
                if let Err(err) = spawned {
                    warn!(%err, "could not spawn claim worker");
                }
            }
        }
    }
}

// One-shot bridge from invocation completion to a callback chain.
struct CompletionListener {
    callback: Mutex<Option<Box<dyn Callback<Vec<Value>>>>>,
}

impl InvocationListener for CompletionListener {
    fn on_status(&self, invocation: &Invocation, status: Status) {
        if !status.is_terminal() {
            return;
        }
        let Some(callback) = self.callback.lock().take() else {
            return;
        };
        match status {
            Status::Ended => callback.on_result(invocation.outputs()),
            _ => callback.on_error(
                invocation
                    .last_error()
                    .unwrap_or_else(|| ErrorInfo::new("execution failed")),
            ),
        }
    }
}

struct InvocationCancel(Arc<Invocation>);

impl Cancelable for InvocationCancel {
    fn cancel(&self) {
        if let Err(err) = self.0.cancel() {
            debug!(uid = %self.0.uid(), %err, "cancel skipped");
        }
    }
}
