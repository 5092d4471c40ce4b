//! Shared test fixtures: an in-memory bus fabric and stub executors.

#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use conductor::engine::bus::{BusError, BusHandler, MessageBus};
use conductor::engine::invocation::{Invocation, Status};
use conductor::engine::message::{BusMessage, ClientId, ErrorInfo, MessageKind, Uid};
use conductor::engine::model::{ActionExecutor, Value};

/// In-memory bus shared by every process in one test.
///
/// Delivery is synchronous and in-line: a handler runs on the sender's
/// thread. `gather` waits out its full timeout collecting replies correlated
/// by uid, like a request/collect round on a real bus.
pub struct Fabric {
    seq: AtomicU64,
    peers: Mutex<Vec<Arc<LocalBus>>>,
    collectors: Mutex<HashMap<Uid, Vec<BusMessage>>>,
    cond: Condvar,
}

impl Fabric {
    pub fn new() -> Arc<Self> {
        init_tracing();
        Arc::new(Self {
            seq: AtomicU64::new(0),
            peers: Mutex::new(Vec::new()),
            collectors: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        })
    }

    /// Attach a new process to the fabric.
    pub fn join(self: &Arc<Self>) -> Arc<LocalBus> {
        let bus = Arc::new(LocalBus {
            client: ClientId::new(),
            fabric: Arc::downgrade(self),
            subs: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        });
        self.peers.lock().push(bus.clone());
        bus
    }

    fn deliver(&self, message: BusMessage) {
        {
            let mut collectors = self.collectors.lock();
            if let Some(replies) = collectors.get_mut(&message.uid()) {
                if !matches!(message, BusMessage::Execute(_)) {
                    replies.push(message.clone());
                    self.cond.notify_all();
                }
            }
        }
        // Snapshot peers and subscriptions, then deliver without holding any
        // lock: handlers are free to publish from inside delivery.
        let peers: Vec<Arc<LocalBus>> = self.peers.lock().clone();
        for peer in peers {
            let subs = peer.subs.lock().clone();
            for (kinds, handler) in subs {
                if kinds.contains(&message.kind()) {
                    handler.on_message(message.clone());
                }
            }
        }
    }
}

pub struct LocalBus {
    client: ClientId,
    fabric: Weak<Fabric>,
    subs: Mutex<Vec<(Vec<MessageKind>, Arc<dyn BusHandler>)>>,
    sent: Mutex<Vec<BusMessage>>,
}

impl LocalBus {
    /// Every message this bus has published, in order.
    pub fn sent(&self) -> Vec<BusMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_kinds(&self) -> Vec<MessageKind> {
        self.sent.lock().iter().map(|m| m.kind()).collect()
    }
}

impl MessageBus for LocalBus {
    fn send(&self, message: BusMessage) -> Result<(), BusError> {
        let fabric = self.fabric.upgrade().ok_or(BusError::Closed)?;
        self.sent.lock().push(message.clone());
        fabric.deliver(message);
        Ok(())
    }

    fn gather(
        &self,
        message: BusMessage,
        timeout: Duration,
    ) -> Result<Vec<BusMessage>, BusError> {
        let fabric = self.fabric.upgrade().ok_or(BusError::Closed)?;
        let uid = message.uid();
        fabric.collectors.lock().insert(uid, Vec::new());
        self.sent.lock().push(message.clone());
        fabric.deliver(message);

        let deadline = Instant::now() + timeout;
        let mut collectors = fabric.collectors.lock();
        while !fabric.cond.wait_until(&mut collectors, deadline).timed_out() {}
        Ok(collectors.remove(&uid).unwrap_or_default())
    }

    fn subscribe(&self, kinds: &[MessageKind], handler: Arc<dyn BusHandler>) {
        self.subs.lock().push((kinds.to_vec(), handler));
    }

    fn next_uid(&self) -> Uid {
        let fabric = match self.fabric.upgrade() {
            Some(fabric) => fabric,
            None => return Uid::new(self.client, 0),
        };
        Uid::new(self.client, fabric.seq.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn client_id(&self) -> ClientId {
        self.client
    }
}

/// Poll until `invocation` reaches `status` or the deadline passes.
pub fn wait_for_status(invocation: &Arc<Invocation>, status: Status, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if invocation.status() == status {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Executor that copies input 0 to the first output position.
pub struct EchoExecutor;

impl ActionExecutor for EchoExecutor {
    fn execute(&self, invocation: &Arc<Invocation>) -> Result<(), ErrorInfo> {
        let value = invocation.param(0).unwrap_or(Value::Null);
        invocation
            .set_param(1, value)
            .map_err(|err| ErrorInfo::new(err.to_string()))?;
        Ok(())
    }
}

/// Executor that fails with a fixed coded error.
pub struct FailingExecutor;

impl ActionExecutor for FailingExecutor {
    fn execute(&self, _invocation: &Arc<Invocation>) -> Result<(), ErrorInfo> {
        Err(ErrorInfo::with_code("io", "disk gone"))
    }
}

/// Executor that runs until its invocation is cancelled or failed.
pub struct BlockingExecutor;

impl ActionExecutor for BlockingExecutor {
    fn execute(&self, invocation: &Arc<Invocation>) -> Result<(), ErrorInfo> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !invocation.status().is_terminal() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

/// Executor that pauses once at a sub-action boundary, waits to be resumed,
/// then echoes input 0 to output 1.
pub struct SteppedExecutor;

impl ActionExecutor for SteppedExecutor {
    fn execute(&self, invocation: &Arc<Invocation>) -> Result<(), ErrorInfo> {
        invocation
            .report_breakpoint(0, Some("Write".to_string()))
            .map_err(|err| ErrorInfo::new(err.to_string()))?;
        invocation
            .wait_until_running(Duration::from_secs(10))
            .map_err(|err| ErrorInfo::new(err.to_string()))?;
        let value = invocation.param(0).unwrap_or(Value::Null);
        invocation
            .set_param(1, value)
            .map_err(|err| ErrorInfo::new(err.to_string()))?;
        Ok(())
    }
}

/// Route engine tracing through the test harness; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A short engine configuration so gather rounds and waits stay quick.
pub fn quick_config() -> conductor::EngineConfig {
    conductor::EngineConfig {
        base_wait: Duration::from_millis(300),
        start_gate_wait: Duration::from_millis(200),
        ..conductor::EngineConfig::default()
    }
}
