//! Outbound execution-status broadcast
//!
//! An internal invocation listener attached to every locally executed
//! invocation. It mirrors the local lifecycle onto the bus: RUNNING becomes a
//! Start message, ENDED a Success message, and a recorded error an Error
//! message. PAUSED is not mirrored here; breakpoint notification has its own
//! message, published at the pause site. Publish and marshal failures are
//! logged and swallowed: the local lifecycle never depends on the bus.

use std::sync::Arc;
use tracing::warn;

use super::bus::MessageBus;
use super::invocation::{Invocation, InvocationListener, Status};
use super::message::{BusMessage, ErrorInfo, ErrorStatus, StartStatus, SuccessStatus};

/// Mirrors a local invocation's lifecycle onto the bus
pub struct StatusBroadcaster {
    bus: Arc<dyn MessageBus>,
}

impl StatusBroadcaster {
    /// Create a broadcaster publishing on `bus`
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    fn publish(&self, invocation: &Invocation, message: BusMessage) {
        if let Err(err) = self.bus.send(message) {
            warn!(uid = %invocation.uid(), %err, "status publish failed");
        }
    }
}

impl InvocationListener for StatusBroadcaster {
    fn on_status(&self, invocation: &Invocation, status: Status) {
        match status {
            Status::Running => {
                let inputs = match invocation.marshaled_inputs() {
                    Ok(inputs) => inputs,
                    Err(err) => {
                        warn!(uid = %invocation.uid(), %err, "inputs did not marshal; start not broadcast");
                        return;
                    }
                };
                let start = StartStatus {
                    uid: invocation.uid(),
                    parent_uid: invocation.parent().map(|p| p.uid()),
                    action: invocation
                        .kind()
                        .definition()
                        .map(|d| d.name().to_string()),
                    serial: invocation.serial(),
                    inputs,
                    stepped: invocation.is_stepped(),
                    sender: self.bus.client_id(),
                };
                self.publish(invocation, BusMessage::Start(start));
            }
            Status::Ended => {
                let outputs = match invocation.marshaled_outputs() {
                    Ok(outputs) => outputs,
                    Err(err) => {
                        warn!(uid = %invocation.uid(), %err, "outputs did not marshal; success not broadcast");
                        return;
                    }
                };
                let success = SuccessStatus {
                    uid: invocation.uid(),
                    outputs,
                    sender: self.bus.client_id(),
                };
                self.publish(invocation, BusMessage::Success(success));
            }
            // Pauses are announced through the breakpoint channel, and a
            // failure is announced by on_error; nothing to mirror here.
            Status::Created | Status::Paused | Status::Failed => {}
        }
    }

    fn on_error(&self, invocation: &Invocation, error: &ErrorInfo) {
        let status = ErrorStatus {
            uid: invocation.uid(),
            error: error.clone(),
            sender: self.bus.client_id(),
        };
        self.publish(invocation, BusMessage::Error(status));
    }
}
