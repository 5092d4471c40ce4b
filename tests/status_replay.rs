//! Reconstruction of invocation state from the status broadcast stream.
//!
//! These tests drive the reconstructor deterministically by applying
//! messages on the test thread, the way the sequential worker would.

mod common;

use std::sync::Arc;
use std::time::Duration;

use conductor::Engine;
use conductor::engine::bus::MessageBus;
use conductor::engine::invocation::Status;
use conductor::engine::message::{
    BreakpointNotify, BusMessage, ClientId, ErrorInfo, ErrorStatus, IgnoredStatus, StartStatus,
    StepCommand, SuccessStatus, Uid,
};
use conductor::engine::model::{ActionCatalog, SimpleAction, Value};

use common::{Fabric, LocalBus, quick_config};

// The fabric is returned alongside the bus: each process holds only a weak
// reference to it, so the fixture must keep it alive for the test's duration.
fn setup() -> (Arc<Fabric>, Arc<LocalBus>, Engine) {
    let fabric = Fabric::new();
    let bus = fabric.join();
    let catalog = Arc::new(ActionCatalog::new());
    catalog.register(Arc::new(SimpleAction::new("Save", 1, 1)));
    let engine = Engine::new(bus.clone(), catalog, quick_config());
    (fabric, bus, engine)
}

fn start_message(uid: Uid, sender: ClientId, stepped: bool) -> BusMessage {
    BusMessage::Start(StartStatus {
        uid,
        parent_uid: None,
        action: Some("Save".to_string()),
        serial: Some(1),
        inputs: vec!["draft.txt".to_string()],
        stepped,
        sender,
    })
}

#[test]
fn test_start_creates_running_proxy_with_inputs() {
    let (_fabric, _bus, engine) = setup();
    let remote = ClientId::new();
    let uid = Uid::new(remote, 1);

    engine.reconstructor().apply(start_message(uid, remote, false));

    let proxy = engine.cache().get(&uid, Duration::ZERO).unwrap();
    assert!(!proxy.is_local());
    assert_eq!(proxy.status(), Status::Running);
    assert_eq!(proxy.param(0), Some(Value::String("draft.txt".into())));
    assert_eq!(proxy.serial(), Some(1));

    engine.shutdown();
}

#[test]
fn test_success_binds_outputs_and_evicts() {
    let (_fabric, _bus, engine) = setup();
    let remote = ClientId::new();
    let uid = Uid::new(remote, 2);

    engine.reconstructor().apply(start_message(uid, remote, false));
    let proxy = engine.cache().get(&uid, Duration::ZERO).unwrap();

    engine.reconstructor().apply(BusMessage::Success(SuccessStatus {
        uid,
        outputs: vec!["saved".to_string()],
        sender: remote,
    }));

    assert_eq!(proxy.status(), Status::Ended);
    assert_eq!(proxy.outputs(), vec![Value::String("saved".into())]);
    assert!(!engine.cache().contains(&uid));

    engine.shutdown();
}

#[test]
fn test_error_fails_proxy_with_carried_error() {
    let (_fabric, _bus, engine) = setup();
    let remote = ClientId::new();
    let uid = Uid::new(remote, 3);

    engine.reconstructor().apply(start_message(uid, remote, false));
    let proxy = engine.cache().get(&uid, Duration::ZERO).unwrap();

    engine.reconstructor().apply(BusMessage::Error(ErrorStatus {
        uid,
        error: ErrorInfo::with_code("io", "disk gone"),
        sender: remote,
    }));

    assert_eq!(proxy.status(), Status::Failed);
    assert!(proxy.last_error().unwrap().has_code("io"));
    assert!(!engine.cache().contains(&uid));

    engine.shutdown();
}

#[test]
fn test_gesture_start_has_no_definition() {
    let (_fabric, _bus, engine) = setup();
    let remote = ClientId::new();
    let uid = Uid::new(remote, 4);

    engine.reconstructor().apply(BusMessage::Start(StartStatus {
        uid,
        parent_uid: None,
        action: None,
        serial: Some(2),
        inputs: vec![],
        stepped: false,
        sender: remote,
    }));

    let proxy = engine.cache().get(&uid, Duration::ZERO).unwrap();
    assert!(proxy.kind().is_composite());
    assert_eq!(proxy.status(), Status::Running);

    engine.shutdown();
}

#[test]
fn test_ignored_forces_unclaimed_invocation_to_end() {
    let (_fabric, _bus, engine) = setup();
    let remote = ClientId::new();

    // Nobody claims "Save": the requester's record stays CREATED until the
    // ignored outcome arrives.
    let invocation = engine
        .start_action("Save", vec![Value::String("draft.txt".into())], None)
        .unwrap();
    assert_eq!(invocation.status(), Status::Created);

    engine.reconstructor().apply(BusMessage::Ignored(IgnoredStatus {
        uid: invocation.uid(),
        sender: remote,
    }));

    assert_eq!(invocation.status(), Status::Ended);
    assert!(!engine.cache().contains(&invocation.uid()));

    engine.shutdown();
}

#[test]
fn test_breakpoint_for_unknown_uid_replies_step_over() {
    let (_fabric, bus, engine) = setup();
    let remote = ClientId::new();
    let uid = Uid::new(remote, 5);

    engine
        .reconstructor()
        .apply(BusMessage::BreakpointNotify(BreakpointNotify {
            uid,
            position: 1,
            sub_action: None,
            sender: remote,
        }));

    assert!(bus.sent().iter().any(|m| {
        matches!(m, BusMessage::BreakpointResponse(r) if r.uid == uid && r.command == StepCommand::Over)
    }));

    engine.shutdown();
}

#[test]
fn test_breakpoint_on_composite_replies_step_over() {
    let (_fabric, bus, engine) = setup();
    let remote = ClientId::new();
    let uid = Uid::new(remote, 6);

    engine.reconstructor().apply(BusMessage::Start(StartStatus {
        uid,
        parent_uid: None,
        action: None,
        serial: None,
        inputs: vec![],
        stepped: true,
        sender: remote,
    }));
    engine
        .reconstructor()
        .apply(BusMessage::BreakpointNotify(BreakpointNotify {
            uid,
            position: 0,
            sub_action: Some("Save".to_string()),
            sender: remote,
        }));

    // Stepping into composites is unsupported; the container is not paused.
    let proxy = engine.cache().get(&uid, Duration::ZERO).unwrap();
    assert_eq!(proxy.status(), Status::Running);
    assert!(bus.sent().iter().any(|m| {
        matches!(m, BusMessage::BreakpointResponse(r) if r.uid == uid)
    }));

    engine.shutdown();
}

#[test]
fn test_breakpoint_records_pause_on_held_proxy() {
    let (_fabric, bus, engine) = setup();
    let remote = ClientId::new();
    let uid = Uid::new(remote, 7);

    engine.reconstructor().apply(start_message(uid, remote, true));
    engine
        .reconstructor()
        .apply(BusMessage::BreakpointNotify(BreakpointNotify {
            uid,
            position: 2,
            sub_action: Some("Write".to_string()),
            sender: remote,
        }));

    let proxy = engine.cache().get(&uid, Duration::ZERO).unwrap();
    assert_eq!(proxy.status(), Status::Paused);
    let pause = proxy.pause().unwrap();
    assert_eq!(pause.position, 2);
    assert_eq!(pause.sub_action.as_deref(), Some("Write"));
    // A process holding the invocation records the pause instead of
    // answering for it.
    assert!(
        !bus.sent()
            .iter()
            .any(|m| matches!(m, BusMessage::BreakpointResponse(_)))
    );

    engine.shutdown();
}

#[test]
fn test_start_for_held_invocation_echoes_running_only() {
    let (_fabric, _bus, engine) = setup();
    let remote = ClientId::new();

    let invocation = engine
        .start_action("Save", vec![Value::String("draft.txt".into())], None)
        .unwrap();
    assert_eq!(invocation.status(), Status::Created);

    // A claimer announced the start; the requester's own record transitions.
    engine.reconstructor().apply(BusMessage::Start(StartStatus {
        uid: invocation.uid(),
        parent_uid: None,
        action: Some("Save".to_string()),
        serial: None,
        inputs: vec!["draft.txt".to_string()],
        stepped: false,
        sender: remote,
    }));

    assert_eq!(invocation.status(), Status::Running);
    // No duplicate record was created.
    assert_eq!(engine.cache().len(), 1);

    engine.shutdown();
}

#[test]
fn test_queued_start_serializes_dependents() {
    let (_fabric, bus, engine) = setup();
    let remote = ClientId::new();
    let uid = Uid::new(remote, 8);

    // offer() registers the watch synchronously and hands the message to the
    // worker; a dependent blocked in parent_ready is released by add().
    engine.reconstructor().offer(start_message(uid, remote, false));
    engine
        .cache()
        .parent_ready(&uid, Duration::from_secs(2))
        .unwrap();
    assert!(engine.cache().contains(&uid));

    // Self-sent statuses are discarded at the door.
    let own = Uid::new(bus.client_id(), 99);
    engine
        .reconstructor()
        .offer(start_message(own, bus.client_id(), false));
    std::thread::sleep(Duration::from_millis(50));
    assert!(!engine.cache().contains(&own));

    engine.shutdown();
}
