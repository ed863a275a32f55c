//! Probe module wired to scripted peer modules on the in-memory bus

use evt_core::{
    ErrorFilter, Fulfillment, LocalBus, MessageBusExt, ProbeConfig, ProbeError, ProbeModule, Severity, Topics,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// A peer standing in for an EVSE manager: `enable_disable` flips its state
/// and publishes the matching session event
fn evse_manager(bus: &Arc<LocalBus>, module_id: &str) -> ProbeModule {
    let peer = ProbeModule::new(bus.clone(), ProbeConfig::new(module_id));
    let publisher = bus.clone();
    let topic = Topics::default().variable(module_id, "evse", "session_event");

    peer.implement_command("evse", "enable_disable", move |args| {
        let enable = args["cmd_source"]["enable_status"] == "Enable";
        let event = if enable { "Enabled" } else { "Disabled" };
        publisher
            .publish_json(&topic, &json!({ "event": event }))
            .map_err(|e| evt_core::RemoteFailure::handler(e.to_string()))?;
        Ok(Value::Bool(true))
    })
    .unwrap();
    peer
}

fn probe(bus: &Arc<LocalBus>) -> ProbeModule {
    ProbeModule::new(
        bus.clone(),
        ProbeConfig::new("probe")
            .with_connection("evse_manager", Fulfillment::new("evse_manager_1", "evse"))
            .with_connection("evse_manager", Fulfillment::new("evse_manager_2", "evse"))
            .with_command_timeout(Duration::from_secs(2)),
    )
}

#[tokio::test]
async fn test_command_and_variable_through_peer() {
    let bus = LocalBus::new();
    let _peer = evse_manager(&bus, "evse_manager_1");
    let probe = probe(&bus);

    let mut events = probe.subscribe_variable_to_queue("evse_manager", "session_event").unwrap();
    let reply = probe
        .call_command(
            "evse_manager",
            "enable_disable",
            json!({"connector_id": 1, "cmd_source": {"enable_status": "Disable"}}),
        )
        .await
        .unwrap();
    assert_eq!(reply, Value::Bool(true));

    let event = events.recv_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(event, json!({"event": "Disabled"}));
    assert!(events.try_recv().is_none());
}

#[tokio::test]
async fn test_second_fulfillment_is_addressed_by_index() {
    let bus = LocalBus::new();
    let _first = evse_manager(&bus, "evse_manager_1");
    let _second = evse_manager(&bus, "evse_manager_2");
    let probe = probe(&bus);

    let topic = Topics::default().variable("evse_manager_2", "evse", "session_event");
    let mut second_events = bus_queue(&bus, &topic);

    probe
        .call_command_at(
            "evse_manager",
            1,
            "enable_disable",
            json!({"connector_id": 1, "cmd_source": {"enable_status": "Enable"}}),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(1), second_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, json!({"event": "Enabled"}));
}

#[tokio::test]
async fn test_missing_peer_times_out() {
    let bus = LocalBus::new();
    let probe = probe(&bus);

    let err = probe
        .call_command_with_timeout("evse_manager", "enable_disable", json!({}), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::Timeout { .. }));
    assert_eq!(probe.pending_calls(), 0);
}

#[tokio::test]
async fn test_peer_observes_probe_errors() {
    let bus = LocalBus::new();
    let probe = probe(&bus);
    let topic = format!("{}modules/probe/impl/main/error/#", Topics::default().prefix());
    let mut raised = bus_queue(&bus, &topic);

    probe
        .raise_error("main", "evse_board_support/DiodeFault", "", "diode shorted", Severity::High)
        .unwrap();
    let record = tokio::time::timeout(Duration::from_secs(1), raised.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record["type"], "evse_board_support/DiodeFault");
    assert_eq!(record["state"], "Active");

    assert_eq!(probe.errors(&ErrorFilter::default()).len(), 1);
}

fn bus_queue(bus: &Arc<LocalBus>, topic: &str) -> tokio::sync::mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    bus.subscribe_fn(topic, move |msg| {
        let _ = tx.send(msg.json().unwrap());
    })
    .unwrap();
    rx
}
