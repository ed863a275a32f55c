//! CSMS mock driven by a WebSocket client acting as the charging station

use evt_ocpp::csms::{async_handler, handler_fn, HandlerError};
use evt_ocpp::{CsmsConfig, CsmsMock, ErrorCode, OcppError, OcppVersion};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Station = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn connect(csms: &CsmsMock, station_id: &str) -> Station {
    let mut request = csms.station_url(station_id).into_client_request().unwrap();
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(csms.version().subprotocol()),
    );
    let (ws, response) = connect_async(request).await.unwrap();
    assert_eq!(
        response.headers().get("Sec-WebSocket-Protocol").unwrap(),
        csms.version().subprotocol()
    );
    csms.wait_for_connection(TIMEOUT).await.unwrap();
    ws
}

async fn send(ws: &mut Station, frame: &str) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn next_frame(ws: &mut Station) -> Value {
    loop {
        let message = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("no frame from csms")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_boot_notification_default_v16() {
    let csms = CsmsMock::start(CsmsConfig::new(OcppVersion::V16)).await.unwrap();
    let mut station = connect(&csms, "cp001").await;
    assert_eq!(csms.station_id().as_deref(), Some("cp001"));

    send(
        &mut station,
        r#"[2,"boot-1","BootNotification",{"chargePointVendor":"Pionix","chargePointModel":"Yeti"}]"#,
    )
    .await;
    let reply = next_frame(&mut station).await;
    assert_eq!(reply[0], 3);
    assert_eq!(reply[1], "boot-1");
    assert_eq!(reply[2]["status"], "Accepted");
    assert_eq!(reply[2]["interval"], 1440);

    csms.expect("BootNotification", &json!({"chargePointVendor": "Pionix"}), TIMEOUT)
        .await
        .unwrap();
    csms.stop().await;
}

#[tokio::test]
async fn test_malformed_frames_get_call_errors() {
    let csms = CsmsMock::start(CsmsConfig::new(OcppVersion::V201)).await.unwrap();
    let mut station = connect(&csms, "cp001").await;

    send(&mut station, "{Malformed").await;
    let reply = next_frame(&mut station).await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[1], "-1");
    assert_eq!(reply[2], "RpcFrameworkError");

    send(&mut station, r#"[99,"MessageId"]"#).await;
    let reply = next_frame(&mut station).await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[1], "MessageId");
    assert_eq!(reply[2], "MessageTypeNotSupported");

    let long_name = "x".repeat(160);
    let call = json!([2, "set-1", "SetVariables", {
        "setVariableData": [{
            "attributeValue": "true",
            "component": {"name": long_name},
            "variable": {"name": "Enabled"}
        }]
    }]);
    send(&mut station, &call.to_string()).await;
    let reply = next_frame(&mut station).await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[1], "set-1");
    assert_eq!(reply[2], "FormationViolation");

    // the connection survives all three
    send(&mut station, r#"[2,"hb-1","Heartbeat",{}]"#).await;
    let reply = next_frame(&mut station).await;
    assert_eq!(reply[0], 3);
    assert!(reply[2]["currentTime"].is_string());
}

#[tokio::test]
async fn test_unknown_action_is_not_implemented() {
    let csms = CsmsMock::start(CsmsConfig::new(OcppVersion::V201)).await.unwrap();
    let mut station = connect(&csms, "cp001").await;

    send(&mut station, r#"[2,"x-1","VatNumberValidation",{}]"#).await;
    let reply = next_frame(&mut station).await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[2], "NotImplemented");
}

#[tokio::test]
async fn test_duplicate_in_flight_uid_is_rejected() {
    let csms = CsmsMock::start(CsmsConfig::new(OcppVersion::V201)).await.unwrap();
    csms.set_handler(
        "DataTransfer",
        async_handler(|_, _| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!({"status": "Accepted"}))
        }),
    );
    csms.set_recording(true);
    let mut station = connect(&csms, "cp001").await;

    send(&mut station, r#"[2,"dup","DataTransfer",{"vendorId":"a"}]"#).await;
    send(&mut station, r#"[2,"dup","DataTransfer",{"vendorId":"b"}]"#).await;

    // answers leave in arrival order, so the slow original comes first
    let first = next_frame(&mut station).await;
    assert_eq!(first, json!([3, "dup", {"status": "Accepted"}]));
    let second = next_frame(&mut station).await;
    assert_eq!(second[0], 4);
    assert_eq!(second[1], "dup");
    assert_eq!(second[2], "GenericError");

    // the rejected call is neither recorded nor available to assertions
    assert_eq!(csms.call_count("DataTransfer"), 1);
    assert!(!csms
        .wait_for_and_validate("DataTransfer", &json!({"vendorId": "b"}), None, Duration::from_millis(50))
        .await
        .unwrap());
    csms.expect("DataTransfer", &json!({"vendorId": "a"}), Duration::from_millis(50))
        .await
        .unwrap();

    // the id is free again once answered
    send(&mut station, r#"[2,"dup","DataTransfer",{"vendorId":"c"}]"#).await;
    let third = next_frame(&mut station).await;
    assert_eq!(third[0], 3);
}

#[tokio::test]
async fn test_replies_keep_arrival_order() {
    let csms = CsmsMock::start(CsmsConfig::new(OcppVersion::V201).with_recording())
        .await
        .unwrap();
    csms.set_handler(
        "MeterValues",
        async_handler(|_, payload: Value| async move {
            let delay = payload["delay"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(json!({}))
        }),
    );
    let mut station = connect(&csms, "cp001").await;

    for (i, delay) in [80, 40, 0, 20].iter().enumerate() {
        let frame = json!([2, format!("m{}", i), "MeterValues", {"delay": delay}]);
        send(&mut station, &frame.to_string()).await;
    }

    let mut ids = Vec::new();
    for _ in 0..4 {
        let reply = next_frame(&mut station).await;
        ids.push(reply[1].as_str().unwrap().to_string());
    }
    assert_eq!(ids, vec!["m0", "m1", "m2", "m3"]);

    let recorded: Vec<i64> = csms
        .recorded_calls(Some("MeterValues"))
        .iter()
        .map(|c| c.payload["delay"].as_i64().unwrap())
        .collect();
    assert_eq!(recorded, vec![80, 40, 0, 20]);
    assert_eq!(csms.call_count("MeterValues"), 4);
}

#[tokio::test]
async fn test_csms_call_is_correlated() {
    let csms = CsmsMock::start(CsmsConfig::new(OcppVersion::V16)).await.unwrap();
    let mut station = connect(&csms, "cp001").await;

    let station_task = tokio::spawn(async move {
        let call = next_frame(&mut station).await;
        assert_eq!(call[0], 2);
        assert_eq!(call[2], "RemoteStopTransaction");
        assert_eq!(call[3]["transactionId"], 1);

        // a reply to an unknown id is dropped without harm
        send(&mut station, r#"[3,"not-pending",{}]"#).await;
        let answer = json!([3, call[1], {"status": "Accepted"}]);
        send(&mut station, &answer.to_string()).await;
        station
    });

    let result = csms
        .call("RemoteStopTransaction", json!({"transactionId": 1}))
        .await
        .unwrap();
    assert_eq!(result, json!({"status": "Accepted"}));
    assert_eq!(csms.pending_calls(), 0);

    // the station's answer is matched under the originating action
    assert!(csms
        .wait_for_and_validate("RemoteStopTransaction", &json!({"status": "Accepted"}), None, TIMEOUT)
        .await
        .unwrap());
    let _station = station_task.await.unwrap();
}

#[tokio::test]
async fn test_csms_call_surfaces_call_error_and_timeout() {
    let csms = CsmsMock::start(CsmsConfig::new(OcppVersion::V201)).await.unwrap();
    let mut station = connect(&csms, "cp001").await;

    let station_task = tokio::spawn(async move {
        let call = next_frame(&mut station).await;
        let error = json!([4, call[1], "NotSupported", "no", {}]);
        send(&mut station, &error.to_string()).await;
        // swallow the second call
        let _ = next_frame(&mut station).await;
        station
    });

    let err = csms.call("Reset", json!({"type": "Immediate"})).await.unwrap_err();
    assert!(matches!(err, OcppError::RemoteError { code: ErrorCode::NotSupported, .. }));

    let err = csms
        .call_with_timeout("ClearCache", json!({}), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, OcppError::Timeout { .. }));
    assert_eq!(csms.pending_calls(), 0);
    let _station = station_task.await.unwrap();
}

#[tokio::test]
async fn test_handler_override_and_failure() {
    let csms = CsmsMock::start(CsmsConfig::new(OcppVersion::V201)).await.unwrap();
    csms.respond_with(
        "BootNotification",
        json!({"status": "Rejected", "currentTime": "2024-01-01T00:00:00Z", "interval": 10}),
    );
    csms.set_handler(
        "Authorize",
        handler_fn(|_, _| Err(HandlerError::new(ErrorCode::SecurityError, "blocked"))),
    );
    let mut station = connect(&csms, "cp001").await;

    send(
        &mut station,
        r#"[2,"b","BootNotification",{"chargingStation":{"model":"m","vendorName":"v"},"reason":"PowerUp"}]"#,
    )
    .await;
    assert_eq!(next_frame(&mut station).await[2]["status"], "Rejected");

    send(
        &mut station,
        r#"[2,"a","Authorize",{"idToken":{"idToken":"DEADBEEF","type":"ISO14443"}}]"#,
    )
    .await;
    let reply = next_frame(&mut station).await;
    assert_eq!(reply[2], "SecurityError");
    assert_eq!(reply[3], "blocked");

    csms.reset_handlers();
    send(
        &mut station,
        r#"[2,"b2","BootNotification",{"chargingStation":{"model":"m","vendorName":"v"},"reason":"PowerUp"}]"#,
    )
    .await;
    assert_eq!(next_frame(&mut station).await[2]["status"], "Accepted");
}

#[tokio::test]
async fn test_wrong_station_identity_is_refused() {
    let csms = CsmsMock::start(CsmsConfig::new(OcppVersion::V16).with_station_id("cp001"))
        .await
        .unwrap();
    let mut request = csms.station_url("intruder").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("ocpp1.6"));
    assert!(connect_async(request).await.is_err());
    assert!(!csms.is_connected());
}

#[tokio::test]
async fn test_disconnect_and_reconnect() {
    let csms = CsmsMock::start(CsmsConfig::new(OcppVersion::V16)).await.unwrap();
    let mut station = connect(&csms, "cp001").await;

    csms.disconnect();
    let closed = tokio::time::timeout(TIMEOUT, async {
        loop {
            match station.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    csms.wait_for_disconnection(TIMEOUT).await.unwrap();
    assert!(matches!(csms.call("Reset", json!({"type": "Soft"})).await, Err(OcppError::NotConnected)));

    let _station = connect(&csms, "cp001").await;
    assert!(csms.is_connected());
}
