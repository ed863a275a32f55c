//! Built-in end-to-end scenarios
//!
//! Live scenarios boot EVerest through a [`TestSession`] and need an
//! installation prefix; they are reported as skipped without one.
//! Self-contained scenarios exercise the CSMS mock and the probe runtime
//! on their own and always run.

use crate::controls::SimulationControl;
use crate::error::HarnessError;
use crate::runner::{HarnessConfig, SessionPlan, TestSession};
use chrono::{DurationRound, Utc};
use evt_core::{ErrorRecord, ErrorState, Fulfillment, LocalBus, ProbeConfig, ProbeModule, Severity};
use evt_ocpp::ocpp::{
    composite_schedule, AvailabilityType, ChangeAvailabilityRequest16, ChargingProfile16, ChargingProfileKind,
    ChargingProfilePurpose, ChargingRateUnit, ChargingSchedule16, ChargingSchedulePeriod, Component,
    CompositeRequest, GetCompositeScheduleRequest16, InstalledProfile, RemoteStopTransactionRequest,
    SetChargingProfileRequest16, SetVariablesRequest, Variable,
};
use evt_ocpp::{CsmsConfig, CsmsMock, OcppError, OcppVersion};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

pub type LiveRun = for<'a> fn(&'a TestSession) -> BoxFuture<'a, Result<(), HarnessError>>;
pub type SelfContainedRun = fn(HarnessConfig) -> BoxFuture<'static, Result<(), HarnessError>>;

#[derive(Clone, Copy)]
pub enum ScenarioBody {
    Live {
        plan: fn(HarnessConfig) -> SessionPlan,
        run: LiveRun,
    },
    SelfContained(SelfContainedRun),
}

#[derive(Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub ocpp_version: OcppVersion,
    pub body: ScenarioBody,
}

impl Scenario {
    pub fn is_live(&self) -> bool {
        matches!(self.body, ScenarioBody::Live { .. })
    }
}

/// Outcome of one scenario run
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub name: String,
    pub passed: bool,
    pub skipped: bool,
    pub duration: Duration,
    pub failure: Option<String>,
    /// OCPP traffic since the last clear, on failure
    pub history: Vec<String>,
}

impl ScenarioResult {
    fn skipped(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            skipped: true,
            duration: Duration::ZERO,
            failure: Some(reason.into()),
            history: Vec::new(),
        }
    }
}

const CATALOGUE: &[Scenario] = &[
    Scenario {
        name: "ac-plug-start-stop",
        description: "OCPP 1.6 plug in, RFID start, remote stop, plug out",
        ocpp_version: OcppVersion::V16,
        body: ScenarioBody::Live {
            plan: SessionPlan::new,
            run: ac_plug_start_stop,
        },
    },
    Scenario {
        name: "local-pre-auth-cache",
        description: "OCPP 2.0.1 authorization cache with local pre-authorize and lifetime expiry",
        ocpp_version: OcppVersion::V201,
        body: ScenarioBody::Live {
            plan: SessionPlan::new,
            run: local_pre_auth_cache,
        },
    },
    Scenario {
        name: "change-availability-active-tx",
        description: "OCPP 1.6 ChangeAvailability during a transaction is scheduled until plug out",
        ocpp_version: OcppVersion::V16,
        body: ScenarioBody::Live {
            plan: SessionPlan::new,
            run: change_availability_active_tx,
        },
    },
    Scenario {
        name: "composite-schedule",
        description: "OCPP 1.6 composite schedule of a station maximum and a TxDefault profile",
        ocpp_version: OcppVersion::V16,
        body: ScenarioBody::Live {
            plan: SessionPlan::new,
            run: composite_schedule_combination,
        },
    },
    Scenario {
        name: "malformed-frames",
        description: "CSMS mock answers malformed frames with the matching CallError",
        ocpp_version: OcppVersion::V201,
        body: ScenarioBody::SelfContained(malformed_frames),
    },
    Scenario {
        name: "error-history",
        description: "Error history filtering by severity and state",
        ocpp_version: OcppVersion::V201,
        body: ScenarioBody::SelfContained(error_history_filtering),
    },
];

/// Get a built-in scenario by name
pub fn get_scenario(name: &str) -> Result<&'static Scenario, HarnessError> {
    let wanted = name.to_lowercase();
    CATALOGUE
        .iter()
        .find(|s| s.name == wanted)
        .ok_or_else(|| HarnessError::UnknownScenario(name.to_string()))
}

pub fn list_scenarios() -> &'static [Scenario] {
    CATALOGUE
}

/// Runs scenarios one after another with a shared harness configuration
pub struct ScenarioRunner {
    config: HarnessConfig,
}

impl ScenarioRunner {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, scenario: &Scenario) -> ScenarioResult {
        let config = self.config.clone().with_ocpp_version(scenario.ocpp_version);
        if scenario.is_live() && !config.is_live_capable() {
            info!("Skipping {}: no EVerest installation configured", scenario.name);
            return ScenarioResult::skipped(scenario.name, "no EVerest installation configured");
        }

        info!("Running scenario: {}", scenario.name);
        let started = Instant::now();
        let mut outcome = attempt(scenario, config.clone()).await;
        if let Err((e, _)) = &outcome {
            if e.is_transport() {
                warn!("Scenario {} lost its transport ({}), retrying once", scenario.name, e);
                outcome = attempt(scenario, config).await;
            }
        }

        let duration = started.elapsed();
        match outcome {
            Ok(()) => {
                info!("Scenario {} PASSED in {:.1}s", scenario.name, duration.as_secs_f64());
                ScenarioResult {
                    name: scenario.name.to_string(),
                    passed: true,
                    skipped: false,
                    duration,
                    failure: None,
                    history: Vec::new(),
                }
            }
            Err((e, history)) => {
                error!("Scenario {} FAILED: {}", scenario.name, e);
                ScenarioResult {
                    name: scenario.name.to_string(),
                    passed: false,
                    skipped: false,
                    duration,
                    failure: Some(e.to_string()),
                    history,
                }
            }
        }
    }
}

/// One run of a scenario, with the history to report on failure
async fn attempt(scenario: &Scenario, config: HarnessConfig) -> Result<(), (HarnessError, Vec<String>)> {
    match scenario.body {
        ScenarioBody::SelfContained(run) => run(config).await.map_err(|e| {
            let history = assertion_history(&e);
            (e, history)
        }),
        ScenarioBody::Live { plan, run } => {
            let session = TestSession::start(plan(config)).await.map_err(|e| (e, Vec::new()))?;
            let outcome = run(&session).await;
            let history = match &outcome {
                Err(e) if !assertion_history(e).is_empty() => assertion_history(e),
                Err(_) => session.csms().history().dump(),
                Ok(()) => Vec::new(),
            };
            let teardown = session.shutdown().await;
            match (outcome, teardown) {
                (Err(e), Err(t)) => {
                    warn!("Teardown after failure: {}", t);
                    Err((e, history))
                }
                (Err(e), Ok(())) => Err((e, history)),
                (Ok(()), Err(t)) => Err((t, Vec::new())),
                (Ok(()), Ok(())) => Ok(()),
            }
        }
    }
}

fn assertion_history(e: &HarnessError) -> Vec<String> {
    match e {
        HarnessError::Assertion(evt_ocpp::AssertionError::Failed { history, .. })
        | HarnessError::Assertion(evt_ocpp::AssertionError::ForbiddenAction { history, .. }) => history.clone(),
        _ => Vec::new(),
    }
}

/// Run every built-in scenario
pub async fn run_suite(config: HarnessConfig) -> crate::report::SuiteResults {
    let runner = ScenarioRunner::new(config);
    let mut results = Vec::new();
    for scenario in list_scenarios() {
        results.push(runner.run(scenario).await);
    }
    crate::report::SuiteResults::from_results(results)
}

// ============================================================================
// Live scenarios
// ============================================================================

const TOKEN: &str = "DEADBEEF";

async fn booted(session: &TestSession) -> Result<(), HarnessError> {
    session.csms().wait_for_connection(session.config().startup_timeout).await?;
    session.expect("BootNotification", json!({})).await
}

fn status16(status: &str) -> Value {
    json!({"connectorId": 1, "status": status})
}

fn ensure_status(response: &Value, expected: &str, what: &str) -> Result<(), HarnessError> {
    match response.get("status").and_then(Value::as_str) {
        Some(status) if status == expected => Ok(()),
        other => Err(HarnessError::check(format!(
            "{} answered {:?}, expected {}",
            what, other, expected
        ))),
    }
}

fn ac_plug_start_stop(session: &TestSession) -> BoxFuture<'_, Result<(), HarnessError>> {
    Box::pin(async move {
        booted(session).await?;

        session.fire(SimulationControl::PlugIn { connector: 1 }).await?;
        session.fire(SimulationControl::swipe(TOKEN, vec![1])).await?;
        session.expect("StatusNotification", status16("Preparing")).await?;
        session
            .expect(
                "StartTransaction",
                json!({"connectorId": 1, "idTag": TOKEN, "meterStart": 0}),
            )
            .await?;
        session.expect("StatusNotification", status16("Charging")).await?;

        let response = session
            .call("RemoteStopTransaction", RemoteStopTransactionRequest { transaction_id: 1 })
            .await?;
        ensure_status(&response, "Accepted", "RemoteStopTransaction")?;
        session.expect("StopTransaction", json!({"reason": "Remote"})).await?;
        session.expect("StatusNotification", status16("Finishing")).await?;

        session.fire(SimulationControl::PlugOut { connector: 1 }).await?;
        session.expect("StatusNotification", status16("Available")).await
    })
}

async fn set_variable(session: &TestSession, component: &str, variable: &str, value: &str) -> Result<(), HarnessError> {
    let request = SetVariablesRequest::single(Component::named(component), Variable::named(variable), value);
    let response = session.call("SetVariables", request).await?;
    let status = response["setVariableResult"][0]["attributeStatus"].as_str();
    if status != Some("Accepted") {
        return Err(HarnessError::check(format!(
            "SetVariables {}.{}={} answered {:?}",
            component, variable, value, status
        )));
    }
    Ok(())
}

fn local_pre_auth_cache(session: &TestSession) -> BoxFuture<'_, Result<(), HarnessError>> {
    Box::pin(async move {
        booted(session).await?;
        let history = session.csms().history();
        let authorize = json!({"idToken": {"idToken": TOKEN, "type": "ISO14443"}});

        set_variable(session, "AuthCacheCtrlr", "Enabled", "true").await?;
        set_variable(session, "AuthCtrlr", "LocalPreAuthorize", "true").await?;
        set_variable(session, "AuthCacheCtrlr", "LifeTime", "86400").await?;
        let response = session.call("ClearCache", json!({})).await?;
        ensure_status(&response, "Accepted", "ClearCache")?;

        session.fire(SimulationControl::swipe(TOKEN, vec![1])).await?;
        session.expect("Authorize", authorize.clone()).await?;

        session.fire(SimulationControl::PlugIn { connector: 1 }).await?;
        session.expect("TransactionEvent", json!({"eventType": "Started"})).await?;
        history.clear();
        session.fire(SimulationControl::PlugOut { connector: 1 }).await?;
        session.expect("TransactionEvent", json!({"eventType": "Ended"})).await?;
        history.clear();

        // cached and pre-authorized locally
        tokio::time::sleep(Duration::from_secs(2)).await;
        history.forbid(["Authorize"]);
        session.fire(SimulationControl::swipe(TOKEN, vec![1])).await?;
        session.fire(SimulationControl::PlugIn { connector: 1 }).await?;
        session.expect("TransactionEvent", json!({"eventType": "Started"})).await?;

        set_variable(session, "AuthCtrlr", "LocalPreAuthorize", "false").await?;
        set_variable(session, "AuthCacheCtrlr", "LifeTime", "1").await?;
        history.clear();
        session.fire(SimulationControl::PlugOut { connector: 1 }).await?;
        session.expect("TransactionEvent", json!({"eventType": "Ended"})).await?;
        history.allow("Authorize");

        tokio::time::sleep(Duration::from_secs(2)).await;
        session.fire(SimulationControl::swipe(TOKEN, vec![1])).await?;
        session.expect("Authorize", authorize).await
    })
}

fn change_availability_active_tx(session: &TestSession) -> BoxFuture<'_, Result<(), HarnessError>> {
    Box::pin(async move {
        booted(session).await?;

        session.fire(SimulationControl::PlugIn { connector: 1 }).await?;
        session.fire(SimulationControl::swipe(TOKEN, vec![1])).await?;
        session
            .expect("StartTransaction", json!({"connectorId": 1, "idTag": TOKEN}))
            .await?;

        let request = ChangeAvailabilityRequest16 {
            connector_id: 1,
            availability: AvailabilityType::Inoperative,
        };
        // the request is accepted as a CallResult (a CallError fails `call`)
        // whose status must be Scheduled while the transaction runs
        let response = session.call("ChangeAvailability", request).await?;
        ensure_status(&response, "Scheduled", "ChangeAvailability")?;

        session.fire(SimulationControl::PlugOut { connector: 1 }).await?;
        session.expect("StopTransaction", json!({"reason": "EVDisconnected"})).await?;
        session.expect("StatusNotification", status16("Unavailable")).await
    })
}

fn absolute_profile(
    id: i32,
    purpose: ChargingProfilePurpose,
    unit: ChargingRateUnit,
    periods: Vec<ChargingSchedulePeriod>,
    start: chrono::DateTime<Utc>,
) -> ChargingProfile16 {
    ChargingProfile16 {
        charging_profile_id: id,
        transaction_id: None,
        stack_level: 0,
        charging_profile_purpose: purpose,
        charging_profile_kind: ChargingProfileKind::Absolute,
        recurrency_kind: None,
        valid_from: None,
        valid_to: None,
        charging_schedule: ChargingSchedule16 {
            duration: Some(400),
            start_schedule: Some(start),
            charging_rate_unit: unit,
            charging_schedule_period: periods,
            min_charging_rate: None,
        },
    }
}

/// Compare periods allowing one second of drift on each boundary
fn periods_match(observed: &Value, expected: &[ChargingSchedulePeriod]) -> bool {
    let Some(observed) = observed.as_array() else {
        return false;
    };
    observed.len() >= expected.len()
        && expected.iter().zip(observed).all(|(want, got)| {
            let start = got["startPeriod"].as_i64().unwrap_or(i64::MIN);
            let phases_ok = match want.number_phases {
                Some(n) => got["numberPhases"].as_i64().map_or(true, |p| p == i64::from(n)),
                None => true,
            };
            got["limit"].as_f64() == Some(want.limit)
                && (start - i64::from(want.start_period)).abs() <= 1
                && phases_ok
        })
}

fn composite_schedule_combination(session: &TestSession) -> BoxFuture<'_, Result<(), HarnessError>> {
    Box::pin(async move {
        booted(session).await?;

        let start = Utc::now()
            .duration_trunc(chrono::Duration::seconds(1))
            .unwrap_or_else(|_| Utc::now());
        let station_max = absolute_profile(
            1,
            ChargingProfilePurpose::ChargePointMaxProfile,
            ChargingRateUnit::A,
            vec![
                ChargingSchedulePeriod::new(0, 10.0, None),
                ChargingSchedulePeriod::new(100, 20.0, Some(1)),
                ChargingSchedulePeriod::new(200, 20.0, Some(3)),
            ],
            start,
        );
        let tx_default = absolute_profile(
            2,
            ChargingProfilePurpose::TxDefaultProfile,
            ChargingRateUnit::W,
            vec![
                ChargingSchedulePeriod::new(0, 11_000.0, None),
                ChargingSchedulePeriod::new(150, 6_900.0, None),
                ChargingSchedulePeriod::new(250, 4_600.0, Some(1)),
            ],
            start,
        );
        let installed = vec![
            InstalledProfile::new(0, station_max.clone()),
            InstalledProfile::new(1, tx_default.clone()),
        ];
        for profile in installed.iter() {
            let request = SetChargingProfileRequest16 {
                connector_id: profile.connector_id,
                cs_charging_profiles: profile.profile.clone(),
            };
            let response = session.call("SetChargingProfile", request).await?;
            ensure_status(&response, "Accepted", "SetChargingProfile")?;
        }

        let requested_at = Utc::now();
        let response = session
            .call(
                "GetCompositeSchedule",
                GetCompositeScheduleRequest16 {
                    connector_id: 1,
                    duration: 400,
                    charging_rate_unit: Some(ChargingRateUnit::A),
                },
            )
            .await?;
        ensure_status(&response, "Accepted", "GetCompositeSchedule")?;

        let expected = composite_schedule(
            &installed,
            &CompositeRequest::new(1, requested_at, 400, ChargingRateUnit::A),
        );
        let schedule = &response["chargingSchedule"];
        if schedule["chargingRateUnit"] != "A"
            || !periods_match(&schedule["chargingSchedulePeriod"], &expected.charging_schedule_period)
        {
            return Err(HarnessError::check(format!(
                "composite schedule {} does not match expected {}",
                schedule,
                serde_json::to_string(&expected)?
            )));
        }
        Ok(())
    })
}

// ============================================================================
// Self-contained scenarios
// ============================================================================

async fn next_frame<S>(ws: &mut S, timeout: Duration) -> Result<Value, HarnessError>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let next = tokio::time::timeout_at(deadline, ws.next())
            .await
            .map_err(|_| OcppError::Timeout {
                action: "CallError".to_string(),
            })?;
        match next {
            Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(OcppError::WebSocket(e.to_string()).into()),
            None => return Err(OcppError::ConnectionClosed.into()),
        }
    }
}

fn ensure_call_error(reply: &Value, message_id: &str, code: &str) -> Result<(), HarnessError> {
    if reply[0] == 4 && reply[1] == message_id && reply[2] == code {
        Ok(())
    } else {
        Err(HarnessError::check(format!(
            "expected CallError {} for {}, got {}",
            code, message_id, reply
        )))
    }
}

fn malformed_frames(config: HarnessConfig) -> BoxFuture<'static, Result<(), HarnessError>> {
    Box::pin(async move {
        let version = config.ocpp_version;
        let csms = CsmsMock::start(CsmsConfig::new(version).with_station_id(config.station_id.clone())).await?;
        let outcome = async {
            let mut request = csms
                .station_url(&config.station_id)
                .into_client_request()
                .map_err(|e| OcppError::WebSocket(e.to_string()))?;
            request.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_static(version.subprotocol()),
            );
            let (mut station, _) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| OcppError::WebSocket(e.to_string()))?;
            csms.wait_for_connection(config.command_timeout).await?;

            let long_name = "x".repeat(160);
            let set_variables = json!([2, "set-1", "SetVariables", {
                "setVariableData": [{
                    "attributeValue": "true",
                    "component": {"name": long_name},
                    "variable": {"name": "Enabled"}
                }]
            }]);
            let cases = [
                ("{Malformed".to_string(), "-1", "RpcFrameworkError"),
                (r#"[99,"MessageId"]"#.to_string(), "MessageId", "MessageTypeNotSupported"),
                (set_variables.to_string(), "set-1", "FormationViolation"),
            ];
            for (frame, message_id, code) in cases {
                station
                    .send(Message::Text(frame))
                    .await
                    .map_err(|e| OcppError::WebSocket(e.to_string()))?;
                let reply = next_frame(&mut station, config.command_timeout).await?;
                ensure_call_error(&reply, message_id, code)?;
            }
            let _ = station.close(None).await;
            Ok::<(), HarnessError>(())
        }
        .await;
        csms.stop().await;
        outcome
    })
}

fn error_history_filtering(config: HarnessConfig) -> BoxFuture<'static, Result<(), HarnessError>> {
    Box::pin(async move {
        let bus = LocalBus::new();
        let history = ProbeModule::new(bus.clone(), ProbeConfig::new("error_history"));
        let probe = ProbeModule::new(
            bus.clone(),
            ProbeConfig::new(config.probe_module_id.clone())
                .with_connection("error_history", Fulfillment::new("error_history", "error_history"))
                .with_command_timeout(config.command_timeout),
        );
        history.serve_error_history("error_history")?;

        let mut raised = Vec::new();
        for (error_type, severity) in [
            ("test_errors/TestErrorA", Severity::Low),
            ("test_errors/TestErrorB", Severity::Low),
            ("test_errors/TestErrorC", Severity::High),
            ("test_errors/TestErrorD", Severity::Medium),
        ] {
            raised.push(history.raise_error("main", error_type, "", "raised by scenario", severity)?);
        }

        let query = |filters: Value| {
            let probe = probe.clone();
            async move {
                let answer = probe
                    .call_command("error_history", "get_errors", json!({"filters": filters}))
                    .await?;
                Ok::<Vec<ErrorRecord>, HarnessError>(serde_json::from_value(answer)?)
            }
        };

        let high = query(json!({"severity_filter": "HIGH_GE"})).await?;
        if high.len() != 1 || high[0].error_type != "test_errors/TestErrorC" {
            return Err(HarnessError::check(format!(
                "HIGH_GE returned {:?}",
                high.iter().map(|r| r.error_type.as_str()).collect::<Vec<_>>()
            )));
        }

        for record in &raised[..3] {
            history.clear_error_by_uuid(&record.uuid)?;
        }
        let cleared = query(json!({"state_filter": "ClearedByModule"})).await?;
        let mut uuids: Vec<&str> = cleared.iter().map(|r| r.uuid.as_str()).collect();
        uuids.sort_unstable();
        let mut expected: Vec<&str> = raised[..3].iter().map(|r| r.uuid.as_str()).collect();
        expected.sort_unstable();
        if uuids != expected || cleared.iter().any(|r| r.state != ErrorState::ClearedByModule) {
            return Err(HarnessError::check(format!(
                "ClearedByModule returned {:?}, expected {:?}",
                uuids, expected
            )));
        }

        probe.stop();
        history.stop();
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_scenario() {
        let scenario = get_scenario("ac-plug-start-stop").unwrap();
        assert_eq!(scenario.ocpp_version, OcppVersion::V16);
        assert!(scenario.is_live());

        assert!(!get_scenario("Malformed-Frames").unwrap().is_live());
        assert!(matches!(get_scenario("nonexistent"), Err(HarnessError::UnknownScenario(_))));
    }

    #[test]
    fn test_list_scenarios() {
        let names: Vec<&str> = list_scenarios().iter().map(|s| s.name).collect();
        assert_eq!(names.len(), 6);
        assert!(names.contains(&"composite-schedule"));
        assert!(names.contains(&"error-history"));
    }

    #[test]
    fn test_change_availability_status_must_be_scheduled() {
        ensure_status(&json!({"status": "Scheduled"}), "Scheduled", "ChangeAvailability").unwrap();
        for response in [json!({"status": "Accepted"}), json!({})] {
            let err = ensure_status(&response, "Scheduled", "ChangeAvailability").unwrap_err();
            assert!(err.to_string().contains("expected Scheduled"));
        }
    }

    #[test]
    fn test_periods_match_tolerates_one_second() {
        let expected = vec![
            ChargingSchedulePeriod::new(0, 10.0, Some(3)),
            ChargingSchedulePeriod::new(100, 15.9, Some(3)),
        ];
        let observed = json!([
            {"startPeriod": 0, "limit": 10.0, "numberPhases": 3},
            {"startPeriod": 99, "limit": 15.9},
            {"startPeriod": 150, "limit": 10.0}
        ]);
        assert!(periods_match(&observed, &expected));

        let late = json!([
            {"startPeriod": 0, "limit": 10.0},
            {"startPeriod": 103, "limit": 15.9}
        ]);
        assert!(!periods_match(&late, &expected));
    }

    #[tokio::test]
    async fn test_live_scenario_skipped_without_prefix() {
        let runner = ScenarioRunner::new(HarnessConfig::default());
        let result = runner.run(get_scenario("ac-plug-start-stop").unwrap()).await;
        assert!(result.skipped);
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn test_error_history_scenario() {
        let config = HarnessConfig::default().with_command_timeout(Duration::from_secs(2));
        let result = ScenarioRunner::new(config).run(get_scenario("error-history").unwrap()).await;
        assert!(result.passed, "{:?}", result.failure);
    }
}
