//! Message history and the `wait_for_and_validate` primitive
//!
//! Every OCPP message crossing the mock is recorded here in arrival order.
//! Station-originated messages also enter a FIFO that expectations consume:
//! - easy mode (default) scans the FIFO first and then waits, skipping
//!   messages that do not match (they stay queued for later waits)
//! - strict mode fails on the first message that does not match
//!
//! Messages arriving while a wait is in progress are checked against the
//! forbidden-action set before anything else.

use crate::ocpp::messages::OcppMessage;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum AssertionError {
    #[error("expected {expected}, observed {observed}\nhistory:\n{}", .history.join("\n"))]
    Failed {
        expected: String,
        observed: String,
        history: Vec<String>,
    },

    #[error("forbidden action {action} observed\nhistory:\n{}", .history.join("\n"))]
    ForbiddenAction { action: String, history: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    StationToCsms,
    CsmsToStation,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::StationToCsms => f.write_str("station -> csms"),
            Direction::CsmsToStation => f.write_str("csms -> station"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    #[default]
    Easy,
    Strict,
}

/// One recorded message
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub seq: u64,
    pub direction: Direction,
    /// Time since the history was created
    pub elapsed: Duration,
    /// Call action, or the action of the call a result answers
    pub action: Option<String>,
    pub message: OcppMessage,
}

impl HistoryEntry {
    pub fn payload(&self) -> &Value {
        self.message.payload()
    }

    pub fn from_station(&self) -> bool {
        self.direction == Direction::StationToCsms
    }

    pub fn describe(&self) -> String {
        format!(
            "[+{:.3}s] {} {}",
            self.elapsed.as_secs_f64(),
            self.direction,
            self.message
        )
    }
}

/// Custom comparison of an entry against the expected payload
pub type Validator = dyn Fn(&HistoryEntry, &Value) -> bool + Send + Sync;

struct State {
    log: Vec<HistoryEntry>,
    fifo: VecDeque<HistoryEntry>,
    next_seq: u64,
    forbidden: HashSet<String>,
    mode: ValidationMode,
}

impl State {
    fn forbidden_action(&self, action: &str) -> AssertionError {
        AssertionError::ForbiddenAction {
            action: action.to_string(),
            history: self.log.iter().map(HistoryEntry::describe).collect(),
        }
    }
}

/// Recorded OCPP traffic of one station connection
pub struct MessageHistory {
    state: Mutex<State>,
    arrivals: Notify,
    started: Instant,
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageHistory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                log: Vec::new(),
                fifo: VecDeque::new(),
                next_seq: 0,
                forbidden: HashSet::new(),
                mode: ValidationMode::Easy,
            }),
            arrivals: Notify::new(),
            started: Instant::now(),
        }
    }

    /// Append a message, returning its sequence number
    pub fn record(&self, direction: Direction, action: Option<String>, message: OcppMessage) -> u64 {
        let seq = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            let entry = HistoryEntry {
                seq,
                direction,
                elapsed: self.started.elapsed(),
                action,
                message,
            };
            if entry.from_station() {
                state.fifo.push_back(entry.clone());
            }
            state.log.push(entry);
            seq
        };
        self.arrivals.notify_waiters();
        seq
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.log.clear();
        state.fifo.clear();
    }

    pub fn set_mode(&self, mode: ValidationMode) {
        self.state.lock().mode = mode;
    }

    pub fn mode(&self) -> ValidationMode {
        self.state.lock().mode
    }

    /// Fail any wait that sees one of these actions arrive
    pub fn forbid<I, S>(&self, actions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock();
        state.forbidden.extend(actions.into_iter().map(Into::into));
    }

    /// Lift the ban on one action, keeping the others
    pub fn allow(&self, action: &str) -> bool {
        self.state.lock().forbidden.remove(action)
    }

    pub fn allow_all(&self) {
        self.state.lock().forbidden.clear();
    }

    /// Snapshot of everything since the last clear
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.state.lock().log.clone()
    }

    /// Station messages not consumed by an expectation yet
    pub fn pending(&self) -> Vec<HistoryEntry> {
        self.state.lock().fifo.iter().cloned().collect()
    }

    pub fn dump(&self) -> Vec<String> {
        self.state.lock().log.iter().map(HistoryEntry::describe).collect()
    }

    /// Wait for a station message of `action` matching `expected`
    ///
    /// Returns `Ok(false)` on timeout. A forbidden arrival, or a mismatch
    /// in strict mode, is an error.
    pub async fn wait_for_and_validate(
        &self,
        action: &str,
        expected: &Value,
        validator: Option<&Validator>,
        timeout: Duration,
    ) -> Result<bool, AssertionError> {
        let deadline = Instant::now() + timeout;
        let matches = |entry: &HistoryEntry| {
            entry.action.as_deref() == Some(action)
                && match validator {
                    Some(v) => v(entry, expected),
                    None => payload_matches(expected, entry.payload()),
                }
        };

        let mut cursor = {
            let mut state = self.state.lock();
            if state.forbidden.contains(action) {
                return Err(state.forbidden_action(action));
            }
            // queued entries are checked the same way as new arrivals
            let mut hit = None;
            for (pos, entry) in state.fifo.iter().enumerate() {
                if let Some(a) = entry.action.as_deref().filter(|a| state.forbidden.contains(*a)) {
                    return Err(state.forbidden_action(a));
                }
                if matches(entry) {
                    hit = Some(pos);
                    break;
                }
                if state.mode == ValidationMode::Strict {
                    return Err(AssertionError::Failed {
                        expected: describe_expectation(action, expected),
                        observed: entry.describe(),
                        history: state.log.iter().map(HistoryEntry::describe).collect(),
                    });
                }
            }
            if let Some(pos) = hit {
                state.fifo.remove(pos);
                return Ok(true);
            }
            state.next_seq
        };

        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                let arrivals: Vec<HistoryEntry> = state.fifo.iter().filter(|e| e.seq >= cursor).cloned().collect();

                for entry in arrivals {
                    cursor = entry.seq + 1;

                    if let Some(a) = entry.action.as_deref().filter(|a| state.forbidden.contains(*a)) {
                        return Err(state.forbidden_action(a));
                    }

                    if matches(&entry) {
                        state.fifo.retain(|e| e.seq != entry.seq);
                        return Ok(true);
                    }

                    if state.mode == ValidationMode::Strict {
                        return Err(AssertionError::Failed {
                            expected: describe_expectation(action, expected),
                            observed: entry.describe(),
                            history: state.log.iter().map(HistoryEntry::describe).collect(),
                        });
                    }
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(false),
            }
        }
    }

    /// Like [`MessageHistory::wait_for_and_validate`] with a timeout reported as failure
    pub async fn expect(
        &self,
        action: &str,
        expected: &Value,
        validator: Option<&Validator>,
        timeout: Duration,
    ) -> Result<(), AssertionError> {
        if self.wait_for_and_validate(action, expected, validator, timeout).await? {
            return Ok(());
        }

        let state = self.state.lock();
        let observed = state
            .fifo
            .iter()
            .rev()
            .find(|e| e.action.as_deref() == Some(action))
            .or_else(|| state.fifo.back())
            .map(HistoryEntry::describe)
            .unwrap_or_else(|| "no station messages".to_string());

        Err(AssertionError::Failed {
            expected: describe_expectation(action, expected),
            observed,
            history: state.log.iter().map(HistoryEntry::describe).collect(),
        })
    }
}

fn describe_expectation(action: &str, expected: &Value) -> String {
    format!("{} {}", action, expected)
}

/// Structural comparison of an expected payload against an actual one
///
/// Null and absent fields in `expected` are ignored, objects match when every
/// remaining expected field matches, arrays must match element-wise and
/// numbers compare by value (`16` equals `16.0`).
pub fn payload_matches(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Null, _) => true,
        (Value::Object(exp), Value::Object(act)) => exp.iter().all(|(key, exp_value)| {
            if exp_value.is_null() {
                return true;
            }
            act.get(key).map_or(false, |act_value| payload_matches(exp_value, act_value))
        }),
        (Value::Array(exp), Value::Array(act)) => {
            exp.len() == act.len() && exp.iter().zip(act).all(|(e, a)| payload_matches(e, a))
        }
        (Value::Number(e), Value::Number(a)) => match (e.as_f64(), a.as_f64()) {
            (Some(e), Some(a)) => (e - a).abs() < 1e-9,
            _ => e == a,
        },
        _ => expected == actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::messages::{Call, CallResult};
    use serde_json::json;
    use std::sync::Arc;

    fn station_call(history: &MessageHistory, action: &str, payload: Value) {
        let call = Call::new(action, payload).unwrap();
        history.record(Direction::StationToCsms, Some(action.to_string()), call.into());
    }

    #[test]
    fn test_payload_subset_matching() {
        let actual = json!({"connectorId": 1, "status": "Charging", "errorCode": "NoError", "info": null});
        assert!(payload_matches(&json!({"status": "Charging"}), &actual));
        assert!(payload_matches(&json!({"status": "Charging", "vendorId": null}), &actual));
        assert!(!payload_matches(&json!({"status": "Available"}), &actual));
        assert!(!payload_matches(&json!({"missing": 1}), &actual));
        assert!(payload_matches(&json!({"connectorId": 1.0}), &actual));
        assert!(!payload_matches(&json!({"list": [1]}), &json!({"list": [1, 2]})));
    }

    #[tokio::test]
    async fn test_easy_mode_finds_earlier_message() {
        let history = MessageHistory::new();
        station_call(&history, "BootNotification", json!({"reason": "PowerUp"}));
        station_call(&history, "StatusNotification", json!({"status": "Available"}));

        let found = history
            .wait_for_and_validate("StatusNotification", &json!({"status": "Available"}), None, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(found);

        // consumed entries cannot satisfy a second wait
        let again = history
            .wait_for_and_validate("StatusNotification", &json!({"status": "Available"}), None, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!again);
        assert_eq!(history.pending().len(), 1);
        assert_eq!(history.entries().len(), 2);
    }

    #[tokio::test]
    async fn test_waits_for_late_arrival() {
        let history = Arc::new(MessageHistory::new());
        let h = history.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            station_call(&h, "Heartbeat", json!({}));
            station_call(&h, "StatusNotification", json!({"status": "Charging"}));
        });

        let found = history
            .wait_for_and_validate("StatusNotification", &json!({"status": "Charging"}), None, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(found);
        // the skipped heartbeat stays available
        assert_eq!(history.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_forbidden_action_aborts_wait() {
        let history = Arc::new(MessageHistory::new());
        history.forbid(["StartTransaction"]);
        let h = history.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            station_call(&h, "StartTransaction", json!({"connectorId": 1}));
        });

        let err = history
            .wait_for_and_validate("StopTransaction", &json!({}), None, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, AssertionError::ForbiddenAction { ref action, .. } if action == "StartTransaction"));
    }

    #[tokio::test]
    async fn test_forbidden_action_queued_before_wait() {
        let history = MessageHistory::new();
        station_call(&history, "StartTransaction", json!({"connectorId": 1}));
        history.forbid(["StartTransaction"]);

        let err = history
            .wait_for_and_validate("StartTransaction", &json!({}), None, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AssertionError::ForbiddenAction { ref action, .. } if action == "StartTransaction"));

        // an earlier queued forbidden message also fails waits for other actions
        station_call(&history, "Heartbeat", json!({}));
        let err = history
            .wait_for_and_validate("Heartbeat", &json!({}), None, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AssertionError::ForbiddenAction { .. }));
        assert_eq!(history.pending().len(), 2);
    }

    #[tokio::test]
    async fn test_forbidden_expected_action_never_matches() {
        let history = MessageHistory::new();
        history.forbid(["Authorize"]);
        let err = history
            .wait_for_and_validate("Authorize", &json!({}), None, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AssertionError::ForbiddenAction { ref action, .. } if action == "Authorize"));
    }

    #[tokio::test]
    async fn test_allow_lifts_one_action() {
        let history = MessageHistory::new();
        history.forbid(["TransactionEvent", "Authorize"]);
        assert!(history.allow("TransactionEvent"));
        assert!(!history.allow("TransactionEvent"));

        station_call(&history, "TransactionEvent", json!({"eventType": "Ended"}));
        assert!(history
            .wait_for_and_validate("TransactionEvent", &json!({"eventType": "Ended"}), None, Duration::from_millis(10))
            .await
            .unwrap());

        station_call(&history, "Authorize", json!({}));
        let err = history
            .wait_for_and_validate("Heartbeat", &json!({}), None, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AssertionError::ForbiddenAction { ref action, .. } if action == "Authorize"));
    }

    #[tokio::test]
    async fn test_strict_mode_fails_on_mismatch() {
        let history = MessageHistory::new();
        history.set_mode(ValidationMode::Strict);
        station_call(&history, "Heartbeat", json!({}));

        let err = history
            .wait_for_and_validate("StatusNotification", &json!({}), None, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AssertionError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_custom_validator_and_call_results() {
        let history = MessageHistory::new();
        let result = CallResult::new("uid-1", json!({"status": "Accepted"})).unwrap();
        history.record(
            Direction::StationToCsms,
            Some("RemoteStopTransaction".to_string()),
            result.into(),
        );

        let validator = |entry: &HistoryEntry, _: &Value| entry.payload()["status"] == "Accepted";
        let found = history
            .wait_for_and_validate("RemoteStopTransaction", &Value::Null, Some(&validator), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(found);
    }

    #[tokio::test]
    async fn test_expect_reports_history_on_timeout() {
        let history = MessageHistory::new();
        station_call(&history, "StatusNotification", json!({"status": "Faulted"}));

        let err = history
            .expect("StatusNotification", &json!({"status": "Available"}), None, Duration::from_millis(10))
            .await
            .unwrap_err();
        match err {
            AssertionError::Failed { observed, history, .. } => {
                assert!(observed.contains("Faulted"));
                assert_eq!(history.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clear_discards_history() {
        let history = MessageHistory::new();
        station_call(&history, "Heartbeat", json!({}));
        history.clear();
        assert!(history.entries().is_empty());
        assert!(!history
            .wait_for_and_validate("Heartbeat", &json!({}), None, Duration::from_millis(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_csms_messages_are_not_candidates() {
        let history = MessageHistory::new();
        let call = Call::new("Reset", json!({"type": "Soft"})).unwrap();
        history.record(Direction::CsmsToStation, Some("Reset".to_string()), call.into());
        assert!(!history
            .wait_for_and_validate("Reset", &json!({}), None, Duration::from_millis(5))
            .await
            .unwrap());
        assert_eq!(history.dump().len(), 1);
    }
}
