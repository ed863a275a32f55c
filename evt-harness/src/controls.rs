//! Simulation controls
//!
//! Signalling events injected into the running EVerest over the message bus,
//! bypassing OCPP. Each control expands to a fixed list of topic/payload
//! pairs which are published in order.

use evt_core::{BusError, MessageBus};
use serde_json::json;
use tracing::debug;

/// Plug in, draw 16 A on three phases, unplug after 200 s
pub const AC_SESSION: &str = "sleep 1;iec_wait_pwr_ready;sleep 1;draw_power_regulated 16,3;sleep 200;unplug";

/// ISO 15118 AC session, stopped by the car after 20 s
pub const ISO_SESSION: &str = "sleep 1;iso_wait_slac_matched;iso_start_v2g_session AC;iso_wait_pwr_ready;\
iso_draw_power_regulated 16,3;sleep 20;iso_stop_charging;iso_wait_v2g_session_stopped;unplug";

#[derive(Debug, Clone, PartialEq)]
pub enum SimulationControl {
    /// Switch the car simulator of a connector on or off
    Enable { connector: u32, enabled: bool },
    /// Enable the simulator and start the default AC session
    PlugIn { connector: u32 },
    /// Enable the simulator and start the default ISO 15118 session
    PlugInIso { connector: u32 },
    /// Run a semicolon separated simulator script
    ChargingSession { connector: u32, script: String },
    PlugOut { connector: u32 },
    /// Change the running session, e.g. `unplug`
    ModifySession { connector: u32, action: String },
    /// Present an RFID token to the given connectors (all when empty)
    Swipe { token: String, connectors: Vec<u32> },
    RaiseError { connector: u32, error_type: String },
    ClearError { connector: u32, error_type: String },
    OcppConnect,
    OcppDisconnect,
    Publish { topic: String, payload: String },
}

impl SimulationControl {
    pub fn swipe(token: impl Into<String>, connectors: impl Into<Vec<u32>>) -> Self {
        SimulationControl::Swipe {
            token: token.into(),
            connectors: connectors.into(),
        }
    }

    pub fn publish(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        SimulationControl::Publish {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Topic/payload pairs for this control, topics prefixed with `external_prefix`
    pub fn messages(&self, external_prefix: &str) -> Vec<(String, String)> {
        let carsim = |connector: u32, suffix: &str| {
            format!("{}everest_external/nodered/{}/carsim/{}", external_prefix, connector, suffix)
        };
        let api = |suffix: &str| format!("{}everest_api/{}", external_prefix, suffix);
        let enable = |connector: u32| (carsim(connector, "cmd/enable"), "true".to_string());
        let session = |connector: u32, script: &str| {
            (carsim(connector, "cmd/execute_charging_session"), script.to_string())
        };
        let error = |connector: u32, error_type: &str, raise: bool| {
            let payload = json!({"error_type": error_type, "raise": raise.to_string()});
            (carsim(connector, "error"), payload.to_string())
        };

        match self {
            SimulationControl::Enable { connector, enabled } => {
                vec![(carsim(*connector, "cmd/enable"), enabled.to_string())]
            }
            SimulationControl::PlugIn { connector } => vec![enable(*connector), session(*connector, AC_SESSION)],
            SimulationControl::PlugInIso { connector } => {
                vec![enable(*connector), session(*connector, ISO_SESSION)]
            }
            SimulationControl::ChargingSession { connector, script } => vec![session(*connector, script.as_str())],
            SimulationControl::PlugOut { connector } => {
                vec![(carsim(*connector, "cmd/modify_charging_session"), "unplug".to_string())]
            }
            SimulationControl::ModifySession { connector, action } => {
                vec![(carsim(*connector, "cmd/modify_charging_session"), action.clone())]
            }
            SimulationControl::Swipe { token, connectors } => {
                let payload = json!({
                    "id_token": {"value": token, "type": "ISO14443"},
                    "authorization_type": "RFID",
                    "connectors": connectors,
                });
                vec![(api("dummy_token_provider/cmd/provide"), payload.to_string())]
            }
            SimulationControl::RaiseError { connector, error_type } => vec![error(*connector, error_type.as_str(), true)],
            SimulationControl::ClearError { connector, error_type } => vec![error(*connector, error_type.as_str(), false)],
            SimulationControl::OcppConnect => vec![(api("ocpp/cmd/connect"), "true".to_string())],
            SimulationControl::OcppDisconnect => vec![(api("ocpp/cmd/disconnect"), "true".to_string())],
            SimulationControl::Publish { topic, payload } => vec![(topic.clone(), payload.clone())],
        }
    }

    /// Publish every message of this control in order
    pub fn fire(&self, bus: &dyn MessageBus, external_prefix: &str) -> Result<(), BusError> {
        for (topic, payload) in self.messages(external_prefix) {
            debug!("Control {} <- {}", topic, payload);
            bus.publish(&topic, payload.into_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evt_core::{LocalBus, MessageBusExt};
    use serde_json::Value;
    use tokio::sync::mpsc;

    #[test]
    fn test_plug_in_expands_to_enable_and_session() {
        let messages = SimulationControl::PlugIn { connector: 1 }.messages("");
        assert_eq!(
            messages,
            vec![
                ("everest_external/nodered/1/carsim/cmd/enable".to_string(), "true".to_string()),
                (
                    "everest_external/nodered/1/carsim/cmd/execute_charging_session".to_string(),
                    AC_SESSION.to_string()
                ),
            ]
        );
        assert!(ISO_SESSION.contains("iso_start_v2g_session AC;iso_wait_pwr_ready"));
    }

    #[test]
    fn test_swipe_payload() {
        let messages = SimulationControl::swipe("DEADBEEF", vec![1]).messages("test/");
        assert_eq!(messages[0].0, "test/everest_api/dummy_token_provider/cmd/provide");
        let payload: Value = serde_json::from_str(&messages[0].1).unwrap();
        assert_eq!(payload["id_token"]["value"], "DEADBEEF");
        assert_eq!(payload["id_token"]["type"], "ISO14443");
        assert_eq!(payload["authorization_type"], "RFID");
        assert_eq!(payload["connectors"], json!([1]));
    }

    #[test]
    fn test_error_controls() {
        let raise = SimulationControl::RaiseError {
            connector: 2,
            error_type: "MREC6UnderVoltage".to_string(),
        }
        .messages("");
        assert_eq!(raise[0].0, "everest_external/nodered/2/carsim/error");
        let payload: Value = serde_json::from_str(&raise[0].1).unwrap();
        assert_eq!(payload, json!({"error_type": "MREC6UnderVoltage", "raise": "true"}));

        let clear = SimulationControl::ClearError {
            connector: 2,
            error_type: "MREC6UnderVoltage".to_string(),
        }
        .messages("");
        let payload: Value = serde_json::from_str(&clear[0].1).unwrap();
        assert_eq!(payload["raise"], "false");
    }

    #[tokio::test]
    async fn test_fire_publishes_in_order() {
        let bus = LocalBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe_fn("#", move |msg| {
            let _ = tx.send(msg.topic.clone());
        })
        .unwrap();

        SimulationControl::PlugInIso { connector: 1 }.fire(&*bus, "").unwrap();
        SimulationControl::OcppDisconnect.fire(&*bus, "").unwrap();

        assert!(rx.recv().await.unwrap().ends_with("cmd/enable"));
        assert!(rx.recv().await.unwrap().ends_with("cmd/execute_charging_session"));
        assert_eq!(rx.recv().await.unwrap(), "everest_api/ocpp/cmd/disconnect");
    }
}
