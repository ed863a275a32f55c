//! Top-level error for sessions and scenarios

use crate::config::ConfigError;
use crate::supervisor::SupervisorError;
use evt_core::{BusError, ProbeError};
use evt_ocpp::{AssertionError, OcppError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("supervisor: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("probe: {0}")]
    Probe(#[from] ProbeError),

    #[error("message bus: {0}")]
    Bus(#[from] BusError),

    #[error("csms: {0}")]
    Ocpp(#[from] OcppError),

    #[error("assertion: {0}")]
    Assertion(#[from] AssertionError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("{0} is not configured")]
    NotConfigured(String),

    #[error("session has no probe module")]
    NoProbe,

    #[error("check failed: {0}")]
    Check(String),
}

impl HarnessError {
    pub fn check(message: impl Into<String>) -> Self {
        HarnessError::Check(message.into())
    }

    /// Whether a retry of the transport step may succeed
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HarnessError::Bus(BusError::Disconnected)
                | HarnessError::Probe(ProbeError::TransportFailed(_))
                | HarnessError::Ocpp(OcppError::ConnectionClosed)
                | HarnessError::Ocpp(OcppError::NotConnected)
        )
    }
}
