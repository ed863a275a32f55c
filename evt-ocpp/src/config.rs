//! Configuration for the CSMS mock
//!
//! Built with the same `new(..).with_*()` chain the scenario runner uses for
//! every other component.

use crate::ocpp::schema::SchemaRegistry;
use crate::ocpp::version::OcppVersion;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Complete mock configuration
#[derive(Debug, Clone)]
pub struct CsmsConfig {
    /// Listen address; port 0 picks an ephemeral port
    pub bind_addr: SocketAddr,

    /// Protocol version spoken to the station
    pub version: OcppVersion,

    /// Only accept this station identity (last path segment), any if unset
    pub station_id: Option<String>,

    /// How long a CSMS-initiated call waits for the station's answer
    pub response_timeout: Duration,

    /// Validate station request payloads against the schema registry
    pub validate_payloads: bool,

    /// Keep every station Call for later inspection
    pub record_calls: bool,

    /// Maximum WebSocket message size
    pub max_message_size: usize,

    /// Request schemas used for validation
    pub schemas: Arc<SchemaRegistry>,
}

impl Default for CsmsConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            version: OcppVersion::V201,
            station_id: None,
            response_timeout: Duration::from_secs(30),
            validate_payloads: true,
            record_calls: false,
            max_message_size: 16 * 1024 * 1024,
            schemas: Arc::new(SchemaRegistry::with_builtin()),
        }
    }
}

impl CsmsConfig {
    pub fn new(version: OcppVersion) -> Self {
        Self {
            version,
            ..Default::default()
        }
    }

    /// Listen on a fixed port
    pub fn with_port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_station_id(mut self, station_id: impl Into<String>) -> Self {
        self.station_id = Some(station_id.into());
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Accept any payload without schema checks
    pub fn without_validation(mut self) -> Self {
        self.validate_payloads = false;
        self
    }

    pub fn with_recording(mut self) -> Self {
        self.record_calls = true;
        self
    }

    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = Arc::new(schemas);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = CsmsConfig::new(OcppVersion::V16)
            .with_port(9000)
            .with_station_id("cp001")
            .with_response_timeout(Duration::from_secs(5))
            .with_recording();

        assert_eq!(config.version, OcppVersion::V16);
        assert_eq!(config.bind_addr.port(), 9000);
        assert!(config.bind_addr.ip().is_loopback());
        assert_eq!(config.station_id.as_deref(), Some("cp001"));
        assert_eq!(config.response_timeout, Duration::from_secs(5));
        assert!(config.record_calls);
        assert!(config.validate_payloads);
    }

    #[test]
    fn test_defaults() {
        let config = CsmsConfig::default();
        assert_eq!(config.bind_addr.port(), 0);
        assert_eq!(config.version, OcppVersion::V201);
        assert!(!config.schemas.is_empty());
        assert!(!CsmsConfig::default().without_validation().validate_payloads);
    }
}
