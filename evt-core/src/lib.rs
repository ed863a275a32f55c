//! EVerest test core
//!
//! Bus plumbing shared by the OCPP mock and the harness:
//! - [`bus`]: publish/subscribe abstraction and an in-process bus
//! - [`mqtt`]: MQTT client behind the same trait
//! - [`probe`]: test-controlled module speaking the EVerest command protocol
//! - [`error_record`]: module error records and history queries

pub mod bus;
pub mod error_record;
pub mod mqtt;
pub mod probe;
pub mod topic;
pub mod types;

pub use bus::{BusError, BusMessage, LocalBus, MessageBus, MessageBusExt, SubscriptionId};
pub use error_record::{
    ErrorFilter, ErrorRecord, ErrorRegistry, ErrorState, ImplementationIdentifier, Severity,
    SeverityFilter,
};
pub use mqtt::{MqttBus, MqttSettings};
pub use probe::{ProbeConfig, ProbeError, ProbeModule, VariableQueue};
pub use types::{Connections, Fulfillment, RemoteErrorKind, RemoteFailure, Topics};
