//! OCPP protocol layer shared by the mock and the scenarios
//!
//! - `messages`: OCPP-J framing (CALL, CALLRESULT, CALLERROR)
//! - `version`: 1.6 / 2.0.1 / 2.1 tags and their action sets
//! - `types`: typed payloads the scenarios send and expect
//! - `schema`: request payload validation
//! - `composite`: reference composite-schedule calculator

pub mod composite;
pub mod messages;
pub mod schema;
pub mod types;
pub mod version;

pub use composite::{composite_schedule, CompositeRequest, InstalledProfile};
pub use messages::*;
pub use schema::{SchemaError, SchemaRegistry};
pub use types::*;
pub use version::OcppVersion;
