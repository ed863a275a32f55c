//! # evt-ocpp
//!
//! Server side of OCPP 1.6 / 2.0.1 / 2.1 for EVerest integration tests.
//!
//! ## Architecture
//!
//! ```text
//! EVerest OCPP module (station)
//!       │ WebSocket, OCPP-J
//!       ▼
//! ┌─────────────────────────────────────┐
//! │  CsmsMock                           │
//! │  ┌──────────┐  ┌─────────────────┐  │
//! │  │ framing  │─►│ HandlerTable    │  │
//! │  │ + schema │  │ (per version)   │  │
//! │  └──────────┘  └─────────────────┘  │
//! │        │                            │
//! │        ▼                            │
//! │  MessageHistory ◄── wait_for_and_validate
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use evt_ocpp::{CsmsConfig, CsmsMock, OcppVersion};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let csms = CsmsMock::start(CsmsConfig::new(OcppVersion::V16)).await?;
//!     println!("point the station at {}", csms.url());
//!
//!     csms.wait_for_connection(Duration::from_secs(30)).await?;
//!     csms.expect("BootNotification", &json!({}), Duration::from_secs(30)).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod csms;
pub mod ocpp;

pub use config::CsmsConfig;
pub use csms::{
    AssertionError, Direction, Handler, HandlerContext, HandlerError, HandlerTable, HistoryEntry, MessageHistory,
    CsmsMock, RecordedCall, ValidationMode,
};
pub use ocpp::{CallError, ErrorCode, FrameError, OcppError, OcppMessage, OcppVersion, SchemaRegistry};
