//! EVerest integration-test harness
//!
//! Boots EVerest with a composed configuration, attaches a mock CSMS and a
//! probe module, and drives scenarios through simulation controls:
//! - [`config`]: config composition for EVerest and the OCPP station
//! - [`supervisor`]: the EVerest manager process
//! - [`runner`]: per-scenario session fixture
//! - [`scenarios`]: built-in scenario catalogue and suite runner

pub mod config;
pub mod controls;
pub mod error;
pub mod report;
pub mod runner;
pub mod scenarios;
pub mod supervisor;

pub use controls::SimulationControl;
pub use error::HarnessError;
pub use report::SuiteResults;
pub use runner::{HarnessConfig, SessionPlan, TestSession};
pub use scenarios::{get_scenario, list_scenarios, run_suite, Scenario, ScenarioResult, ScenarioRunner};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorError};
