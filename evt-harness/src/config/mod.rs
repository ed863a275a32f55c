//! Config Composer
//!
//! A template plus an ordered chain of adjustments becomes the configuration
//! written for one session. Three documents are composed this way: the
//! EVerest YAML config, the OCPP 1.6 JSON config and the OCPP 2.x device
//! model. Adjustments take the running config by value and hand back a new
//! one, the template itself is never touched.

pub mod everest;
pub mod ocpp;
pub mod paths;
pub mod strategies;

pub use everest::{ConfigAccess, EverestConfig, ModuleAccess, ModuleDescriptor, PeerRef};
pub use ocpp::{
    ComponentConfig, DeviceModel, GenericVariableOverride, Ocpp16Config, Ocpp16KeyOverride,
    OcppNetworkProfile, VariableConfig, VariableOverride,
};
pub use paths::SessionPaths;
pub use strategies::{
    adjustment_fn, compose, Adjustment, EvseSecurityRelocate, ModuleAccessGrant, OcppModulePaths,
    PersistentStoreRedirect, ProbeModuleInjection,
};

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no active module {0}")]
    UnknownModule(String),

    #[error("module {module} requirement {requirement} points at missing module {peer}")]
    DanglingConnection {
        module: String,
        requirement: String,
        peer: String,
    },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("no variable {variable} in component {component}")]
    UnknownVariable { component: String, variable: String },

    #[error("CSV line {line}: {reason}")]
    Csv { line: usize, reason: String },
}

impl ConfigError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
        move |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub(crate) fn read_to_string(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(ConfigError::io(path))
}

/// Write `contents`, creating parent directories as needed
pub(crate) fn write_file(path: &Path, contents: &str) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(ConfigError::io(parent))?;
    }
    std::fs::write(path, contents).map_err(ConfigError::io(path))
}
