//! Per-session directory tree

use super::{write_file, ConfigError};
use evt_ocpp::OcppVersion;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where one session keeps its configs, logs, databases and certificates
///
/// ```text
/// <root>/
///   everest_config.yaml
///   ocpp_config/
///     config.json              1.6
///     user_config.json         1.6
///     component_config/        2.x: standardized/ and custom/
///     logs/
///   certs/
///   persistent_storage/persistent_store.db
/// ```
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub root: PathBuf,
    pub version: OcppVersion,
    pub everest_config_file: PathBuf,
    pub ocpp_config_dir: PathBuf,
    pub ocpp_config_file: PathBuf,
    pub ocpp_user_config_file: PathBuf,
    pub component_config_dir: PathBuf,
    pub ocpp_logs_dir: PathBuf,
    pub ocpp_database_dir: PathBuf,
    pub certs_dir: PathBuf,
    pub persistent_store_db: PathBuf,
}

impl SessionPaths {
    /// Paths below `root` without touching the filesystem
    pub fn new(root: impl Into<PathBuf>, version: OcppVersion) -> Self {
        let root = root.into();
        let ocpp_config_dir = root.join("ocpp_config");
        Self {
            everest_config_file: root.join("everest_config.yaml"),
            ocpp_config_file: ocpp_config_dir.join("config.json"),
            ocpp_user_config_file: ocpp_config_dir.join("user_config.json"),
            component_config_dir: ocpp_config_dir.join("component_config"),
            ocpp_logs_dir: ocpp_config_dir.join("logs"),
            ocpp_database_dir: ocpp_config_dir.clone(),
            certs_dir: root.join("certs"),
            persistent_store_db: root.join("persistent_storage").join("persistent_store.db"),
            ocpp_config_dir,
            version,
            root,
        }
    }

    /// Create the tree, with the component dirs for 2.x and an empty user config for 1.6
    pub fn create(root: impl Into<PathBuf>, version: OcppVersion) -> Result<Self, ConfigError> {
        let paths = Self::new(root, version);

        let mut dirs = vec![paths.ocpp_logs_dir.clone(), paths.certs_dir.clone()];
        if let Some(store_dir) = paths.persistent_store_db.parent() {
            dirs.push(store_dir.to_path_buf());
        }
        if version.is_v16() {
            write_file(&paths.ocpp_user_config_file, "{}")?;
        } else {
            dirs.push(paths.component_config_dir.join("standardized"));
            dirs.push(paths.component_config_dir.join("custom"));
        }
        for dir in &dirs {
            std::fs::create_dir_all(dir).map_err(ConfigError::io(dir))?;
        }

        debug!("Created session tree at {}", paths.root.display());
        Ok(paths)
    }

    /// Settings for the OCPP module pointing into this tree
    pub fn ocpp_module_paths(&self) -> BTreeMap<String, PathBuf> {
        let mut paths = BTreeMap::new();
        paths.insert("MessageLogPath".to_string(), self.ocpp_logs_dir.clone());
        if self.version.is_v16() {
            paths.insert("ChargePointConfigPath".to_string(), self.ocpp_config_file.clone());
            paths.insert("UserConfigPath".to_string(), self.ocpp_user_config_file.clone());
            paths.insert("DatabasePath".to_string(), self.ocpp_database_dir.clone());
        } else {
            paths.insert("DeviceModelConfigPath".to_string(), self.component_config_dir.clone());
            paths.insert("CoreDatabasePath".to_string(), self.ocpp_database_dir.clone());
            paths.insert(
                "DeviceModelDatabasePath".to_string(),
                self.ocpp_database_dir.join("device_model_storage.db"),
            );
        }
        paths
    }

    /// Copy a certificate tree into `certs/`, returning the number of files copied
    pub fn copy_certs(&self, source: &Path) -> Result<usize, ConfigError> {
        let copied = copy_tree(source, &self.certs_dir)?;
        debug!("Copied {} certificate files from {}", copied, source.display());
        Ok(copied)
    }
}

fn copy_tree(source: &Path, target: &Path) -> Result<usize, ConfigError> {
    std::fs::create_dir_all(target).map_err(ConfigError::io(target))?;
    let mut copied = 0;
    for entry in std::fs::read_dir(source).map_err(ConfigError::io(source))? {
        let entry = entry.map_err(ConfigError::io(source))?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        if from.is_dir() {
            copied += copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(ConfigError::io(&from))?;
            copied += 1;
        }
    }
    Ok(copied)
}
