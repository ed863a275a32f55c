//! Adjustment chain and the EVerest config strategies

use super::everest::{ConfigAccess, EverestConfig, ModuleAccess, ModuleDescriptor, PeerRef};
use super::ConfigError;
use evt_core::Connections;
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One step of a composition chain
pub trait Adjustment<C>: Send + Sync {
    fn name(&self) -> &str;

    /// Return the adjusted config. `config` is the chain's own copy.
    fn apply(&self, config: C) -> Result<C, ConfigError>;
}

/// Apply `chain` in order to a copy of `template`
pub fn compose<C: Clone>(template: &C, chain: &[Box<dyn Adjustment<C>>]) -> Result<C, ConfigError> {
    chain.iter().try_fold(template.clone(), |config, adjustment| {
        debug!("Applying {}", adjustment.name());
        adjustment.apply(config)
    })
}

struct FnAdjustment<F> {
    name: String,
    f: F,
}

impl<C, F> Adjustment<C> for FnAdjustment<F>
where
    F: Fn(C) -> Result<C, ConfigError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, config: C) -> Result<C, ConfigError> {
        (self.f)(config)
    }
}

/// Wrap a closure as a named adjustment
pub fn adjustment_fn<C, F>(name: impl Into<String>, f: F) -> Box<dyn Adjustment<C>>
where
    C: 'static,
    F: Fn(C) -> Result<C, ConfigError> + Send + Sync + 'static,
{
    Box::new(FnAdjustment { name: name.into(), f })
}

// ============================================================================
// Probe module
// ============================================================================

pub const PROBE_MODULE_TYPE: &str = "ProbeModule";

/// Add the probe as an active module wired to the given peers
#[derive(Debug, Clone)]
pub struct ProbeModuleInjection {
    pub module_id: String,
    pub connections: Connections,
}

impl ProbeModuleInjection {
    pub fn new(module_id: impl Into<String>, connections: Connections) -> Self {
        Self {
            module_id: module_id.into(),
            connections,
        }
    }
}

impl Adjustment<EverestConfig> for ProbeModuleInjection {
    fn name(&self) -> &str {
        "probe-module-injection"
    }

    fn apply(&self, mut config: EverestConfig) -> Result<EverestConfig, ConfigError> {
        let mut descriptor = ModuleDescriptor::new(PROBE_MODULE_TYPE);
        descriptor.connections = self
            .connections
            .iter()
            .map(|(req, peers)| (req.clone(), peers.iter().map(PeerRef::from).collect()))
            .collect();
        config.insert_module(self.module_id.clone(), descriptor);
        Ok(config)
    }
}

// ============================================================================
// Persistent store
// ============================================================================

/// Point every PersistentStore module at `db_path`
#[derive(Debug, Clone)]
pub struct PersistentStoreRedirect {
    pub db_path: PathBuf,
}

impl PersistentStoreRedirect {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self { db_path: db_path.into() }
    }
}

impl Adjustment<EverestConfig> for PersistentStoreRedirect {
    fn name(&self) -> &str {
        "persistent-store-redirect"
    }

    fn apply(&self, mut config: EverestConfig) -> Result<EverestConfig, ConfigError> {
        let ids: Vec<String> = config.modules_of_type("PersistentStore").map(str::to_string).collect();
        if ids.is_empty() {
            debug!("No PersistentStore module to redirect");
        }
        for id in ids {
            config
                .module_mut(&id)?
                .set_config("sqlite_db_file_path", path_value(&self.db_path));
        }
        Ok(config)
    }
}

// ============================================================================
// EvseSecurity
// ============================================================================

/// Certificate and key settings of EvseSecurity with their installation defaults
pub const SECURITY_PATH_KEYS: &[(&str, &str)] = &[
    ("csms_ca_bundle", "ca/csms/CSMS_ROOT_CA.pem"),
    ("mf_ca_bundle", "ca/mf/MF_ROOT_CA.pem"),
    ("mo_ca_bundle", "ca/mo/MO_ROOT_CA.pem"),
    ("v2g_ca_bundle", "ca/v2g/V2G_ROOT_CA.pem"),
    ("csms_leaf_cert_directory", "client/csms"),
    ("csms_leaf_key_directory", "client/csms"),
    ("secc_leaf_cert_directory", "client/cso"),
    ("secc_leaf_key_directory", "client/cso"),
];

/// Re-root every certificate path of the EvseSecurity module under `target_dir`
///
/// Relative paths keep their structure below the target. Absolute paths
/// inside `source_dir` are re-rooted, other absolute paths keep only their
/// file name. Paths already under the target are left alone. The target
/// itself must be absolute.
#[derive(Debug, Clone)]
pub struct EvseSecurityRelocate {
    pub module_id: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub target_dir: PathBuf,
}

impl EvseSecurityRelocate {
    pub fn new(target_dir: impl Into<PathBuf>) -> Self {
        Self {
            module_id: None,
            source_dir: None,
            target_dir: target_dir.into(),
        }
    }

    pub fn with_module_id(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    pub fn with_source_dir(mut self, source_dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(source_dir.into());
        self
    }

    fn relocate(&self, path: &Path) -> PathBuf {
        if path.is_relative() {
            return self.target_dir.join(path);
        }
        if path.starts_with(&self.target_dir) {
            return path.to_path_buf();
        }
        if let Some(rest) = self.source_dir.as_ref().and_then(|s| path.strip_prefix(s).ok()) {
            return self.target_dir.join(rest);
        }
        match path.file_name() {
            Some(name) => self.target_dir.join(name),
            None => self.target_dir.clone(),
        }
    }
}

impl Adjustment<EverestConfig> for EvseSecurityRelocate {
    fn name(&self) -> &str {
        "evse-security-relocate"
    }

    fn apply(&self, mut config: EverestConfig) -> Result<EverestConfig, ConfigError> {
        // a relative target would be joined again on every application
        if self.target_dir.is_relative() {
            return Err(ConfigError::InvalidValue {
                key: "target_dir".to_string(),
                reason: format!("{} is not an absolute path", self.target_dir.display()),
            });
        }
        let first_security = config
            .modules_of_type("EvseSecurity")
            .next()
            .map(str::to_string);
        let id = match &self.module_id {
            Some(id) => id.clone(),
            None => match first_security {
                Some(id) => id,
                None => {
                    debug!("No EvseSecurity module to relocate");
                    return Ok(config);
                }
            },
        };

        let module = config.module_mut(&id)?;
        for (key, default) in SECURITY_PATH_KEYS {
            let current = match module.config_module.get(*key) {
                Some(YamlValue::String(s)) => PathBuf::from(s),
                Some(YamlValue::Null) | None => PathBuf::from(default),
                Some(other) => {
                    return Err(ConfigError::InvalidValue {
                        key: format!("{}.{}", id, key),
                        reason: format!("expected a path, found {:?}", other),
                    })
                }
            };
            module.set_config(*key, path_value(&self.relocate(&current)));
        }
        Ok(config)
    }
}

// ============================================================================
// Module access and OCPP paths
// ============================================================================

/// Enable global config read/write and read-only set on one module
#[derive(Debug, Clone)]
pub struct ModuleAccessGrant {
    pub module_id: String,
}

impl ModuleAccessGrant {
    pub fn new(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
        }
    }
}

impl Adjustment<EverestConfig> for ModuleAccessGrant {
    fn name(&self) -> &str {
        "module-access-grant"
    }

    fn apply(&self, mut config: EverestConfig) -> Result<EverestConfig, ConfigError> {
        let module = config.module_mut(&self.module_id)?;
        module.access = Some(ModuleAccess {
            config: Some(ConfigAccess::all()),
        });
        Ok(config)
    }
}

/// Point the OCPP module's config, log and database paths into the session tree
#[derive(Debug, Clone)]
pub struct OcppModulePaths {
    pub module_id: String,
    pub paths: BTreeMap<String, PathBuf>,
}

impl OcppModulePaths {
    pub fn new(module_id: impl Into<String>, paths: BTreeMap<String, PathBuf>) -> Self {
        Self {
            module_id: module_id.into(),
            paths,
        }
    }
}

impl Adjustment<EverestConfig> for OcppModulePaths {
    fn name(&self) -> &str {
        "ocpp-module-paths"
    }

    fn apply(&self, mut config: EverestConfig) -> Result<EverestConfig, ConfigError> {
        let module = config.module_mut(&self.module_id)?;
        for (key, path) in &self.paths {
            module.set_config(key.clone(), path_value(path));
        }
        Ok(config)
    }
}

fn path_value(path: &Path) -> YamlValue {
    YamlValue::String(path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use evt_core::Fulfillment;
    use proptest::prelude::*;

    fn template() -> EverestConfig {
        EverestConfig::from_yaml_str(
            r#"
active_modules:
  evse_manager:
    module: EvseManager
  store:
    module: PersistentStore
    config_module:
      sqlite_db_file_path: /var/lib/everest/store.db
  evse_security:
    module: EvseSecurity
    config_module:
      csms_ca_bundle: /etc/everest/certs/ca/csms/CSMS_ROOT_CA.pem
      private_key_password: "123456"
      v2g_ca_bundle: /opt/other/V2G_ROOT_CA.pem
  ocpp:
    module: OCPP
    config_module:
      ChargePointConfigPath: config-docker.json
"#,
        )
        .unwrap()
    }

    fn probe() -> ProbeModuleInjection {
        let mut connections = Connections::new();
        connections.insert("evse".to_string(), vec![Fulfillment::new("evse_manager", "evse")]);
        ProbeModuleInjection::new("probe", connections)
    }

    fn relocate() -> EvseSecurityRelocate {
        EvseSecurityRelocate::new("/tmp/session/certs").with_source_dir("/etc/everest/certs")
    }

    #[test]
    fn test_compose_leaves_template_untouched() {
        let template = template();
        let chain: Vec<Box<dyn Adjustment<EverestConfig>>> = vec![
            Box::new(probe()),
            Box::new(PersistentStoreRedirect::new("/tmp/session/persistent_store.db")),
        ];

        let composed = compose(&template, &chain).unwrap();
        assert_eq!(template, self::template());
        assert_eq!(composed.module("probe").unwrap().module, PROBE_MODULE_TYPE);
        assert_eq!(
            composed.module("store").unwrap().config_str("sqlite_db_file_path"),
            Some("/tmp/session/persistent_store.db")
        );
        composed.validate().unwrap();
    }

    #[test]
    fn test_chain_order_is_respected() {
        let chain: Vec<Box<dyn Adjustment<EverestConfig>>> = vec![
            adjustment_fn("first", |mut c: EverestConfig| {
                c.module_mut("ocpp")?.set_config("ChargePointConfigPath", "a.json");
                Ok(c)
            }),
            adjustment_fn("second", |mut c: EverestConfig| {
                c.module_mut("ocpp")?.set_config("ChargePointConfigPath", "b.json");
                Ok(c)
            }),
        ];
        let composed = compose(&template(), &chain).unwrap();
        assert_eq!(
            composed.module("ocpp").unwrap().config_str("ChargePointConfigPath"),
            Some("b.json")
        );
    }

    #[test]
    fn test_failing_step_aborts_chain() {
        let chain: Vec<Box<dyn Adjustment<EverestConfig>>> =
            vec![Box::new(ModuleAccessGrant::new("missing"))];
        assert!(matches!(
            compose(&template(), &chain),
            Err(ConfigError::UnknownModule(id)) if id == "missing"
        ));
    }

    #[test]
    fn test_evse_security_relocate() {
        let config = relocate().apply(template()).unwrap();
        let module = config.module("evse_security").unwrap();

        assert_eq!(
            module.config_str("csms_ca_bundle"),
            Some("/tmp/session/certs/ca/csms/CSMS_ROOT_CA.pem")
        );
        assert_eq!(module.config_str("v2g_ca_bundle"), Some("/tmp/session/certs/V2G_ROOT_CA.pem"));
        assert_eq!(module.config_str("mo_ca_bundle"), Some("/tmp/session/certs/ca/mo/MO_ROOT_CA.pem"));
        assert_eq!(module.config_str("secc_leaf_key_directory"), Some("/tmp/session/certs/client/cso"));
        assert_eq!(module.config_str("private_key_password"), Some("123456"));
    }

    #[test]
    fn test_evse_security_relative_target_rejected() {
        let err = EvseSecurityRelocate::new("session/certs").apply(template()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "target_dir"));

        let once = relocate().apply(template()).unwrap();
        let twice = relocate().apply(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_evse_security_missing_module_is_noop() {
        let mut config = template();
        config.active_modules.remove("evse_security");
        let adjusted = relocate().apply(config.clone()).unwrap();
        assert_eq!(adjusted, config);

        let err = relocate().with_module_id("nope").apply(config).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModule(_)));
    }

    #[test]
    fn test_module_access_and_ocpp_paths() {
        let mut paths = BTreeMap::new();
        paths.insert("MessageLogPath".to_string(), PathBuf::from("/tmp/session/ocpp_config/logs"));
        let chain: Vec<Box<dyn Adjustment<EverestConfig>>> = vec![
            Box::new(ModuleAccessGrant::new("ocpp")),
            Box::new(OcppModulePaths::new("ocpp", paths)),
        ];
        let config = compose(&template(), &chain).unwrap();
        let ocpp = config.module("ocpp").unwrap();
        assert_eq!(ocpp.access.as_ref().and_then(|a| a.config), Some(ConfigAccess::all()));
        assert_eq!(ocpp.config_str("MessageLogPath"), Some("/tmp/session/ocpp_config/logs"));

        let yaml = config.to_yaml_string().unwrap();
        assert!(yaml.contains("allow_global_write: true"));
    }

    proptest! {
        #[test]
        fn prop_idempotent_strategies(
            module_id in "[a-z_]{1,12}",
            csms_bundle in "[a-z]{1,8}(/[a-z]{1,8}){0,3}\\.pem",
        ) {
            let mut config = template();
            config
                .module_mut("evse_security")
                .unwrap()
                .set_config("csms_ca_bundle", csms_bundle.as_str());

            let idempotent: Vec<Box<dyn Adjustment<EverestConfig>>> = vec![
                Box::new(ProbeModuleInjection::new(module_id, probe().connections)),
                Box::new(relocate()),
                Box::new(PersistentStoreRedirect::new("/tmp/session/store.db")),
            ];
            for adjustment in &idempotent {
                let once = adjustment.apply(config.clone()).unwrap();
                let twice = adjustment.apply(once.clone()).unwrap();
                prop_assert_eq!(once, twice);
            }
        }
    }
}
