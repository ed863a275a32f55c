//! Scenario Runner fixture: one EVerest session per scenario
//!
//! ```text
//!  compose configs ──► CSMS mock ──► EVerest manager ──► probe module
//!  (temp tree)         (ephemeral     (probe held back     (ready handshake)
//!                       port)          as standalone)
//! ```
//!
//! Teardown runs the same steps in reverse and never masks the failure
//! that ended the scenario.

use crate::config::{
    compose, Adjustment, DeviceModel, EverestConfig, EvseSecurityRelocate, ModuleAccessGrant,
    Ocpp16Config, OcppModulePaths, OcppNetworkProfile, PersistentStoreRedirect, ProbeModuleInjection,
    SessionPaths,
};
use crate::controls::SimulationControl;
use crate::error::HarnessError;
use crate::supervisor::{Supervisor, SupervisorConfig};
use evt_core::types::DEFAULT_PREFIX;
use evt_core::{BusError, Connections, Fulfillment, MessageBus, MqttBus, MqttSettings, ProbeConfig, ProbeError, ProbeModule};
use evt_ocpp::{CsmsConfig, CsmsMock, OcppVersion};
use serde::Serialize;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Everything needed to bring up a session
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// EVerest installation prefix
    pub everest_prefix: Option<PathBuf>,
    /// Manager binary, `<prefix>/bin/manager` when unset
    pub manager_binary: Option<PathBuf>,
    /// EVerest config template, the SIL OCPP config of the installation when unset
    pub template_config: Option<PathBuf>,
    pub ocpp_version: OcppVersion,
    pub ocpp_module_id: String,
    /// 1.6 JSON config, 2.x component config directory or device model CSV
    pub ocpp_template: Option<PathBuf>,
    pub station_id: String,
    pub probe_module_id: String,
    pub probe_connections: Connections,
    /// Inject and run the probe module
    pub with_probe: bool,
    /// Grant the OCPP module global config access
    pub grant_module_access: bool,
    pub mqtt: MqttSettings,
    pub topic_prefix: String,
    /// Prefix for the simulation control topics
    pub external_prefix: String,
    pub certs_source: Option<PathBuf>,
    pub startup_timeout: Duration,
    pub command_timeout: Duration,
    pub assertion_timeout: Duration,
    /// Leave the session directory behind for inspection
    pub keep_temp: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            everest_prefix: None,
            manager_binary: None,
            template_config: None,
            ocpp_version: OcppVersion::V16,
            ocpp_module_id: "ocpp".to_string(),
            ocpp_template: None,
            station_id: "cp001".to_string(),
            probe_module_id: "probe".to_string(),
            probe_connections: Connections::new(),
            with_probe: true,
            grant_module_access: false,
            mqtt: MqttSettings::default(),
            topic_prefix: DEFAULT_PREFIX.to_string(),
            external_prefix: String::new(),
            certs_source: None,
            startup_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(10),
            assertion_timeout: Duration::from_secs(30),
            keep_temp: false,
        }
    }
}

impl HarnessConfig {
    pub fn new(version: OcppVersion) -> Self {
        Self {
            ocpp_version: version,
            ..Default::default()
        }
    }

    pub fn with_everest_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.everest_prefix = Some(prefix.into());
        self
    }

    pub fn with_manager_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.manager_binary = Some(binary.into());
        self
    }

    pub fn with_template(mut self, template: impl Into<PathBuf>) -> Self {
        self.template_config = Some(template.into());
        self
    }

    pub fn with_ocpp_version(mut self, version: OcppVersion) -> Self {
        self.ocpp_version = version;
        self
    }

    pub fn with_ocpp_module(mut self, module_id: impl Into<String>) -> Self {
        self.ocpp_module_id = module_id.into();
        self
    }

    pub fn with_ocpp_template(mut self, template: impl Into<PathBuf>) -> Self {
        self.ocpp_template = Some(template.into());
        self
    }

    pub fn with_station_id(mut self, station_id: impl Into<String>) -> Self {
        self.station_id = station_id.into();
        self
    }

    pub fn with_probe_module(mut self, module_id: impl Into<String>) -> Self {
        self.probe_module_id = module_id.into();
        self
    }

    pub fn with_probe_connection(mut self, requirement: impl Into<String>, fulfillment: Fulfillment) -> Self {
        self.probe_connections
            .entry(requirement.into())
            .or_default()
            .push(fulfillment);
        self
    }

    pub fn without_probe(mut self) -> Self {
        self.with_probe = false;
        self
    }

    pub fn with_module_access(mut self) -> Self {
        self.grant_module_access = true;
        self
    }

    pub fn with_mqtt(mut self, settings: MqttSettings) -> Self {
        self.mqtt = settings;
        self
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    pub fn with_external_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.external_prefix = prefix.into();
        self
    }

    pub fn with_certs(mut self, source: impl Into<PathBuf>) -> Self {
        self.certs_source = Some(source.into());
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_assertion_timeout(mut self, timeout: Duration) -> Self {
        self.assertion_timeout = timeout;
        self
    }

    pub fn keep_temp_dirs(mut self) -> Self {
        self.keep_temp = true;
        self
    }

    fn prefix(&self) -> Result<&Path, HarnessError> {
        self.everest_prefix
            .as_deref()
            .ok_or_else(|| HarnessError::NotConfigured("EVerest prefix".to_string()))
    }

    pub fn is_live_capable(&self) -> bool {
        self.everest_prefix.is_some()
    }

    pub fn template_path(&self) -> Result<PathBuf, HarnessError> {
        if let Some(template) = &self.template_config {
            return Ok(template.clone());
        }
        let name = if self.ocpp_version.is_v16() {
            "config-sil-ocpp.yaml"
        } else {
            "config-sil-ocpp201.yaml"
        };
        Ok(self.prefix()?.join("etc/everest").join(name))
    }

    /// Where the station config template comes from
    ///
    /// For 1.6 the OCPP module's `ChargePointConfigPath` is resolved against
    /// the module's share directory, for 2.x the installed component config
    /// is used.
    pub fn ocpp_template_path(&self, template: &EverestConfig) -> Result<PathBuf, HarnessError> {
        if let Some(path) = &self.ocpp_template {
            return Ok(path.clone());
        }
        let prefix = self.prefix()?;
        if self.ocpp_version.is_v16() {
            let configured = template
                .module(&self.ocpp_module_id)
                .and_then(|m| m.config_str("ChargePointConfigPath"))
                .unwrap_or("config.json");
            Ok(prefix.join("share/everest/modules/OCPP").join(configured))
        } else {
            Ok(prefix.join("share/everest/modules/OCPP201/component_config"))
        }
    }

    pub fn certs_source_path(&self) -> Option<PathBuf> {
        self.certs_source
            .clone()
            .or_else(|| self.everest_prefix.as_ref().map(|p| p.join("etc/everest/certs")))
    }
}

type ProbeSetup = Box<dyn Fn(&ProbeModule) -> Result<(), ProbeError> + Send + Sync>;

/// Session recipe: harness config, CSMS config and the per-scenario adjustments
///
/// The built-in adjustments (probe injection, paths, network profile, ...)
/// run first, the ones added here after them.
pub struct SessionPlan {
    pub config: HarnessConfig,
    pub csms: CsmsConfig,
    pub everest: Vec<Box<dyn Adjustment<EverestConfig>>>,
    pub ocpp16: Vec<Box<dyn Adjustment<Ocpp16Config>>>,
    pub device_model: Vec<Box<dyn Adjustment<DeviceModel>>>,
    probe_setup: Vec<ProbeSetup>,
}

impl SessionPlan {
    pub fn new(config: HarnessConfig) -> Self {
        let csms = CsmsConfig::new(config.ocpp_version).with_station_id(config.station_id.clone());
        Self {
            config,
            csms,
            everest: Vec::new(),
            ocpp16: Vec::new(),
            device_model: Vec::new(),
            probe_setup: Vec::new(),
        }
    }

    pub fn with_csms(mut self, f: impl FnOnce(CsmsConfig) -> CsmsConfig) -> Self {
        self.csms = f(self.csms);
        self
    }

    pub fn with_everest(mut self, adjustment: impl Adjustment<EverestConfig> + 'static) -> Self {
        self.everest.push(Box::new(adjustment));
        self
    }

    pub fn with_ocpp16(mut self, adjustment: impl Adjustment<Ocpp16Config> + 'static) -> Self {
        self.ocpp16.push(Box::new(adjustment));
        self
    }

    pub fn with_device_model(mut self, adjustment: impl Adjustment<DeviceModel> + 'static) -> Self {
        self.device_model.push(Box::new(adjustment));
        self
    }

    /// Register commands or subscriptions on the probe before it announces readiness
    pub fn with_probe_setup<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProbeModule) -> Result<(), ProbeError> + Send + Sync + 'static,
    {
        self.probe_setup.push(Box::new(f));
        self
    }

    fn everest_chain(
        config: &HarnessConfig,
        paths: &SessionPaths,
        has_ocpp: bool,
        user: Vec<Box<dyn Adjustment<EverestConfig>>>,
    ) -> Vec<Box<dyn Adjustment<EverestConfig>>> {
        let mut chain: Vec<Box<dyn Adjustment<EverestConfig>>> = Vec::new();
        if has_ocpp {
            chain.push(Box::new(OcppModulePaths::new(
                config.ocpp_module_id.clone(),
                paths.ocpp_module_paths(),
            )));
        }
        if config.with_probe {
            chain.push(Box::new(ProbeModuleInjection::new(
                config.probe_module_id.clone(),
                config.probe_connections.clone(),
            )));
        }
        let mut relocate = EvseSecurityRelocate::new(paths.certs_dir.clone());
        if let Some(source) = config.certs_source_path() {
            relocate = relocate.with_source_dir(source);
        }
        chain.push(Box::new(relocate));
        chain.push(Box::new(PersistentStoreRedirect::new(paths.persistent_store_db.clone())));
        if config.grant_module_access && has_ocpp {
            chain.push(Box::new(ModuleAccessGrant::new(config.ocpp_module_id.clone())));
        }
        chain.extend(user);
        chain
    }
}

/// A running EVerest with its CSMS mock and probe
pub struct TestSession {
    config: HarnessConfig,
    paths: SessionPaths,
    csms: CsmsMock,
    bus: Arc<MqttBus>,
    supervisor: Option<Supervisor>,
    probe: Option<ProbeModule>,
    dir: Option<TempDir>,
}

impl TestSession {
    /// Compose, start the CSMS, EVerest and the probe
    pub async fn start(plan: SessionPlan) -> Result<Self, HarnessError> {
        let SessionPlan {
            config,
            csms,
            everest,
            ocpp16,
            device_model,
            probe_setup,
        } = plan;
        config.prefix()?;

        let dir = tempfile::Builder::new().prefix("evt-session-").tempdir()?;
        let paths = SessionPaths::create(dir.path(), config.ocpp_version)?;
        let dir = if config.keep_temp {
            info!("Keeping session directory {}", dir.path().display());
            let _ = dir.into_path();
            None
        } else {
            Some(dir)
        };

        let csms = CsmsMock::start(csms).await?;
        let bus = MqttBus::connect(config.mqtt.clone());
        let mut session = Self {
            config,
            paths,
            csms,
            bus,
            supervisor: None,
            probe: None,
            dir,
        };

        match session.bring_up(everest, ocpp16, device_model, probe_setup).await {
            Ok(()) => Ok(session),
            Err(e) => {
                if let Some(teardown) = session.teardown().await {
                    warn!("Teardown after failed start: {}", teardown);
                }
                Err(e)
            }
        }
    }

    async fn bring_up(
        &mut self,
        everest: Vec<Box<dyn Adjustment<EverestConfig>>>,
        ocpp16: Vec<Box<dyn Adjustment<Ocpp16Config>>>,
        device_model: Vec<Box<dyn Adjustment<DeviceModel>>>,
        probe_setup: Vec<ProbeSetup>,
    ) -> Result<(), HarnessError> {
        let config = self.config.clone();
        let template_path = config.template_path()?;
        let template = EverestConfig::load(&template_path)?;
        let has_ocpp = template.module(&config.ocpp_module_id).is_some();

        let chain = SessionPlan::everest_chain(&config, &self.paths, has_ocpp, everest);
        let composed = compose(&template, &chain)?;
        composed.validate()?;
        composed.write(&self.paths.everest_config_file)?;
        info!("EVerest config written to {}", self.paths.everest_config_file.display());

        if has_ocpp {
            self.write_ocpp_config(&template, ocpp16, device_model)?;
        } else {
            debug!("Template has no module {}, skipping station config", config.ocpp_module_id);
        }

        if let Some(source) = config.certs_source_path().filter(|p| p.is_dir()) {
            if config.certs_source.is_none() {
                warn!(
                    "Using certificates of the installation at {}, tests may interfere",
                    source.display()
                );
            }
            self.paths.copy_certs(&source)?;
        }

        if let Err(e) = self.bus.wait_connected(config.startup_timeout).await {
            warn!("MQTT broker not reachable ({}), retrying once", e);
            self.bus.wait_connected(config.startup_timeout).await?;
        }

        let mut supervisor_config = SupervisorConfig::new(config.prefix()?, &self.paths.everest_config_file)
            .with_template(&template_path)
            .with_startup_timeout(config.startup_timeout)
            .with_working_dir(&self.paths.root);
        if let Some(binary) = &config.manager_binary {
            supervisor_config = supervisor_config.with_manager_binary(binary);
        }
        if config.with_probe {
            supervisor_config = supervisor_config.with_standalone(config.probe_module_id.clone());
        }
        let mut supervisor = Supervisor::start(supervisor_config).await?;
        if let Some(dir) = self.dir.take() {
            supervisor.adopt(dir);
        }
        self.supervisor = Some(supervisor);

        if config.with_probe {
            let bus: Arc<dyn MessageBus> = self.bus.clone();
            let probe = ProbeModule::new(
                bus,
                ProbeConfig::new(config.probe_module_id.clone())
                    .with_prefix(config.topic_prefix.clone())
                    .with_connections(config.probe_connections.clone())
                    .with_command_timeout(config.command_timeout),
            );
            self.probe = Some(probe.clone());
            for setup in &probe_setup {
                setup(&probe)?;
            }
            probe.start()?;
            probe.wait_to_be_ready(config.startup_timeout).await?;
            info!("Probe module {} ready", config.probe_module_id);
        }
        Ok(())
    }

    fn write_ocpp_config(
        &self,
        template: &EverestConfig,
        ocpp16: Vec<Box<dyn Adjustment<Ocpp16Config>>>,
        device_model: Vec<Box<dyn Adjustment<DeviceModel>>>,
    ) -> Result<(), HarnessError> {
        let source = self.config.ocpp_template_path(template)?;
        let host = Ipv4Addr::LOCALHOST.to_string();
        let port = self.csms.port();

        if self.config.ocpp_version.is_v16() {
            let mut chain: Vec<Box<dyn Adjustment<Ocpp16Config>>> = vec![Box::new(OcppNetworkProfile::new(host, port))];
            chain.extend(ocpp16);
            let config = compose(&Ocpp16Config::load(&source)?, &chain)?;
            config.write(&self.paths.ocpp_config_file)?;
        } else {
            let model = if source.extension().map_or(false, |ext| ext == "csv") {
                DeviceModel::from_csv(&std::fs::read_to_string(&source)?)?
            } else {
                DeviceModel::load_dir(&source)?
            };
            let mut chain: Vec<Box<dyn Adjustment<DeviceModel>>> = vec![Box::new(OcppNetworkProfile::new(host, port))];
            chain.extend(device_model);
            compose(&model, &chain)?.write_dir(&self.paths.component_config_dir)?;
        }
        info!("Station config from {} points at port {}", source.display(), port);
        Ok(())
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn csms(&self) -> &CsmsMock {
        &self.csms
    }

    pub fn probe(&self) -> Result<&ProbeModule, HarnessError> {
        self.probe.as_ref().ok_or(HarnessError::NoProbe)
    }

    pub fn bus(&self) -> Arc<dyn MessageBus> {
        self.bus.clone()
    }

    /// Publish a simulation control, retrying once after a reconnect
    pub async fn fire(&self, control: SimulationControl) -> Result<(), HarnessError> {
        match control.fire(&*self.bus, &self.config.external_prefix) {
            Err(BusError::Disconnected) => {
                warn!("Message bus disconnected, retrying {:?} once", control);
                self.bus.wait_connected(self.config.command_timeout).await?;
                control.fire(&*self.bus, &self.config.external_prefix)?;
                Ok(())
            }
            other => Ok(other?),
        }
    }

    /// Wait for a station message of `action` matching `expected`
    pub async fn expect(&self, action: &str, expected: Value) -> Result<(), HarnessError> {
        self.csms
            .expect(action, &expected, self.config.assertion_timeout)
            .await
            .map_err(HarnessError::from)
    }

    /// CSMS-initiated call, returning the station's payload
    pub async fn call(&self, action: &str, payload: impl Serialize) -> Result<Value, HarnessError> {
        Ok(self.csms.call(action, payload).await?)
    }

    /// Stop everything in reverse start order
    pub async fn shutdown(mut self) -> Result<(), HarnessError> {
        match self.teardown().await {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn teardown(&mut self) -> Option<HarnessError> {
        let mut first: Option<HarnessError> = None;

        if let Some(probe) = self.probe.take() {
            probe.stop();
        }
        if let Some(mut supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.stop().await {
                warn!("Stopping EVerest: {}", e);
                first.get_or_insert(e.into());
            }
        }
        self.bus.shutdown();
        self.csms.stop().await;
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!("Removing session directory: {}", e);
                first.get_or_insert(e.into());
            }
        }
        first
    }
}
