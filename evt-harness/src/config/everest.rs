//! EVerest YAML configuration model
//!
//! Only the parts the harness rewrites are typed. Everything else, including
//! `x-module-layout`, is carried through as opaque YAML so a round trip keeps
//! it intact. Maps are ordered so written files diff cleanly.

use super::{read_to_string, write_file, ConfigError};
use evt_core::{Connections, Fulfillment};
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EverestConfig {
    #[serde(default, deserialize_with = "null_as_default")]
    pub active_modules: BTreeMap<String, ModuleDescriptor>,

    #[serde(rename = "x-module-layout", default, skip_serializing_if = "Option::is_none")]
    pub module_layout: Option<YamlValue>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub module: String,

    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "BTreeMap::is_empty")]
    pub config_module: BTreeMap<String, YamlValue>,

    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "BTreeMap::is_empty")]
    pub config_implementation: BTreeMap<String, BTreeMap<String, YamlValue>>,

    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "BTreeMap::is_empty")]
    pub connections: BTreeMap<String, Vec<PeerRef>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<ModuleAccess>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, YamlValue>,
}

/// One fulfilment of a requirement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRef {
    pub module_id: String,
    pub implementation_id: String,
}

impl From<&Fulfillment> for PeerRef {
    fn from(f: &Fulfillment) -> Self {
        Self {
            module_id: f.module_id.clone(),
            implementation_id: f.implementation_id.clone(),
        }
    }
}

impl From<&PeerRef> for Fulfillment {
    fn from(p: &PeerRef) -> Self {
        Fulfillment::new(p.module_id.clone(), p.implementation_id.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleAccess {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigAccess>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigAccess {
    #[serde(default)]
    pub allow_global_read: bool,
    #[serde(default)]
    pub allow_global_write: bool,
    #[serde(default)]
    pub allow_set_read_only: bool,
}

impl ConfigAccess {
    pub fn all() -> Self {
        Self {
            allow_global_read: true,
            allow_global_write: true,
            allow_set_read_only: true,
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl ModuleDescriptor {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Default::default()
        }
    }

    /// Requirements as probe-side connections
    pub fn fulfillments(&self) -> Connections {
        self.connections
            .iter()
            .map(|(req, peers)| (req.clone(), peers.iter().map(Fulfillment::from).collect()))
            .collect()
    }

    pub fn set_config(&mut self, key: impl Into<String>, value: impl Into<YamlValue>) {
        self.config_module.insert(key.into(), value.into());
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config_module.get(key).and_then(YamlValue::as_str)
    }
}

impl EverestConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_yaml_str(&read_to_string(path)?)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        write_file(path, &self.to_yaml_string()?)
    }

    pub fn module(&self, id: &str) -> Option<&ModuleDescriptor> {
        self.active_modules.get(id)
    }

    pub fn module_mut(&mut self, id: &str) -> Result<&mut ModuleDescriptor, ConfigError> {
        self.active_modules
            .get_mut(id)
            .ok_or_else(|| ConfigError::UnknownModule(id.to_string()))
    }

    /// Ids of all modules of the given type, in id order
    pub fn modules_of_type<'a>(&'a self, module: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.active_modules
            .iter()
            .filter(move |(_, d)| d.module == module)
            .map(|(id, _)| id.as_str())
    }

    pub fn insert_module(&mut self, id: impl Into<String>, descriptor: ModuleDescriptor) {
        self.active_modules.insert(id.into(), descriptor);
    }

    /// Every connection must point at an active module
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (id, descriptor) in &self.active_modules {
            for (requirement, peers) in &descriptor.connections {
                if let Some(peer) = peers.iter().find(|p| !self.active_modules.contains_key(&p.module_id)) {
                    return Err(ConfigError::DanglingConnection {
                        module: id.clone(),
                        requirement: requirement.clone(),
                        peer: peer.module_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
