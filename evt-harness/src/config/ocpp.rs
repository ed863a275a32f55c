//! OCPP station configuration: the 1.6 JSON config and the 2.x device model
//!
//! The device model is read from and written back to libocpp's component
//! config layout (`standardized/*.json`, `custom/*.json`), each file one
//! component whose `properties` hold the variables and their attribute list.

use super::strategies::Adjustment;
use super::{read_to_string, write_file, ConfigError};
use evt_ocpp::ocpp::AttributeType;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const NETWORK_COMPONENT: &str = "InternalCtrlr";
pub const NETWORK_PROFILES_VARIABLE: &str = "NetworkConnectionProfiles";

const COMPONENT_SUBDIRS: &[&str] = &["standardized", "custom"];

// ============================================================================
// OCPP 1.6
// ============================================================================

/// libocpp 1.6 configuration, sections of key/value pairs
#[derive(Debug, Clone, PartialEq)]
pub struct Ocpp16Config(pub Value);

impl Ocpp16Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self(serde_json::from_str(&read_to_string(path)?)?))
    }

    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        write_file(path, &serde_json::to_string_pretty(&self.0)?)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        self.0.get(section).and_then(|s| s.get(key))
    }

    /// Set `section.key`, creating the section if needed
    pub fn set(&mut self, section: &str, key: &str, value: Value) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            key: format!("{}.{}", section, key),
            reason: reason.to_string(),
        };
        let root = self.0.as_object_mut().ok_or_else(|| invalid("config is not an object"))?;
        let section_value = root
            .entry(section.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        section_value
            .as_object_mut()
            .ok_or_else(|| invalid("section is not an object"))?
            .insert(key.to_string(), value);
        Ok(())
    }

    pub fn central_system_uri(&self) -> Option<&str> {
        self.get("Internal", "CentralSystemURI").and_then(Value::as_str)
    }
}

// ============================================================================
// OCPP 2.x device model
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct VariableConfig {
    pub variable_name: String,
    pub instance: Option<String>,
    pub attributes: BTreeMap<AttributeType, Value>,
}

impl VariableConfig {
    pub fn new(variable_name: impl Into<String>) -> Self {
        Self {
            variable_name: variable_name.into(),
            instance: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn actual(&self) -> Option<&Value> {
        self.attributes.get(&AttributeType::Actual)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentConfig {
    pub name: String,
    pub instance: Option<String>,
    pub evse_id: Option<i64>,
    pub connector_id: Option<i64>,
    /// Keyed by the unique property name of the variable
    pub variables: BTreeMap<String, VariableConfig>,
    /// File this component was read from, relative to the component dir
    source: Option<PathBuf>,
    /// Document as read, rewritten in place on save
    raw: Option<Value>,
}

impl ComponentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: None,
            evse_id: None,
            connector_id: None,
            variables: BTreeMap::new(),
            source: None,
            raw: None,
        }
    }

    fn from_document(source: PathBuf, doc: Value) -> Result<Self, ConfigError> {
        let name = doc
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: source.display().to_string(),
                reason: "component has no name".to_string(),
            })?
            .to_string();

        let mut variables = BTreeMap::new();
        if let Some(properties) = doc.get("properties").and_then(Value::as_object) {
            for (unique, property) in properties {
                let mut variable = VariableConfig::new(
                    property
                        .get("variable_name")
                        .and_then(Value::as_str)
                        .unwrap_or(unique),
                );
                variable.instance = property.get("instance").and_then(Value::as_str).map(str::to_string);
                for attribute in property.get("attributes").and_then(Value::as_array).into_iter().flatten() {
                    let kind = attribute
                        .get("type")
                        .and_then(Value::as_str)
                        .and_then(|t| t.parse::<AttributeType>().ok());
                    if let (Some(kind), Some(value)) = (kind, attribute.get("value")) {
                        variable.attributes.insert(kind, value.clone());
                    }
                }
                variables.insert(unique.clone(), variable);
            }
        }

        Ok(Self {
            name,
            instance: doc.get("instance").and_then(Value::as_str).map(str::to_string),
            evse_id: doc.get("evse_id").and_then(Value::as_i64),
            connector_id: doc.get("connector_id").and_then(Value::as_i64),
            variables,
            source: Some(source),
            raw: Some(doc),
        })
    }

    fn to_document(&self) -> Value {
        let mut doc = self.raw.clone().unwrap_or_else(|| {
            let mut doc = json!({"name": self.name, "type": "object", "properties": {}});
            if let Some(instance) = &self.instance {
                doc["instance"] = json!(instance);
            }
            if let Some(evse_id) = self.evse_id {
                doc["evse_id"] = json!(evse_id);
            }
            if let Some(connector_id) = self.connector_id {
                doc["connector_id"] = json!(connector_id);
            }
            doc
        });

        if !doc.get("properties").map_or(false, Value::is_object) {
            doc["properties"] = json!({});
        }
        for (unique, variable) in &self.variables {
            let property = &mut doc["properties"][unique.as_str()];
            if property.is_null() {
                *property = json!({"variable_name": variable.variable_name, "attributes": []});
                if let Some(instance) = &variable.instance {
                    property["instance"] = json!(instance);
                }
            }
            if !property.get("attributes").map_or(false, Value::is_array) {
                property["attributes"] = json!([]);
            }
            if let Some(attributes) = property["attributes"].as_array_mut() {
                for (kind, value) in &variable.attributes {
                    match attributes
                        .iter()
                        .position(|a| a.get("type").and_then(Value::as_str) == Some(kind.as_str()))
                    {
                        Some(i) => attributes[i]["value"] = value.clone(),
                        None => attributes.push(json!({"type": kind.as_str(), "value": value})),
                    }
                }
            }
        }
        doc
    }

    fn file_name(&self) -> PathBuf {
        let stem = match &self.instance {
            Some(instance) => format!("{}_{}", self.name, instance),
            None => self.name.clone(),
        };
        Path::new("custom").join(format!("{}.json", stem))
    }

    fn same_identity(&self, other: &ComponentConfig) -> bool {
        self.name == other.name
            && self.instance == other.instance
            && self.evse_id == other.evse_id
            && self.connector_id == other.connector_id
    }

    /// Find a variable by unique property name or by variable name
    pub fn variable_mut(&mut self, variable: &str) -> Option<&mut VariableConfig> {
        if self.variables.contains_key(variable) {
            return self.variables.get_mut(variable);
        }
        self.variables.values_mut().find(|v| v.variable_name == variable)
    }

    pub fn variable(&self, variable: &str) -> Option<&VariableConfig> {
        self.variables
            .get(variable)
            .or_else(|| self.variables.values().find(|v| v.variable_name == variable))
    }
}

/// OCPP 2.x device model as a list of components
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceModel {
    pub components: Vec<ComponentConfig>,
}

impl DeviceModel {
    /// Read every component file below `dir`
    pub fn load_dir(dir: &Path) -> Result<Self, ConfigError> {
        let mut components = Vec::new();
        for sub in COMPONENT_SUBDIRS {
            let sub_dir = dir.join(sub);
            if !sub_dir.is_dir() {
                continue;
            }
            let mut files: Vec<PathBuf> = std::fs::read_dir(&sub_dir)
                .map_err(ConfigError::io(&sub_dir))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
                .collect();
            files.sort();

            for file in files {
                let doc: Value = serde_json::from_str(&read_to_string(&file)?)?;
                let relative = Path::new(sub).join(file.file_name().unwrap_or_default());
                components.push(ComponentConfig::from_document(relative, doc)?);
            }
        }
        debug!("Loaded {} device model components from {}", components.len(), dir.display());
        Ok(Self { components })
    }

    /// Write every component below `dir`, new ones into `custom/`
    pub fn write_dir(&self, dir: &Path) -> Result<(), ConfigError> {
        for component in &self.components {
            let relative = component.source.clone().unwrap_or_else(|| component.file_name());
            let contents = serde_json::to_string_pretty(&component.to_document())?;
            write_file(&dir.join(relative), &contents)?;
        }
        Ok(())
    }

    /// Build a device model from CSV rows
    ///
    /// Columns: component, component_instance, evse_id, connector_id,
    /// variable, variable_instance, attribute, value. Blank lines and lines
    /// starting with `#` are skipped, as is a header row naming `component`.
    pub fn from_csv(text: &str) -> Result<Self, ConfigError> {
        let mut model = DeviceModel::default();
        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let fields = split_csv_line(trimmed).map_err(|reason| ConfigError::Csv { line: line_no, reason })?;
            if fields.first().map(String::as_str) == Some("component") {
                continue;
            }
            if fields.len() != 8 {
                return Err(ConfigError::Csv {
                    line: line_no,
                    reason: format!("expected 8 fields, found {}", fields.len()),
                });
            }

            let optional = |s: &str| if s.is_empty() { None } else { Some(s.to_string()) };
            let number = |s: &str, column: &str| -> Result<Option<i64>, ConfigError> {
                if s.is_empty() {
                    return Ok(None);
                }
                s.parse().map(Some).map_err(|_| ConfigError::Csv {
                    line: line_no,
                    reason: format!("{} is not a number: {}", column, s),
                })
            };
            let attribute: AttributeType = fields[6]
                .parse()
                .map_err(|reason| ConfigError::Csv { line: line_no, reason })?;

            let mut component = ComponentConfig::new(fields[0].as_str());
            component.instance = optional(fields[1].as_str());
            component.evse_id = number(fields[2].as_str(), "evse_id")?;
            component.connector_id = number(fields[3].as_str(), "connector_id")?;

            let variable_instance = optional(fields[5].as_str());
            let unique = match &variable_instance {
                Some(instance) => format!("{}_{}", fields[4], instance),
                None => fields[4].clone(),
            };

            let slot = match model.components.iter().position(|c| c.same_identity(&component)) {
                Some(pos) => &mut model.components[pos],
                None => {
                    model.components.push(component);
                    let last = model.components.len() - 1;
                    &mut model.components[last]
                }
            };
            let variable = slot.variables.entry(unique).or_insert_with(|| VariableConfig {
                variable_name: fields[4].clone(),
                instance: variable_instance,
                attributes: BTreeMap::new(),
            });
            variable.attributes.insert(attribute, coerce_like(None, &fields[7]));
        }
        Ok(model)
    }

    /// Overlay another model's variables onto this one
    pub fn merge(&mut self, other: DeviceModel) {
        for incoming in other.components {
            match self.components.iter().position(|c| c.same_identity(&incoming)) {
                Some(pos) => {
                    let existing = &mut self.components[pos];
                    for (unique, variable) in incoming.variables {
                        match existing.variables.get_mut(&unique) {
                            Some(current) => current.attributes.extend(variable.attributes),
                            None => {
                                existing.variables.insert(unique, variable);
                            }
                        }
                    }
                }
                None => self.components.push(incoming),
            }
        }
    }

    pub fn component(&self, name: &str) -> Option<&ComponentConfig> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn component_mut(&mut self, name: &str) -> Option<&mut ComponentConfig> {
        self.components.iter_mut().find(|c| c.name == name)
    }

    pub fn attribute(&self, component: &str, variable: &str, attribute: AttributeType) -> Option<&Value> {
        self.component(component)?.variable(variable)?.attributes.get(&attribute)
    }

    /// Set an attribute of an existing variable
    pub fn set_attribute(
        &mut self,
        component: &str,
        variable: &str,
        attribute: AttributeType,
        value: Value,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownVariable {
            component: component.to_string(),
            variable: variable.to_string(),
        };
        let target = self
            .component_mut(component)
            .ok_or_else(unknown)?
            .variable_mut(variable)
            .ok_or_else(unknown)?;
        let value = match value {
            Value::String(s) => coerce_like(target.attributes.get(&attribute), &s),
            other => other,
        };
        target.attributes.insert(attribute, value);
        Ok(())
    }
}

/// Interpret `raw` with the type of the value it replaces
///
/// Without a current value booleans and numbers are recognised, anything
/// else stays a string.
fn coerce_like(current: Option<&Value>, raw: &str) -> Value {
    match current {
        Some(Value::Bool(_)) => raw.parse::<bool>().map(Value::Bool).unwrap_or_else(|_| json!(raw)),
        Some(Value::Number(_)) => serde_json::from_str::<serde_json::Number>(raw)
            .map(Value::Number)
            .unwrap_or_else(|_| json!(raw)),
        Some(_) => json!(raw),
        None => match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => serde_json::from_str::<serde_json::Number>(raw)
                .map(Value::Number)
                .unwrap_or_else(|_| json!(raw)),
        },
    }
}

/// Split one CSV record, honouring double quotes and `""` escapes
fn split_csv_line(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                chars.next();
                field.push('"');
            }
            ('"', true) => quoted = false,
            ('"', false) if field.is_empty() => quoted = true,
            (',', false) => fields.push(std::mem::take(&mut field).trim().to_string()),
            (c, _) => field.push(c),
        }
    }
    if quoted {
        return Err("unterminated quote".to_string());
    }
    fields.push(field.trim().to_string());
    Ok(fields)
}

// ============================================================================
// Strategies
// ============================================================================

/// Point the station at a test-local CSMS
#[derive(Debug, Clone)]
pub struct OcppNetworkProfile {
    pub host: String,
    pub port: u16,
}

impl OcppNetworkProfile {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn csms_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

impl Adjustment<Ocpp16Config> for OcppNetworkProfile {
    fn name(&self) -> &str {
        "ocpp-network-profile"
    }

    fn apply(&self, mut config: Ocpp16Config) -> Result<Ocpp16Config, ConfigError> {
        config.set(
            "Internal",
            "CentralSystemURI",
            json!(format!("{}:{}/", self.host, self.port)),
        )?;
        Ok(config)
    }
}

impl Adjustment<DeviceModel> for OcppNetworkProfile {
    fn name(&self) -> &str {
        "ocpp-network-profile"
    }

    fn apply(&self, mut model: DeviceModel) -> Result<DeviceModel, ConfigError> {
        let key = format!("{}.{}", NETWORK_COMPONENT, NETWORK_PROFILES_VARIABLE);
        let invalid = |reason: String| ConfigError::InvalidValue {
            key: key.clone(),
            reason,
        };

        let current = model
            .attribute(NETWORK_COMPONENT, NETWORK_PROFILES_VARIABLE, AttributeType::Actual)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownVariable {
                component: NETWORK_COMPONENT.to_string(),
                variable: NETWORK_PROFILES_VARIABLE.to_string(),
            })?;

        // stored as a JSON-encoded string by libocpp, accept a plain array too
        let (mut profiles, encoded) = match current {
            Value::String(text) => (
                serde_json::from_str::<Value>(&text).map_err(|e| invalid(e.to_string()))?,
                true,
            ),
            other => (other, false),
        };
        let list = profiles
            .as_array_mut()
            .ok_or_else(|| invalid("expected a list of profiles".to_string()))?;
        for profile in list.iter_mut() {
            let data = profile
                .get_mut("connectionData")
                .and_then(Value::as_object_mut)
                .ok_or_else(|| invalid("profile without connectionData".to_string()))?;
            data.insert("ocppCsmsUrl".to_string(), json!(self.csms_url()));
        }

        let updated = if encoded {
            Value::String(serde_json::to_string(&profiles)?)
        } else {
            profiles
        };
        model.set_attribute(NETWORK_COMPONENT, NETWORK_PROFILES_VARIABLE, AttributeType::Actual, updated)?;
        Ok(model)
    }
}

/// One device model value to set
#[derive(Debug, Clone, PartialEq)]
pub struct VariableOverride {
    pub component: String,
    pub variable: String,
    pub attribute: AttributeType,
    pub value: Value,
}

impl VariableOverride {
    pub fn actual(component: impl Into<String>, variable: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            component: component.into(),
            variable: variable.into(),
            attribute: AttributeType::Actual,
            value: value.into(),
        }
    }
}

/// Update each listed variable attribute in place
#[derive(Debug, Clone, Default)]
pub struct GenericVariableOverride {
    pub overrides: Vec<VariableOverride>,
}

impl GenericVariableOverride {
    pub fn new(overrides: Vec<VariableOverride>) -> Self {
        Self { overrides }
    }
}

impl Adjustment<DeviceModel> for GenericVariableOverride {
    fn name(&self) -> &str {
        "generic-variable-override"
    }

    fn apply(&self, mut model: DeviceModel) -> Result<DeviceModel, ConfigError> {
        for o in &self.overrides {
            model.set_attribute(&o.component, &o.variable, o.attribute, o.value.clone())?;
        }
        Ok(model)
    }
}

/// Set one key of the 1.6 config
#[derive(Debug, Clone)]
pub struct Ocpp16KeyOverride {
    pub section: String,
    pub key: String,
    pub value: Value,
}

impl Ocpp16KeyOverride {
    pub fn new(section: impl Into<String>, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            section: section.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Adjustment<Ocpp16Config> for Ocpp16KeyOverride {
    fn name(&self) -> &str {
        "ocpp16-key-override"
    }

    fn apply(&self, mut config: Ocpp16Config) -> Result<Ocpp16Config, ConfigError> {
        config.set(&self.section, &self.key, self.value.clone())?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::strategies::compose;
    use tempfile::TempDir;

    const INTERNAL_CTRLR: &str = r#"{
  "name": "InternalCtrlr",
  "type": "object",
  "properties": {
    "InternalCtrlrEnabled": {
      "variable_name": "Enabled",
      "attributes": [{"type": "Actual", "mutability": "ReadOnly", "value": true}],
      "type": "boolean"
    },
    "NetworkConnectionProfiles": {
      "variable_name": "NetworkConnectionProfiles",
      "attributes": [{"type": "Actual", "mutability": "ReadWrite",
        "value": "[{\"configurationSlot\":1,\"connectionData\":{\"ocppCsmsUrl\":\"ws://localhost:9000\",\"securityProfile\":1}}]"}],
      "type": "string"
    }
  },
  "required": ["InternalCtrlrEnabled"]
}"#;

    const AUTH_CACHE_CTRLR: &str = r#"{
  "name": "AuthCacheCtrlr",
  "type": "object",
  "properties": {
    "AuthCacheCtrlrEnabled": {
      "variable_name": "Enabled",
      "attributes": [{"type": "Actual", "value": false}]
    },
    "AuthCacheLifeTime": {
      "variable_name": "LifeTime",
      "attributes": [{"type": "Actual", "value": 3600}]
    }
  }
}"#;

    fn component_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        let standardized = dir.path().join("standardized");
        std::fs::create_dir_all(&standardized).unwrap();
        std::fs::write(standardized.join("InternalCtrlr.json"), INTERNAL_CTRLR).unwrap();
        std::fs::write(standardized.join("AuthCacheCtrlr.json"), AUTH_CACHE_CTRLR).unwrap();
        dir
    }

    fn profiles(model: &DeviceModel) -> Value {
        let raw = model
            .attribute(NETWORK_COMPONENT, NETWORK_PROFILES_VARIABLE, AttributeType::Actual)
            .and_then(Value::as_str)
            .unwrap();
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_load_device_model() {
        let dir = component_dir();
        let model = DeviceModel::load_dir(dir.path()).unwrap();
        assert_eq!(model.components.len(), 2);
        assert_eq!(
            model.attribute("AuthCacheCtrlr", "LifeTime", AttributeType::Actual),
            Some(&json!(3600))
        );
        assert_eq!(
            model.attribute("InternalCtrlr", "InternalCtrlrEnabled", AttributeType::Actual),
            Some(&json!(true))
        );
    }

    #[test]
    fn test_network_profile_rewrite_is_idempotent() {
        let model = DeviceModel::load_dir(component_dir().path()).unwrap();
        let profile = OcppNetworkProfile::new("127.0.0.1", 40123);

        let once = Adjustment::<DeviceModel>::apply(&profile, model).unwrap();
        assert_eq!(profiles(&once)[0]["connectionData"]["ocppCsmsUrl"], "ws://127.0.0.1:40123");
        assert_eq!(profiles(&once)[0]["connectionData"]["securityProfile"], 1);

        let twice = Adjustment::<DeviceModel>::apply(&profile, once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_variable_override_keeps_types_and_writes_back() {
        let dir = component_dir();
        let template = DeviceModel::load_dir(dir.path()).unwrap();
        let chain: Vec<Box<dyn Adjustment<DeviceModel>>> = vec![Box::new(GenericVariableOverride::new(vec![
            VariableOverride::actual("AuthCacheCtrlr", "Enabled", "true"),
            VariableOverride::actual("AuthCacheCtrlr", "LifeTime", "86400"),
        ]))];
        let model = compose(&template, &chain).unwrap();

        let out = TempDir::new().unwrap();
        model.write_dir(out.path()).unwrap();
        let written: Value = serde_json::from_str(
            &std::fs::read_to_string(out.path().join("standardized/AuthCacheCtrlr.json")).unwrap(),
        )
        .unwrap();
        let props = &written["properties"];
        assert_eq!(props["AuthCacheCtrlrEnabled"]["attributes"][0]["value"], json!(true));
        assert_eq!(props["AuthCacheLifeTime"]["attributes"][0]["value"], json!(86400));

        let reloaded = DeviceModel::load_dir(out.path()).unwrap();
        assert_eq!(
            reloaded.attribute("AuthCacheCtrlr", "LifeTime", AttributeType::Actual),
            Some(&json!(86400))
        );
    }

    #[test]
    fn test_override_of_unknown_variable_fails() {
        let model = DeviceModel::load_dir(component_dir().path()).unwrap();
        let err = GenericVariableOverride::new(vec![VariableOverride::actual("AuthCtrlr", "Missing", 1)])
            .apply(model)
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownVariable { .. }));
    }

    #[test]
    fn test_device_model_from_csv() {
        let csv = "\
# device model for local auth tests
component,component_instance,evse_id,connector_id,variable,variable_instance,attribute,value
AuthCtrlr,,,,LocalPreAuthorize,,Actual,true
AuthCacheCtrlr,,,,LifeTime,,Actual,86400
EVSE,,1,,AvailabilityState,,Actual,Available
Connector,,1,1,ConnectorType,,Actual,\"cType2, tethered\"
";
        let mut model = DeviceModel::from_csv(csv).unwrap();
        assert_eq!(model.components.len(), 4);
        assert_eq!(
            model.attribute("AuthCtrlr", "LocalPreAuthorize", AttributeType::Actual),
            Some(&json!(true))
        );
        assert_eq!(model.component("EVSE").unwrap().evse_id, Some(1));
        assert_eq!(
            model.attribute("Connector", "ConnectorType", AttributeType::Actual),
            Some(&json!("cType2, tethered"))
        );

        let out = TempDir::new().unwrap();
        model.merge(DeviceModel::from_csv("AuthCtrlr,,,,LocalPreAuthorize,,Actual,false").unwrap());
        assert_eq!(
            model.attribute("AuthCtrlr", "LocalPreAuthorize", AttributeType::Actual),
            Some(&json!(false))
        );
        model.write_dir(out.path()).unwrap();
        assert!(out.path().join("custom/AuthCtrlr.json").exists());
    }

    #[test]
    fn test_csv_errors_name_the_line() {
        let err = DeviceModel::from_csv("A,,,,B,,Actual,1\nA,,x,,B,,Actual,1").unwrap_err();
        assert!(matches!(err, ConfigError::Csv { line: 2, .. }));
        let err = DeviceModel::from_csv("A,,,,B,,Actual,\"open").unwrap_err();
        assert!(matches!(err, ConfigError::Csv { line: 1, .. }));
    }

    #[test]
    fn test_ocpp16_config() {
        let template = Ocpp16Config(json!({
            "Internal": {"ChargePointId": "cp001", "CentralSystemURI": "127.0.0.1:8180/steve/"},
            "Core": {"HeartbeatInterval": 86400}
        }));
        let chain: Vec<Box<dyn Adjustment<Ocpp16Config>>> = vec![
            Box::new(OcppNetworkProfile::new("127.0.0.1", 9000)),
            Box::new(Ocpp16KeyOverride::new("Core", "HeartbeatInterval", 10)),
            Box::new(Ocpp16KeyOverride::new("Security", "AuthorizationKey", "AABBCCDD")),
        ];
        let config = compose(&template, &chain).unwrap();
        assert_eq!(config.central_system_uri(), Some("127.0.0.1:9000/"));
        assert_eq!(config.get("Core", "HeartbeatInterval"), Some(&json!(10)));
        assert_eq!(config.get("Security", "AuthorizationKey"), Some(&json!("AABBCCDD")));
        assert_eq!(config.get("Internal", "ChargePointId"), Some(&json!("cp001")));

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        config.write(&path).unwrap();
        assert_eq!(Ocpp16Config::load(&path).unwrap(), config);
    }
}
