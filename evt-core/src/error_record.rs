//! Error records raised by modules
//!
//! An error is identified by its type, sub-type and origin. At most one
//! record per identity is active at a time; clearing keeps the record in the
//! history with its new state so error-history queries can filter on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ErrorRecordError {
    #[error("error {error_type}/{sub_type} from {origin} is already active")]
    AlreadyActive {
        error_type: String,
        sub_type: String,
        origin: ImplementationIdentifier,
    },

    #[error("no active error {error_type}/{sub_type} from {origin}")]
    NotActive {
        error_type: String,
        sub_type: String,
        origin: ImplementationIdentifier,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorState {
    Active,
    ClearedByModule,
    ClearedByReboot,
}

/// Module and implementation an error originates from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImplementationIdentifier {
    pub module_id: String,
    pub implementation_id: String,
}

impl ImplementationIdentifier {
    pub fn new(module_id: impl Into<String>, implementation_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            implementation_id: implementation_id.into(),
        }
    }
}

impl fmt::Display for ImplementationIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module_id, self.implementation_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default)]
    pub sub_type: String,
    pub message: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    pub origin: ImplementationIdentifier,
    pub timestamp: DateTime<Utc>,
    pub uuid: String,
    pub state: ErrorState,
}

impl ErrorRecord {
    pub fn new(
        error_type: impl Into<String>,
        sub_type: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        origin: ImplementationIdentifier,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            sub_type: sub_type.into(),
            message: message.into(),
            description: String::new(),
            severity,
            origin,
            timestamp: Utc::now(),
            uuid: uuid::Uuid::new_v4().to_string(),
            state: ErrorState::Active,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn same_identity(&self, error_type: &str, sub_type: &str, origin: &ImplementationIdentifier) -> bool {
        self.error_type == error_type && self.sub_type == sub_type && &self.origin == origin
    }
}

/// Lower severity bound for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeverityFilter {
    #[serde(rename = "LOW_GE")]
    LowGe,
    #[serde(rename = "MEDIUM_GE")]
    MediumGe,
    #[serde(rename = "HIGH_GE")]
    HighGe,
}

impl SeverityFilter {
    pub fn admits(&self, severity: Severity) -> bool {
        let floor = match self {
            SeverityFilter::LowGe => Severity::Low,
            SeverityFilter::MediumGe => Severity::Medium,
            SeverityFilter::HighGe => Severity::High,
        };
        severity >= floor
    }
}

/// Conjunctive query over error records. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_filter: Option<ErrorState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_filter: Option<ImplementationIdentifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_filter: Option<SeverityFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle_filter: Option<String>,
}

impl ErrorFilter {
    pub fn state(mut self, state: ErrorState) -> Self {
        self.state_filter = Some(state);
        self
    }

    pub fn origin(mut self, origin: ImplementationIdentifier) -> Self {
        self.origin_filter = Some(origin);
        self
    }

    pub fn error_type(mut self, error_type: impl Into<String>) -> Self {
        self.type_filter = Some(error_type.into());
        self
    }

    pub fn severity(mut self, severity: SeverityFilter) -> Self {
        self.severity_filter = Some(severity);
        self
    }

    pub fn handle(mut self, uuid: impl Into<String>) -> Self {
        self.handle_filter = Some(uuid.into());
        self
    }

    pub fn matches(&self, record: &ErrorRecord) -> bool {
        self.state_filter.map_or(true, |s| s == record.state)
            && self.origin_filter.as_ref().map_or(true, |o| *o == record.origin)
            && self.type_filter.as_ref().map_or(true, |t| *t == record.error_type)
            && self.severity_filter.map_or(true, |s| s.admits(record.severity))
            && self.handle_filter.as_ref().map_or(true, |h| *h == record.uuid)
    }
}

/// History of raised errors with at-most-one-active per identity
#[derive(Debug, Default)]
pub struct ErrorRegistry {
    records: Vec<ErrorRecord>,
}

impl ErrorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an active record
    pub fn raise(&mut self, record: ErrorRecord) -> Result<&ErrorRecord, ErrorRecordError> {
        let duplicate = self.records.iter().any(|r| {
            r.state == ErrorState::Active && r.same_identity(&record.error_type, &record.sub_type, &record.origin)
        });
        if duplicate {
            return Err(ErrorRecordError::AlreadyActive {
                error_type: record.error_type,
                sub_type: record.sub_type,
                origin: record.origin,
            });
        }

        let mut record = record;
        record.state = ErrorState::Active;
        self.records.push(record);
        let index = self.records.len() - 1;
        Ok(&self.records[index])
    }

    /// Clear the active record with this identity
    pub fn clear(
        &mut self,
        error_type: &str,
        sub_type: &str,
        origin: &ImplementationIdentifier,
    ) -> Result<ErrorRecord, ErrorRecordError> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.state == ErrorState::Active && r.same_identity(error_type, sub_type, origin))
            .ok_or_else(|| ErrorRecordError::NotActive {
                error_type: error_type.to_string(),
                sub_type: sub_type.to_string(),
                origin: origin.clone(),
            })?;
        record.state = ErrorState::ClearedByModule;
        Ok(record.clone())
    }

    /// Clear an active record by its identifier
    pub fn clear_by_uuid(&mut self, uuid: &str) -> Option<ErrorRecord> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.state == ErrorState::Active && r.uuid == uuid)?;
        record.state = ErrorState::ClearedByModule;
        Some(record.clone())
    }

    /// Clear every active record of an origin
    pub fn clear_all(&mut self, origin: &ImplementationIdentifier) -> Vec<ErrorRecord> {
        self.records
            .iter_mut()
            .filter(|r| r.state == ErrorState::Active && &r.origin == origin)
            .map(|r| {
                r.state = ErrorState::ClearedByModule;
                r.clone()
            })
            .collect()
    }

    /// Mark everything still active as cleared by a restart
    pub fn clear_on_reboot(&mut self) -> usize {
        let mut count = 0;
        for r in self.records.iter_mut().filter(|r| r.state == ErrorState::Active) {
            r.state = ErrorState::ClearedByReboot;
            count += 1;
        }
        count
    }

    pub fn active(&self) -> Vec<ErrorRecord> {
        self.query(&ErrorFilter::default().state(ErrorState::Active))
    }

    pub fn query(&self, filter: &ErrorFilter) -> Vec<ErrorRecord> {
        self.records.iter().filter(|r| filter.matches(r)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
