//! Storage Type Definitions
//!
//! This module defines the data structures stored and returned by the storage layer.
//!
//! ## Types Overview
//!
//! ### ReportItem
//! One rule hit as it arrives from the transport: rule module, error key and the raw
//! template data bytes. Written into the `rule_hit` table.
//!
//! ### RuleOnReport
//! One rule hit as it is read back, with its template data decoded into
//! [`TemplateData`].
//!
//! ### ClusterRuleToggle
//! Per-cluster enable/disable override for a rule.
//!
//! ### ConsumerMessage
//! The transport message that failed processing, recorded by the consumer error log.
//!
//! ## Design Decisions
//!
//! - The report blob is opaque text; the storage never parses it
//! - Timestamps are `DateTime<Utc>` in the API and microseconds since epoch in the database
//! - Cluster names are globally unique, org ids are informational for most lookups

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Organization identifier.
pub type OrgId = i64;

/// Cluster identifier (UUID string), unique across all organizations.
pub type ClusterName = String;

/// Fully qualified rule module name, e.g. `ccx_rules_ocp.external.rules.nodes_kubelet_version_check`.
pub type RuleId = String;

/// Error key within a rule module.
pub type ErrorKey = String;

/// Transport offset of the message that carried a report.
pub type KafkaOffset = i64;

/// Opaque report payload, stored as received.
pub type ClusterReport = String;

/// A rule hit to be written together with a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportItem {
    /// Rule module (fully qualified rule name)
    pub module: RuleId,

    /// Error key triggered by the rule
    pub error_key: ErrorKey,

    /// Raw template data, usually a JSON document
    pub template_data: Vec<u8>,
}

impl ReportItem {
    pub fn new(module: impl Into<String>, error_key: impl Into<String>, template_data: impl Into<Vec<u8>>) -> Self {
        Self {
            module: module.into(),
            error_key: error_key.into(),
            template_data: template_data.into(),
        }
    }
}

/// Template data of a rule hit.
///
/// Template data is stored verbatim. When it is well-formed JSON it is returned parsed,
/// otherwise the raw bytes come back unchanged so that callers always get something
/// usable.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TemplateData {
    /// Well-formed JSON document
    Parsed(serde_json::Value),

    /// Anything that failed to parse as JSON
    Opaque(Vec<u8>),
}

impl TemplateData {
    pub fn is_parsed(&self) -> bool {
        matches!(self, TemplateData::Parsed(_))
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            TemplateData::Parsed(value) => Some(value),
            TemplateData::Opaque(_) => None,
        }
    }
}

/// Decode stored template data.
///
/// Never fails: malformed input falls back to [`TemplateData::Opaque`].
pub fn decode_template_data(bytes: &[u8]) -> TemplateData {
    match serde_json::from_slice(bytes) {
        Ok(value) => TemplateData::Parsed(value),
        Err(e) => {
            tracing::warn!(error = %e, "unable to parse template data as json");
            TemplateData::Opaque(bytes.to_vec())
        }
    }
}

/// A rule hit read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleOnReport {
    pub module: RuleId,
    pub error_key: ErrorKey,
    pub template_data: TemplateData,
}

/// Rule hits of a cluster together with the time its report was checked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredReport {
    pub rules: Vec<RuleOnReport>,
    pub last_checked_at: DateTime<Utc>,
}

/// Enable/disable state of a rule toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleToggle {
    Enabled,
    Disabled,
}

impl RuleToggle {
    pub fn is_disabled(self) -> bool {
        self == RuleToggle::Disabled
    }

    /// Column value of the `disabled` flag.
    pub(crate) fn as_db(self) -> i64 {
        match self {
            RuleToggle::Enabled => 0,
            RuleToggle::Disabled => 1,
        }
    }

    pub(crate) fn from_db(value: i64) -> Self {
        if value == 0 {
            RuleToggle::Enabled
        } else {
            RuleToggle::Disabled
        }
    }
}

impl From<bool> for RuleToggle {
    fn from(disabled: bool) -> Self {
        if disabled {
            RuleToggle::Disabled
        } else {
            RuleToggle::Enabled
        }
    }
}

/// A row of `cluster_rule_toggle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRuleToggle {
    pub cluster_id: ClusterName,
    pub rule_id: RuleId,
    pub error_key: ErrorKey,
    pub disabled: RuleToggle,
    pub disabled_at: Option<DateTime<Utc>>,
    pub enabled_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A transport message that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub produced_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_default()
}

/// Drop the sub-microsecond part, so the value compares equal to what the database
/// gives back.
pub(crate) fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_micros(to_micros(ts))
}
