//! Shared status types for Lattice VM backup CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// The closed set of condition kinds a schedule reports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionKind {
    /// Backups are paused because consecutive failures reached the limit
    BackupSuspend,
}

impl ConditionKind {
    /// The `type` string written to the condition
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BackupSuspend => "BackupSuspend",
        }
    }
}

impl std::fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., BackupSuspend)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        kind: ConditionKind,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: kind.as_str().to_string(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Find the condition of the given kind
pub fn find_condition(conditions: &[Condition], kind: ConditionKind) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == kind.as_str())
}

/// Set a condition in place.
///
/// The transition time only moves when the status value changes, so setting
/// the same status/reason/message twice leaves the list structurally equal.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    kind: ConditionKind,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    match conditions.iter_mut().find(|c| c.type_ == kind.as_str()) {
        Some(existing) => {
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = Utc::now();
            }
            if existing.reason != reason {
                existing.reason = reason.to_string();
            }
            if existing.message != message {
                existing.message = message.to_string();
            }
        }
        None => conditions.push(Condition::new(kind, status, reason, message)),
    }
}
