//! ScheduleVmBackup Custom Resource Definition
//!
//! A ScheduleVmBackup is a backup policy for one virtual machine: how often to
//! back it up, how many backups to keep, and how many consecutive failures to
//! tolerate before pausing.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{find_condition, Condition, ConditionKind};
use super::vm_backup::VirtualMachineBackupSpec;

/// Specification for a ScheduleVmBackup
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.dev",
    version = "v1alpha1",
    kind = "ScheduleVmBackup",
    plural = "schedulevmbackups",
    shortname = "svmb",
    status = "ScheduleVmBackupStatus",
    namespaced,
    printcolumn = r#"{"name":"Cron","type":"string","jsonPath":".spec.cron"}"#,
    printcolumn = r#"{"name":"Retain","type":"integer","jsonPath":".spec.retain"}"#,
    printcolumn = r#"{"name":"Failure","type":"integer","jsonPath":".status.failure"}"#,
    printcolumn = r#"{"name":"Suspended","type":"boolean","jsonPath":".status.suspended"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleVmBackupSpec {
    /// Standard 5-field cron expression driving the trigger
    pub cron: String,

    /// Number of backups to keep
    pub retain: u32,

    /// Consecutive failures that suspend the schedule
    pub max_failure: u32,

    /// Set by an operator to resume a suspended schedule; cleared once resumed
    #[serde(default)]
    pub resume_request: bool,

    /// Template for every VirtualMachineBackup this schedule creates
    pub vm_backup_spec: VirtualMachineBackupSpec,
}

impl ScheduleVmBackupSpec {
    /// Validate the policy fields.
    ///
    /// Admission enforces the same rules; reconciliation assumes they hold.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.cron.split_whitespace().count() != 5 {
            return Err(crate::Error::validation(format!(
                "spec.cron: expected 5 fields, got '{}'",
                self.cron
            )));
        }
        if self.retain == 0 {
            return Err(crate::Error::validation("spec.retain must be at least 1"));
        }
        if self.max_failure >= self.retain {
            return Err(crate::Error::validation(
                "spec.maxFailure: max failure should be less than retain",
            ));
        }
        Ok(())
    }
}

/// Summary of one volume backup, as recorded on the schedule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBackupInfo {
    /// VolumeSnapshot name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Ready flag as reported by the backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    /// Error message, if the volume backup failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of one VM backup, as recorded on the schedule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmBackupInfo {
    /// VirtualMachineBackup name
    pub name: String,
    /// Ready flag as reported by the backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    /// Error message, if the backup failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-volume summaries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_backup_info: Vec<VolumeBackupInfo>,
}

/// Status of a ScheduleVmBackup
///
/// Lists are always serialized (even when empty) because status is written
/// with a merge patch, where an omitted key would keep the stale value.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleVmBackupStatus {
    /// Backups currently owned by the schedule, oldest first
    #[serde(default)]
    pub vm_backup_info: Vec<VmBackupInfo>,

    /// Consecutive failures since the last successful backup
    #[serde(default)]
    pub failure: u32,

    /// True while backups are paused after reaching max failure
    #[serde(default)]
    pub suspended: bool,

    /// Conditions (BackupSuspend)
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ScheduleVmBackupStatus {
    /// The BackupSuspend condition, if it was ever set
    pub fn suspend_condition(&self) -> Option<&Condition> {
        find_condition(&self.conditions, ConditionKind::BackupSuspend)
    }
}

impl ScheduleVmBackup {
    /// True if the schedule is currently suspended
    pub fn is_suspended(&self) -> bool {
        self.status.as_ref().map(|s| s.suspended).unwrap_or(false)
    }

    /// Current status, or the default for a schedule never reconciled
    pub fn status_or_default(&self) -> ScheduleVmBackupStatus {
        self.status.clone().unwrap_or_default()
    }
}
