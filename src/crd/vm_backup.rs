//! VirtualMachineBackup resource
//!
//! Typed view of the `harvesterhci.io/v1beta1` VirtualMachineBackup CRD. The
//! schedule controller creates these from its template and reads back their
//! status; only the fields the controller needs are modelled.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Whether the backup is exported to the backup target or kept as a snapshot
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Data is exported to the configured backup target
    #[default]
    Backup,
    /// Data stays in-cluster as volume snapshots
    Snapshot,
}

/// Reference to the virtual machine being backed up
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmSourceRef {
    /// API group of the source (e.g., "kubevirt.io")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    /// Kind of the source (e.g., "VirtualMachine")
    pub kind: String,
    /// Name of the source in the backup's namespace
    pub name: String,
}

/// Specification for a VirtualMachineBackup
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "harvesterhci.io",
    version = "v1beta1",
    kind = "VirtualMachineBackup",
    plural = "virtualmachinebackups",
    status = "VirtualMachineBackupStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineBackupSpec {
    /// The virtual machine to back up
    pub source: VmSourceRef,

    /// Backup or snapshot
    #[serde(default, rename = "type")]
    pub type_: BackupType,
}

/// Error reported by the backup engine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupError {
    /// When the error was observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// Error details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BackupError {
    /// Message text, empty if the engine did not provide one
    pub fn message(&self) -> String {
        self.message.clone().unwrap_or_default()
    }
}

/// Per-volume backup entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBackup {
    /// Name of the VolumeSnapshot backing this entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Name of the volume inside the VM
    #[serde(default)]
    pub volume_name: String,
    /// True once the volume backup is complete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    /// Last error for this volume, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BackupError>,
}

/// Status of a VirtualMachineBackup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineBackupStatus {
    /// True once every volume backup is complete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    /// Set when the backup failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BackupError>,
    /// Per-volume entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_backups: Vec<VolumeBackup>,
}

impl VirtualMachineBackup {
    /// The backup's error, if it failed
    pub fn error(&self) -> Option<&BackupError> {
        self.status.as_ref().and_then(|s| s.error.as_ref())
    }

    /// True if the backup completed successfully
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    /// True if the backup has neither failed nor completed.
    ///
    /// A backup with no status yet is in progress.
    pub fn is_progressing(&self) -> bool {
        self.error().is_none() && !self.is_ready()
    }

    /// Volume entries, empty when the backup has no status yet
    pub fn volume_backups(&self) -> &[VolumeBackup] {
        self.status
            .as_ref()
            .map(|s| s.volume_backups.as_slice())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn backup_with_status(status: Option<VirtualMachineBackupStatus>) -> VirtualMachineBackup {
        VirtualMachineBackup {
            metadata: ObjectMeta {
                name: Some("b".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: VirtualMachineBackupSpec::default(),
            status,
        }
    }

    #[test]
    fn missing_status_is_in_progress() {
        let backup = backup_with_status(None);
        assert!(backup.is_progressing());
        assert!(!backup.is_ready());
        assert!(backup.error().is_none());
        assert!(backup.volume_backups().is_empty());
    }

    #[test]
    fn ready_backup_is_not_progressing() {
        let backup = backup_with_status(Some(VirtualMachineBackupStatus {
            ready_to_use: Some(true),
            ..Default::default()
        }));
        assert!(backup.is_ready());
        assert!(!backup.is_progressing());
    }

    #[test]
    fn failed_backup_is_not_progressing() {
        let backup = backup_with_status(Some(VirtualMachineBackupStatus {
            ready_to_use: Some(false),
            error: Some(BackupError {
                time: None,
                message: Some("volume attach timeout".to_string()),
            }),
            ..Default::default()
        }));
        assert!(!backup.is_progressing());
        assert_eq!(backup.error().unwrap().message(), "volume attach timeout");
    }

    #[test]
    fn spec_serializes_type_field() {
        let spec = VirtualMachineBackupSpec {
            source: VmSourceRef {
                api_group: Some("kubevirt.io".to_string()),
                kind: "VirtualMachine".to_string(),
                name: "vm1".to_string(),
            },
            type_: BackupType::Snapshot,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["source"]["apiGroup"], "kubevirt.io");
    }
}
