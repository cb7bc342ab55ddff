//! Backup registry accessor
//!
//! Lists the VM backups a schedule owns, orders them by trigger timestamp and
//! derives the consecutive failure count. Also holds the weak
//! backup -> schedule back-reference carried in an annotation, resolved by
//! lookup when needed.

use chrono::NaiveDateTime;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tracing::debug;

use super::backend::BackupBackend;
use crate::crd::{ScheduleVmBackup, VirtualMachineBackup};
use crate::{Error, ANNOTATION_SVMBACKUP_ID, LABEL_SVMBACKUP_TIMESTAMP, TIMESTAMP_FORMAT};

/// Trigger timestamp of a backup, `None` if the label is missing or malformed
pub fn backup_timestamp(backup: &VirtualMachineBackup) -> Option<NaiveDateTime> {
    backup
        .labels()
        .get(LABEL_SVMBACKUP_TIMESTAMP)
        .and_then(|ts| NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok())
}

/// The backups of one schedule, oldest first, with the failure count
#[derive(Clone, Debug, Default)]
pub struct BackupInventory {
    backups: Vec<VirtualMachineBackup>,
    failure: u32,
}

impl BackupInventory {
    /// Sort and classify a raw listing.
    ///
    /// Backups without a parseable timestamp sort before all others; ties
    /// break on name. Walking oldest to newest, a failed backup increments
    /// the failure count and a ready one resets it, so a backup reporting
    /// both ends at zero. An in-progress backup leaves the count alone.
    pub fn classify(mut backups: Vec<VirtualMachineBackup>) -> Self {
        backups.sort_by_cached_key(|b| (backup_timestamp(b), b.name_any()));

        let failure = backups.iter().fold(0u32, |failure, b| {
            let failure = if b.error().is_some() {
                failure.saturating_add(1)
            } else {
                failure
            };
            if b.is_ready() {
                0
            } else {
                failure
            }
        });

        Self { backups, failure }
    }

    /// All backups, oldest first
    pub fn backups(&self) -> &[VirtualMachineBackup] {
        &self.backups
    }

    /// Failed backups, oldest first
    pub fn failed(&self) -> impl Iterator<Item = &VirtualMachineBackup> {
        self.backups.iter().filter(|b| b.error().is_some())
    }

    /// Most recent backup
    pub fn last(&self) -> Option<&VirtualMachineBackup> {
        self.backups.last()
    }

    /// Consecutive failures since the last ready backup
    pub fn failure(&self) -> u32 {
        self.failure
    }

    /// Number of backups
    pub fn len(&self) -> usize {
        self.backups.len()
    }

    /// True if the schedule owns no backups
    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }
}

/// Load and classify the backups labelled with the schedule's UID
pub async fn current_vm_backups(
    backend: &dyn BackupBackend,
    schedule: &ScheduleVmBackup,
) -> Result<BackupInventory, Error> {
    let uid = schedule
        .uid()
        .ok_or_else(|| Error::internal("ScheduleVmBackup has no UID"))?;
    let namespace = schedule.namespace().unwrap_or_default();

    let backups = backend.list_vm_backups(&namespace, &uid).await?;
    let inventory = BackupInventory::classify(backups);
    debug!(
        count = inventory.len(),
        failure = inventory.failure(),
        "loaded vm backups"
    );
    Ok(inventory)
}

/// Weak reference from a VM backup to the schedule that created it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduleRef {
    /// Schedule namespace
    pub namespace: String,
    /// Schedule name
    pub name: String,
}

impl ScheduleRef {
    /// Reference to an existing schedule
    pub fn of(schedule: &ScheduleVmBackup) -> Self {
        Self {
            namespace: schedule.namespace().unwrap_or_default(),
            name: schedule.name_any(),
        }
    }

    /// Parse `namespace/name`, or a bare `name` in `default_namespace`
    pub fn parse(value: &str, default_namespace: &str) -> Option<Self> {
        let (namespace, name) = match value.split_once('/') {
            Some((ns, name)) => (ns, name),
            None => (default_namespace, value),
        };
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// Read the reference from a backup's annotation
    pub fn from_backup(backup: &VirtualMachineBackup) -> Option<Self> {
        let value = backup.annotations().get(ANNOTATION_SVMBACKUP_ID)?;
        Self::parse(value, &backup.namespace().unwrap_or_default())
    }

    /// Annotation value (`namespace/name`)
    pub fn to_annotation(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Controller object reference, used to map backup events to schedules
    pub fn object_ref(&self) -> ObjectRef<ScheduleVmBackup> {
        ObjectRef::new(&self.name).within(&self.namespace)
    }

    /// Look the schedule up. A deleted schedule is `None`, not an error.
    pub async fn resolve(
        &self,
        backend: &dyn BackupBackend,
    ) -> Result<Option<ScheduleVmBackup>, Error> {
        let schedule = backend.get_schedule(&self.namespace, &self.name).await?;
        if schedule.is_none() {
            debug!(schedule = %self.to_annotation(), "schedule reference is dangling");
        }
        Ok(schedule)
    }
}
