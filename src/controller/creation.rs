//! Backup creation decision
//!
//! On every trigger the schedule either creates a new VM backup, suspends
//! itself because too many backups failed in a row, or waits for the
//! previous backup to finish.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use super::registry::{BackupInventory, ScheduleRef};
use super::schedule::Context;
use super::suspend::handle_reach_max_failure;
use crate::crd::{ScheduleVmBackup, ScheduleVmBackupSpec, VirtualMachineBackup};
use crate::events::{actions, reasons};
use crate::{
    Error, ANNOTATION_SVMBACKUP_ID, LABEL_SVMBACKUP_TIMESTAMP, LABEL_SVMBACKUP_UID,
    SVMBACKUP_PREFIX, TIMESTAMP_FORMAT,
};

/// What a trigger should do
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreationDecision {
    /// Create a new VM backup
    Create,
    /// Too many consecutive failures; suspend instead of creating
    Suspend {
        /// Current consecutive failures
        failure: u32,
        /// Configured tolerance
        max_failure: u32,
    },
    /// The latest backup is still running
    Wait {
        /// Name of the running backup
        last: String,
    },
}

/// Decide what to do for a trigger given the current backups
pub fn decide(inventory: &BackupInventory, spec: &ScheduleVmBackupSpec) -> CreationDecision {
    let Some(last) = inventory.last() else {
        return CreationDecision::Create;
    };

    if inventory.failure() >= spec.max_failure {
        return CreationDecision::Suspend {
            failure: inventory.failure(),
            max_failure: spec.max_failure,
        };
    }

    if last.is_progressing() {
        return CreationDecision::Wait {
            last: format!("{}/{}", last.namespace().unwrap_or_default(), last.name_any()),
        };
    }

    CreationDecision::Create
}

/// Format a trigger time as a backup timestamp (UTC, minute granularity)
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Deterministic VM backup name for a schedule UID and timestamp
pub fn vm_backup_name(schedule_uid: &str, timestamp: &str) -> String {
    format!("{}-{}-{}", SVMBACKUP_PREFIX, schedule_uid, timestamp)
}

/// Build the VM backup a schedule creates for one trigger
pub fn build_vm_backup(
    schedule: &ScheduleVmBackup,
    schedule_uid: &str,
    timestamp: &str,
) -> VirtualMachineBackup {
    VirtualMachineBackup {
        metadata: ObjectMeta {
            name: Some(vm_backup_name(schedule_uid, timestamp)),
            namespace: schedule.namespace(),
            labels: Some(BTreeMap::from([
                (LABEL_SVMBACKUP_UID.to_string(), schedule_uid.to_string()),
                (LABEL_SVMBACKUP_TIMESTAMP.to_string(), timestamp.to_string()),
            ])),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_SVMBACKUP_ID.to_string(),
                ScheduleRef::of(schedule).to_annotation(),
            )])),
            ..Default::default()
        },
        spec: schedule.spec.vm_backup_spec.clone(),
        status: None,
    }
}

/// Result of a trigger that did not fail
#[derive(Debug)]
pub enum Creation {
    /// A backup exists for this trigger (created now or by an earlier call)
    Created(VirtualMachineBackup),
    /// The schedule was suspended instead; carries the updated schedule
    Suspended(ScheduleVmBackup),
}

/// Handle one trigger at time `at`.
///
/// A still-running latest backup is reported as [`Error::BackupInProgress`]
/// so the trigger is retried. A name collision means the trigger already
/// fired this minute and the existing backup is returned.
pub async fn new_vm_backup(
    ctx: &Context,
    schedule: &ScheduleVmBackup,
    inventory: &BackupInventory,
    at: DateTime<Utc>,
) -> Result<Creation, Error> {
    match decide(inventory, &schedule.spec) {
        CreationDecision::Suspend { failure, .. } => {
            let updated = handle_reach_max_failure(ctx, schedule, failure).await?;
            Ok(Creation::Suspended(updated))
        }
        CreationDecision::Wait { last } => Err(Error::BackupInProgress(last)),
        CreationDecision::Create => {
            let uid = schedule
                .uid()
                .ok_or_else(|| Error::internal("ScheduleVmBackup has no UID"))?;
            let timestamp = format_timestamp(at);
            let backup = build_vm_backup(schedule, &uid, &timestamp);
            let name = backup.name_any();

            match ctx.backend.create_vm_backup(&backup).await {
                Ok(created) => {
                    info!(vm_backup = %name, "created vm backup");
                    ctx.events
                        .publish(
                            &schedule.object_ref(&()),
                            EventType::Normal,
                            reasons::BACKUP_CREATED,
                            actions::CREATE,
                            Some(format!("created vm backup {}", name)),
                        )
                        .await;
                    Ok(Creation::Created(created))
                }
                Err(Error::AlreadyExists { .. }) => {
                    debug!(vm_backup = %name, "vm backup for this trigger already exists");
                    let namespace = backup.namespace().unwrap_or_default();
                    let existing = ctx
                        .backend
                        .get_vm_backup(&namespace, &name)
                        .await?
                        .unwrap_or(backup);
                    Ok(Creation::Created(existing))
                }
                Err(e) => Err(e),
            }
        }
    }
}
