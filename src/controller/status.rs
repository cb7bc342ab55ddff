//! Status reconciler
//!
//! Mirrors the schedule's backups into `status.vmBackupInfo` and
//! `status.failure`. The write is skipped when nothing changed so idle
//! schedules do not generate update traffic.

use kube::ResourceExt;
use tracing::debug;

use super::registry::BackupInventory;
use super::schedule::Context;
use crate::crd::{
    ScheduleVmBackup, ScheduleVmBackupStatus, VirtualMachineBackup, VmBackupInfo,
    VolumeBackupInfo,
};
use crate::Error;

/// Summary of one VM backup for the schedule status
pub fn vm_backup_info(backup: &VirtualMachineBackup) -> VmBackupInfo {
    let Some(status) = backup.status.as_ref() else {
        return VmBackupInfo {
            name: backup.name_any(),
            ..Default::default()
        };
    };

    VmBackupInfo {
        name: backup.name_any(),
        ready_to_use: status.ready_to_use,
        error: status.error.as_ref().map(|e| e.message()),
        volume_backup_info: status
            .volume_backups
            .iter()
            .map(|vb| VolumeBackupInfo {
                name: vb.name.clone(),
                ready_to_use: vb.ready_to_use,
                error: vb.error.as_ref().map(|e| e.message()),
            })
            .collect(),
    }
}

/// Recompute the backup list and failure count, keeping suspension state
pub fn desired_status(
    current: &ScheduleVmBackupStatus,
    inventory: &BackupInventory,
) -> ScheduleVmBackupStatus {
    ScheduleVmBackupStatus {
        vm_backup_info: inventory.backups().iter().map(vm_backup_info).collect(),
        failure: inventory.failure(),
        suspended: current.suspended,
        conditions: current.conditions.clone(),
    }
}

/// Persist the recomputed status if it differs from the stored one.
///
/// Returns the updated schedule, or `None` when no write was needed.
pub async fn reconcile_vm_backup_list(
    ctx: &Context,
    schedule: &ScheduleVmBackup,
    inventory: &BackupInventory,
) -> Result<Option<ScheduleVmBackup>, Error> {
    let current = schedule.status_or_default();
    let desired = desired_status(&current, inventory);

    if schedule.status.as_ref() == Some(&desired) {
        debug!("status unchanged, skipping update");
        return Ok(None);
    }

    let updated = ctx.backend.patch_schedule_status(schedule, &desired).await?;
    debug!(
        backups = desired.vm_backup_info.len(),
        failure = desired.failure,
        "updated schedule status"
    );
    Ok(Some(updated))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::controller::backend::MockBackupBackend;
    use crate::controller::registry::fixtures::*;
    use crate::controller::ControllerConfig;
    use crate::events::NoopEventPublisher;

    fn context(mock: MockBackupBackend) -> Context {
        Context::for_testing(
            Arc::new(mock),
            Arc::new(NoopEventPublisher),
            ControllerConfig::default(),
        )
    }

    #[test]
    fn info_copies_backup_and_volume_fields() {
        let info = vm_backup_info(&failed(1));
        assert_eq!(info.name, "svmb-uid-1-20240101.1001");
        assert_eq!(info.ready_to_use, Some(false));
        assert_eq!(info.error.as_deref(), Some("snapshot timeout"));
        assert_eq!(info.volume_backup_info.len(), 1);
        assert_eq!(info.volume_backup_info[0].name.as_deref(), Some("vs-1"));
        assert_eq!(info.volume_backup_info[0].ready_to_use, Some(true));
    }

    #[test]
    fn info_for_backup_without_status_has_only_name() {
        let info = vm_backup_info(&in_progress(1));
        assert_eq!(
            info,
            VmBackupInfo {
                name: "svmb-uid-1-20240101.1001".to_string(),
                ..Default::default()
            }
        );
    }

    #[test]
    fn desired_status_keeps_suspension_state() {
        let current = ScheduleVmBackupStatus {
            suspended: true,
            failure: 9,
            ..Default::default()
        };
        let inventory = BackupInventory::classify(vec![ready(1), failed(2)]);

        let desired = desired_status(&current, &inventory);
        assert!(desired.suspended);
        assert_eq!(desired.failure, 1);
        assert_eq!(desired.vm_backup_info.len(), 2);
    }

    #[tokio::test]
    async fn changed_status_is_written() {
        let mut mock = MockBackupBackend::new();
        mock.expect_patch_schedule_status()
            .withf(|_, status| status.vm_backup_info.len() == 2 && status.failure == 1)
            .times(1)
            .returning(|schedule, status| {
                let mut updated = schedule.clone();
                updated.status = Some(status.clone());
                Ok(updated)
            });
        let ctx = context(mock);

        let inventory = BackupInventory::classify(vec![ready(1), failed(2)]);
        let updated = reconcile_vm_backup_list(&ctx, &schedule(3, 2), &inventory)
            .await
            .unwrap();
        assert!(updated.is_some());
    }

    /// Story: an idle schedule whose status already matches is not rewritten
    #[tokio::test]
    async fn story_identical_status_skips_write() {
        let inventory = BackupInventory::classify(vec![ready(1), ready(2)]);
        let mut schedule = schedule(3, 2);
        schedule.status = Some(desired_status(&Default::default(), &inventory));

        let mut mock = MockBackupBackend::new();
        mock.expect_patch_schedule_status().never();
        let ctx = context(mock);

        let updated = reconcile_vm_backup_list(&ctx, &schedule, &inventory)
            .await
            .unwrap();
        assert!(updated.is_none());
    }

    #[tokio::test]
    async fn conflict_is_propagated() {
        let mut mock = MockBackupBackend::new();
        mock.expect_patch_schedule_status().returning(|_, _| {
            Err(Error::Conflict {
                kind: "ScheduleVmBackup",
                name: "default/nightly".to_string(),
            })
        });
        let ctx = context(mock);

        let inventory = BackupInventory::classify(vec![ready(1)]);
        let err = reconcile_vm_backup_list(&ctx, &schedule(3, 2), &inventory)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
