//! Cleanup executor
//!
//! Deletes one VM backup together with the Longhorn snapshots behind its
//! volume backups. Every volume entry is attempted even if an earlier one
//! fails, and the backup record is deleted last.

use kube::ResourceExt;
use tracing::{debug, warn};

use super::backend::BackupBackend;
use crate::crd::VirtualMachineBackup;
use crate::snapshot::storage_snapshot_name;
use crate::{AggregateError, Error};

/// Delete a VM backup and its storage snapshots, best effort.
///
/// Objects that are already gone are not errors. An unnamed volume entry or
/// an unbound VolumeSnapshot is recorded and skipped.
pub async fn cleanse_vm_backup(
    backend: &dyn BackupBackend,
    backup: &VirtualMachineBackup,
) -> Result<(), AggregateError> {
    let namespace = backup.namespace().unwrap_or_default();
    let name = backup.name_any();
    let mut errors = AggregateError::new();

    for volume in backup.volume_backups() {
        let Some(snapshot_name) = volume.name.as_deref() else {
            errors.push(Error::storage(format!(
                "volume backup {} of vmbackup {}/{} has no volumesnapshot name",
                volume.volume_name, namespace, name
            )));
            continue;
        };

        if let Err(e) = delete_volume_snapshot_data(backend, &namespace, snapshot_name).await {
            warn!(
                vm_backup = %name,
                volume_snapshot = %snapshot_name,
                error = %e,
                "failed to delete storage snapshot"
            );
            errors.push(e);
        }
    }

    match backend.delete_vm_backup(&namespace, &name).await {
        Ok(()) => debug!(vm_backup = %name, "deleted vm backup"),
        Err(e) if e.is_not_found() => debug!(vm_backup = %name, "vm backup already deleted"),
        Err(e) => errors.push(e),
    }

    errors.into_result()
}

async fn delete_volume_snapshot_data(
    backend: &dyn BackupBackend,
    namespace: &str,
    snapshot_name: &str,
) -> Result<(), Error> {
    let snapshot = match backend.get_volume_snapshot(namespace, snapshot_name).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => return Ok(()),
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };

    let content = snapshot.bound_content_name().ok_or_else(|| {
        Error::storage(format!(
            "volumesnapshot {}/{} not bound to snapshotcontent",
            namespace, snapshot_name
        ))
    })?;

    match backend
        .delete_storage_snapshot(&storage_snapshot_name(content))
        .await
    {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::backend::MockBackupBackend;
    use crate::controller::registry::fixtures::*;
    use crate::snapshot::{VolumeSnapshot, VolumeSnapshotSpec, VolumeSnapshotStatus};

    fn bound_snapshot(name: &str, content: &str) -> VolumeSnapshot {
        let mut snap = VolumeSnapshot::new(name, VolumeSnapshotSpec::default());
        snap.status = Some(VolumeSnapshotStatus {
            bound_volume_snapshot_content_name: Some(content.to_string()),
            ready_to_use: Some(true),
        });
        snap
    }

    #[tokio::test]
    async fn deletes_storage_snapshot_then_record() {
        let mut mock = MockBackupBackend::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_get_volume_snapshot()
            .withf(|ns, name| ns == NS && name == "vs-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, name| Ok(Some(bound_snapshot(name, "snapcontent-abc"))));
        mock.expect_delete_storage_snapshot()
            .withf(|name| name == "snapshot-abc")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_delete_vm_backup()
            .withf(|ns, name| ns == NS && name == "svmb-uid-1-20240101.1001")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        assert!(cleanse_vm_backup(&mock, &ready(1)).await.is_ok());
    }

    /// Story: storage that was already reclaimed does not block deleting the record
    #[tokio::test]
    async fn story_absent_snapshot_still_deletes_record() {
        let mut mock = MockBackupBackend::new();
        mock.expect_get_volume_snapshot().returning(|_, _| Ok(None));
        mock.expect_delete_storage_snapshot().never();
        mock.expect_delete_vm_backup()
            .times(1)
            .returning(|_, _| Ok(()));

        assert!(cleanse_vm_backup(&mock, &failed(1)).await.is_ok());
    }

    #[tokio::test]
    async fn missing_longhorn_snapshot_and_record_are_benign() {
        let mut mock = MockBackupBackend::new();
        mock.expect_get_volume_snapshot()
            .returning(|_, name| Ok(Some(bound_snapshot(name, "snapcontent-abc"))));
        mock.expect_delete_storage_snapshot()
            .returning(|name| Err(Error::not_found("Snapshot", name)));
        mock.expect_delete_vm_backup()
            .returning(|ns, name| Err(Error::not_found("VirtualMachineBackup", format!("{ns}/{name}"))));

        assert!(cleanse_vm_backup(&mock, &ready(1)).await.is_ok());
    }

    /// Story: one bad volume is reported while the others and the record are
    /// still cleaned up
    #[tokio::test]
    async fn story_unbound_snapshot_is_reported_and_skipped() {
        let mut backup = ready(1);
        if let Some(status) = backup.status.as_mut() {
            status.volume_backups = vec![volume("vs-unbound"), volume("vs-bound")];
        }

        let mut mock = MockBackupBackend::new();
        mock.expect_get_volume_snapshot().returning(|_, name| {
            if name == "vs-unbound" {
                Ok(Some(VolumeSnapshot::new(name, VolumeSnapshotSpec::default())))
            } else {
                Ok(Some(bound_snapshot(name, "snapcontent-xyz")))
            }
        });
        mock.expect_delete_storage_snapshot()
            .withf(|name| name == "snapshot-xyz")
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_delete_vm_backup()
            .times(1)
            .returning(|_, _| Ok(()));

        let err = cleanse_vm_backup(&mock, &backup).await.unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err
            .to_string()
            .contains("volumesnapshot default/vs-unbound not bound to snapshotcontent"));
    }

    #[tokio::test]
    async fn unnamed_volume_entry_is_reported() {
        let mut backup = failed(1);
        if let Some(status) = backup.status.as_mut() {
            status.volume_backups[0].name = None;
        }

        let mut mock = MockBackupBackend::new();
        mock.expect_get_volume_snapshot().never();
        mock.expect_delete_vm_backup()
            .times(1)
            .returning(|_, _| Ok(()));

        let err = cleanse_vm_backup(&mock, &backup).await.unwrap_err();
        assert!(matches!(err.causes()[0], Error::Storage(_)));
    }

    #[tokio::test]
    async fn all_failures_are_aggregated() {
        let mut mock = MockBackupBackend::new();
        mock.expect_get_volume_snapshot()
            .returning(|_, _| Err(Error::internal("list snapshots failed")));
        mock.expect_delete_vm_backup()
            .returning(|_, _| Err(Error::internal("delete vmbackup failed")));

        let err = cleanse_vm_backup(&mock, &ready(1)).await.unwrap_err();
        assert_eq!(err.len(), 2);
        assert!(err.to_string().contains("list snapshots failed"));
        assert!(err.to_string().contains("delete vmbackup failed"));
    }

    #[tokio::test]
    async fn backup_without_status_only_deletes_record() {
        let mut mock = MockBackupBackend::new();
        mock.expect_get_volume_snapshot().never();
        mock.expect_delete_vm_backup()
            .times(1)
            .returning(|_, _| Ok(()));

        assert!(cleanse_vm_backup(&mock, &in_progress(1)).await.is_ok());
    }
}
