//! Backend seam for the schedule controller
//!
//! [`BackupBackend`] is everything the reconciler needs from the outside
//! world: the VM backup registry, the schedule object, the storage snapshot
//! chain and the trigger CronJob. [`KubeBackend`] is the kube-rs
//! implementation; tests use the generated `MockBackupBackend` or an
//! in-memory implementation.
//!
//! Deletes report an already-missing object as [`Error::NotFound`]; callers
//! decide whether that is benign.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::CronJob;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{ScheduleVmBackup, ScheduleVmBackupStatus, VirtualMachineBackup};
use crate::snapshot::{LonghornSnapshot, VolumeSnapshot};
use crate::{Error, LABEL_SVMBACKUP_UID, LONGHORN_SYSTEM_NAMESPACE, SVMBACKUP_PREFIX};

const KIND_VM_BACKUP: &str = "VirtualMachineBackup";
const KIND_SCHEDULE: &str = "ScheduleVmBackup";
const KIND_VOLUME_SNAPSHOT: &str = "VolumeSnapshot";
const KIND_STORAGE_SNAPSHOT: &str = "Snapshot";
const KIND_CRON_JOB: &str = "CronJob";

/// Name of the trigger CronJob for a schedule UID
pub fn trigger_name(schedule_uid: &str) -> String {
    format!("{}-{}", SVMBACKUP_PREFIX, schedule_uid)
}

/// Trait abstracting the registry, snapshot and trigger operations
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupBackend: Send + Sync {
    /// List VM backups labelled with the schedule UID (unordered)
    async fn list_vm_backups(
        &self,
        namespace: &str,
        schedule_uid: &str,
    ) -> Result<Vec<VirtualMachineBackup>, Error>;

    /// Get a VM backup by name
    async fn get_vm_backup(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineBackup>, Error>;

    /// Create a VM backup; a name collision is [`Error::AlreadyExists`]
    async fn create_vm_backup(
        &self,
        backup: &VirtualMachineBackup,
    ) -> Result<VirtualMachineBackup, Error>;

    /// Delete a VM backup with foreground propagation
    async fn delete_vm_backup(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a schedule by name
    async fn get_schedule(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ScheduleVmBackup>, Error>;

    /// Write the schedule status, guarded by the schedule's resourceVersion.
    ///
    /// Returns the updated object; a stale version is [`Error::Conflict`].
    async fn patch_schedule_status(
        &self,
        schedule: &ScheduleVmBackup,
        status: &ScheduleVmBackupStatus,
    ) -> Result<ScheduleVmBackup, Error>;

    /// Reset `spec.resumeRequest`, guarded by the schedule's resourceVersion
    async fn clear_resume_request(
        &self,
        schedule: &ScheduleVmBackup,
    ) -> Result<ScheduleVmBackup, Error>;

    /// Get a CSI VolumeSnapshot by name
    async fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>, Error>;

    /// Delete a storage (Longhorn) snapshot with foreground propagation
    async fn delete_storage_snapshot(&self, name: &str) -> Result<(), Error>;

    /// Pause or unpause the schedule's trigger. No write if already in that state.
    async fn set_trigger_suspended(
        &self,
        schedule: &ScheduleVmBackup,
        suspended: bool,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeBackend {
    client: Client,
    trigger_namespace: String,
}

impl KubeBackend {
    /// Create a backend; trigger CronJobs are looked up in `trigger_namespace`
    pub fn new(client: Client, trigger_namespace: impl Into<String>) -> Self {
        Self {
            client,
            trigger_namespace: trigger_namespace.into(),
        }
    }

    fn schedules(&self, schedule: &ScheduleVmBackup) -> Result<Api<ScheduleVmBackup>, Error> {
        let namespace = schedule
            .namespace()
            .ok_or_else(|| Error::internal("ScheduleVmBackup must be namespaced"))?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }
}

fn qualified(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Params for JSON merge patches; server-side apply settings do not apply
fn merge_params() -> PatchParams {
    PatchParams::default()
}

fn resource_version(schedule: &ScheduleVmBackup) -> Result<String, Error> {
    schedule
        .resource_version()
        .ok_or_else(|| Error::internal("ScheduleVmBackup has no resourceVersion"))
}

#[async_trait]
impl BackupBackend for KubeBackend {
    async fn list_vm_backups(
        &self,
        namespace: &str,
        schedule_uid: &str,
    ) -> Result<Vec<VirtualMachineBackup>, Error> {
        let api: Api<VirtualMachineBackup> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("{}={}", LABEL_SVMBACKUP_UID, schedule_uid));
        let list = api.list(&params).await?;
        Ok(list.items)
    }

    async fn get_vm_backup(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineBackup>, Error> {
        let api: Api<VirtualMachineBackup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_vm_backup(
        &self,
        backup: &VirtualMachineBackup,
    ) -> Result<VirtualMachineBackup, Error> {
        let namespace = backup
            .namespace()
            .ok_or_else(|| Error::internal("VirtualMachineBackup must be namespaced"))?;
        let name = backup.name_any();
        let api: Api<VirtualMachineBackup> = Api::namespaced(self.client.clone(), &namespace);

        match api.create(&PostParams::default(), backup).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::AlreadyExists {
                kind: KIND_VM_BACKUP,
                name: qualified(&namespace, &name),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_vm_backup(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<VirtualMachineBackup> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::foreground())
            .await
            .map_err(|e| Error::from_kube(KIND_VM_BACKUP, qualified(namespace, name), e))?;
        debug!(vm_backup = %qualified(namespace, name), "deleted vm backup");
        Ok(())
    }

    async fn get_schedule(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ScheduleVmBackup>, Error> {
        let api: Api<ScheduleVmBackup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_schedule_status(
        &self,
        schedule: &ScheduleVmBackup,
        status: &ScheduleVmBackupStatus,
    ) -> Result<ScheduleVmBackup, Error> {
        let api = self.schedules(schedule)?;
        let name = schedule.name_any();

        // resourceVersion in a merge patch makes the API server reject stale writes
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version(schedule)? },
            "status": status,
        });

        api.patch_status(&name, &merge_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                Error::from_kube(
                    KIND_SCHEDULE,
                    qualified(&schedule.namespace().unwrap_or_default(), &name),
                    e,
                )
            })
    }

    async fn clear_resume_request(
        &self,
        schedule: &ScheduleVmBackup,
    ) -> Result<ScheduleVmBackup, Error> {
        let api = self.schedules(schedule)?;
        let name = schedule.name_any();

        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version(schedule)? },
            "spec": { "resumeRequest": false },
        });

        api.patch(&name, &merge_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                Error::from_kube(
                    KIND_SCHEDULE,
                    qualified(&schedule.namespace().unwrap_or_default(), &name),
                    e,
                )
            })
    }

    async fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>, Error> {
        let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::from_kube(KIND_VOLUME_SNAPSHOT, qualified(namespace, name), e))
    }

    async fn delete_storage_snapshot(&self, name: &str) -> Result<(), Error> {
        let ar = LonghornSnapshot::api_resource();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), LONGHORN_SYSTEM_NAMESPACE, &ar);
        api.delete(name, &DeleteParams::foreground())
            .await
            .map_err(|e| {
                Error::from_kube(
                    KIND_STORAGE_SNAPSHOT,
                    qualified(LONGHORN_SYSTEM_NAMESPACE, name),
                    e,
                )
            })?;
        debug!(snapshot = %name, "deleted storage snapshot");
        Ok(())
    }

    async fn set_trigger_suspended(
        &self,
        schedule: &ScheduleVmBackup,
        suspended: bool,
    ) -> Result<(), Error> {
        let uid = schedule
            .uid()
            .ok_or_else(|| Error::internal("ScheduleVmBackup has no UID"))?;
        let name = trigger_name(&uid);
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), &self.trigger_namespace);

        let cron_job = api
            .get_opt(&name)
            .await?
            .ok_or_else(|| Error::not_found(KIND_CRON_JOB, qualified(&self.trigger_namespace, &name)))?;

        let current = cron_job
            .spec
            .as_ref()
            .and_then(|s| s.suspend)
            .unwrap_or(false);
        if current == suspended {
            return Ok(());
        }

        let patch = serde_json::json!({ "spec": { "suspend": suspended } });
        api.patch(&name, &merge_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(KIND_CRON_JOB, qualified(&self.trigger_namespace, &name), e))?;

        debug!(trigger = %name, suspended, "updated trigger suspend flag");
        Ok(())
    }
}
