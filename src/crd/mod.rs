//! Custom Resource Definitions for Lattice VM backups
//!
//! `ScheduleVmBackup` is owned by this controller. `VirtualMachineBackup` is
//! created by it but reconciled by the VM platform's backup engine.

mod schedule;
mod types;
mod vm_backup;

pub use schedule::{
    ScheduleVmBackup, ScheduleVmBackupSpec, ScheduleVmBackupStatus, VmBackupInfo,
    VolumeBackupInfo,
};
pub use types::{find_condition, set_condition, Condition, ConditionKind, ConditionStatus};
pub use vm_backup::{
    BackupError, BackupType, VirtualMachineBackup, VirtualMachineBackupSpec,
    VirtualMachineBackupStatus, VmSourceRef, VolumeBackup,
};
