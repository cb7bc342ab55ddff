//! ScheduleVmBackup controller
//!
//! The reconciler is split by concern:
//!
//! - [`registry`] lists and classifies a schedule's VM backups
//! - [`cleanup`] deletes one backup and its storage snapshots
//! - [`retention`] applies `spec.retain`
//! - [`suspend`] trips and clears the failure suspension
//! - [`creation`] decides whether a trigger creates a backup
//! - [`status`] mirrors the backups into the schedule status
//!
//! [`schedule`] sequences them into one cycle. All external calls go through
//! the [`BackupBackend`] trait.

pub mod backend;
pub mod cleanup;
pub mod creation;
pub mod registry;
pub mod retention;
pub mod schedule;
pub mod status;
pub mod suspend;

pub use backend::{trigger_name, BackupBackend, KubeBackend};
pub use registry::{current_vm_backups, BackupInventory, ScheduleRef};
pub use schedule::{
    error_policy, on_trigger, reconcile, run_cycle, trigger_until_applied, Context,
    ControllerConfig, Outcome,
};
