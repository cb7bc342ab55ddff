//! Lattice VM Backup - scheduled virtual machine backups with retention and auto-suspend
//!
//! A `ScheduleVmBackup` describes a cron cadence, a retention count and a
//! failure tolerance. The controller in this crate creates point-in-time
//! `VirtualMachineBackup` resources on each trigger, garbage-collects old
//! backups (and their storage snapshots) to honor retention, tracks the
//! consecutive failure count, and suspends the schedule once failures reach
//! the configured threshold. An operator resumes a suspended schedule by
//! setting `spec.resumeRequest`.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (ScheduleVmBackup, VirtualMachineBackup)
//! - [`controller`] - Reconciliation: registry, cleanup, retention, suspend, creation, status
//! - [`snapshot`] - Storage snapshot resources consumed during cleanup
//! - [`events`] - Kubernetes Event publishing
//! - [`retry`] - Backoff for the cron trigger
//! - [`telemetry`] - Logging initialization
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod retry;
pub mod snapshot;
pub mod telemetry;

pub use error::{AggregateError, Error};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Labels, annotations and naming
// =============================================================================

/// Label carrying the UID of the schedule that created a VM backup
pub const LABEL_SVMBACKUP_UID: &str = "harvesterhci.io/svmbackupUID";

/// Label carrying the trigger timestamp a VM backup was created for
pub const LABEL_SVMBACKUP_TIMESTAMP: &str = "harvesterhci.io/svmbackupTimestamp";

/// Annotation holding the `namespace/name` back-reference to the schedule
pub const ANNOTATION_SVMBACKUP_ID: &str = "harvesterhci.io/svmbackupId";

/// Prefix for names derived from a schedule (VM backups, trigger CronJob)
pub const SVMBACKUP_PREFIX: &str = "svmb";

/// Trigger timestamp format.
///
/// Minute granularity: stable within one cron fire, unique across fires.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d.%H%M";

// =============================================================================
// Defaults
// =============================================================================

/// Namespace holding the trigger CronJobs
pub const DEFAULT_TRIGGER_NAMESPACE: &str = "lattice-system";

/// Namespace where Longhorn keeps its Snapshot resources
pub const LONGHORN_SYSTEM_NAMESPACE: &str = "longhorn-system";

/// Delay before re-checking a schedule whose latest backup is still running
pub const DEFAULT_RECHECK_INTERVAL_SECS: u64 = 5;

/// Periodic resync for healthy schedules
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 300;

/// How long one cron trigger keeps retrying; should match the cron period
pub const DEFAULT_TRIGGER_DEADLINE_SECS: u64 = 3600;

/// Field manager / reporting component name
pub const CONTROLLER_NAME: &str = "lattice-vm-backup-controller";
