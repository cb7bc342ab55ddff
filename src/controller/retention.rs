//! Retention garbage collection
//!
//! Brings a schedule's backup count down to `spec.retain`. Failed backups are
//! removed first (oldest first), then the oldest of the remainder. GC only
//! runs when the latest backup finished successfully: while it is running
//! the schedule is re-checked shortly, and after a failure GC is skipped so
//! the failure history stays visible.

use std::collections::BTreeSet;

use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use super::backend::BackupBackend;
use super::cleanup::cleanse_vm_backup;
use super::registry::BackupInventory;
use super::schedule::{Context, Outcome};
use crate::crd::{ScheduleVmBackup, VirtualMachineBackup};
use crate::events::{actions, reasons};
use crate::{AggregateError, Error};

/// Delete backups beyond the retention count.
///
/// Returns [`Outcome::Requeue`] when the latest backup is still in progress.
/// Cleanup failures and an unmet target are returned together; the backups
/// that were attempted count against the target either way.
pub async fn gc_vm_backups(
    ctx: &Context,
    schedule: &ScheduleVmBackup,
    inventory: &BackupInventory,
) -> Result<Outcome, AggregateError> {
    let Some(last) = inventory.last() else {
        return Ok(Outcome::Done);
    };

    if last.is_progressing() {
        debug!(vm_backup = %last.name_any(), "latest vm backup in progress, deferring gc");
        return Ok(Outcome::Requeue(ctx.config.recheck_interval));
    }

    if last.error().is_some() {
        debug!(vm_backup = %last.name_any(), "latest vm backup failed, skipping gc");
        return Ok(Outcome::Done);
    }

    let target = inventory
        .len()
        .saturating_sub(schedule.spec.retain as usize);
    if target == 0 {
        return Ok(Outcome::Done);
    }

    let backend = ctx.backend.as_ref();
    let mut errors = AggregateError::new();
    let mut seen = BTreeSet::new();

    let left = clear_vm_backups(backend, inventory.failed(), target, &mut seen, &mut errors).await;
    let left = clear_vm_backups(backend, inventory.backups().iter(), left, &mut seen, &mut errors).await;

    let deleted = target - left;
    if left > 0 {
        errors.push(Error::internal(format!(
            "schedule {} unable to gc {} vm backups",
            schedule.name_any(),
            left
        )));
    }

    if deleted > 0 {
        info!(deleted, retain = schedule.spec.retain, "applied retention");
        ctx.events
            .publish(
                &schedule.object_ref(&()),
                EventType::Normal,
                reasons::RETENTION_APPLIED,
                actions::GARBAGE_COLLECT,
                Some(format!(
                    "removed {} vm backups to keep {}",
                    deleted, schedule.spec.retain
                )),
            )
            .await;
    }

    if !errors.is_empty() {
        warn!(error = %errors, "retention gc incomplete");
    }
    errors.into_result().map(|()| Outcome::Done)
}

/// Clean up to `target` backups from `candidates`, skipping names in `seen`.
///
/// Returns how many of the target are left.
async fn clear_vm_backups<'a>(
    backend: &dyn BackupBackend,
    candidates: impl Iterator<Item = &'a VirtualMachineBackup>,
    target: usize,
    seen: &mut BTreeSet<String>,
    errors: &mut AggregateError,
) -> usize {
    let mut left = target;
    for backup in candidates {
        if left == 0 {
            break;
        }
        if !seen.insert(backup.name_any()) {
            continue;
        }
        left -= 1;

        if let Err(e) = cleanse_vm_backup(backend, backup).await {
            errors.extend(e);
        }
    }
    left
}
