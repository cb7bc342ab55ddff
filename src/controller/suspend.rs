//! Failure / suspend state machine
//!
//! A schedule is suspended once its consecutive failure count reaches
//! `spec.maxFailure`: the trigger is paused and the `BackupSuspend` condition
//! is set. Setting `spec.resumeRequest` resumes it. If the failure count is
//! still at the threshold, the failed backups are purged first and the resume
//! completes on the next cycle.

use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use super::cleanup::cleanse_vm_backup;
use super::registry::BackupInventory;
use super::schedule::Context;
use crate::crd::{set_condition, ConditionKind, ConditionStatus, ScheduleVmBackup, ScheduleVmBackupStatus};
use crate::events::{actions, reasons};
use crate::{AggregateError, Error};

/// Condition reason while suspended after too many failures
pub const REASON_REACH_MAX_FAILURE: &str = "ReachMaxFailure";

/// Condition message for a schedule suspended at `failure` failures
pub fn max_failure_message(failure: u32, max_failure: u32) -> String {
    format!(
        "failure backups {} reach max tolerance {}",
        failure, max_failure
    )
}

/// Status with the suspend flag and `BackupSuspend` condition applied.
///
/// Resuming clears the condition's reason and message.
pub fn suspended_status(
    current: &ScheduleVmBackupStatus,
    suspend: bool,
    message: &str,
) -> ScheduleVmBackupStatus {
    let mut status = current.clone();
    status.suspended = suspend;
    if suspend {
        set_condition(
            &mut status.conditions,
            ConditionKind::BackupSuspend,
            ConditionStatus::True,
            REASON_REACH_MAX_FAILURE,
            message,
        );
    } else {
        set_condition(
            &mut status.conditions,
            ConditionKind::BackupSuspend,
            ConditionStatus::False,
            "",
            "",
        );
    }
    status
}

/// Move a schedule into or out of suspension.
///
/// The trigger is updated first, then the status (only if it changed). On
/// resume a pending `spec.resumeRequest` is cleared. Returns the latest
/// version of the schedule.
pub async fn update_suspend_status(
    ctx: &Context,
    schedule: &ScheduleVmBackup,
    suspend: bool,
    message: &str,
) -> Result<ScheduleVmBackup, Error> {
    ctx.backend.set_trigger_suspended(schedule, suspend).await?;

    let current = schedule.status_or_default();
    let desired = suspended_status(&current, suspend, message);

    let mut updated = schedule.clone();
    if schedule.status.as_ref() != Some(&desired) {
        updated = ctx.backend.patch_schedule_status(schedule, &desired).await?;

        let (type_, reason, action, note) = if suspend {
            warn!(message, "suspending schedule");
            (
                EventType::Warning,
                reasons::BACKUP_SUSPENDED,
                actions::SUSPEND,
                Some(message.to_string()),
            )
        } else {
            info!("resuming schedule");
            (
                EventType::Normal,
                reasons::BACKUP_RESUMED,
                actions::RESUME,
                None,
            )
        };
        ctx.events
            .publish(&schedule.object_ref(&()), type_, reason, action, note)
            .await;
    }

    if !suspend && updated.spec.resume_request {
        updated = ctx.backend.clear_resume_request(&updated).await?;
    }

    Ok(updated)
}

/// Suspend a schedule whose failure count reached the threshold
pub async fn handle_reach_max_failure(
    ctx: &Context,
    schedule: &ScheduleVmBackup,
    failure: u32,
) -> Result<ScheduleVmBackup, Error> {
    let message = max_failure_message(failure, schedule.spec.max_failure);
    update_suspend_status(ctx, schedule, true, &message).await
}

/// Result of handling a resume request
#[derive(Debug)]
pub enum Resume {
    /// Suspension cleared; carries the updated schedule
    Resumed(ScheduleVmBackup),
    /// Failed backups were removed; the resume finishes on the next cycle
    Purged,
}

/// Resume a suspended schedule.
///
/// Below the failure threshold the suspension is cleared immediately.
/// Otherwise every failed backup is cleaned up and the caller re-checks; any
/// cleanup error is returned and the resume is retried.
pub async fn handle_resume(
    ctx: &Context,
    schedule: &ScheduleVmBackup,
    inventory: &BackupInventory,
) -> Result<Resume, Error> {
    if inventory.failure() < schedule.spec.max_failure {
        let updated = update_suspend_status(ctx, schedule, false, "").await?;
        return Ok(Resume::Resumed(updated));
    }

    let mut errors = AggregateError::new();
    let mut purged = 0usize;
    for backup in inventory.failed() {
        match cleanse_vm_backup(ctx.backend.as_ref(), backup).await {
            Ok(()) => purged += 1,
            Err(e) => errors.extend(e),
        }
    }

    if let Some(err) = errors.into_error() {
        warn!(error = %err, "failed to purge failed backups for resume");
        return Err(err);
    }

    info!(
        purged,
        schedule = %schedule.name_any(),
        "purged failed backups, resume continues on next cycle"
    );
    ctx.events
        .publish(
            &schedule.object_ref(&()),
            EventType::Normal,
            reasons::FAILURES_PURGED,
            actions::RESUME,
            Some(format!("removed {} failed vm backups", purged)),
        )
        .await;
    Ok(Resume::Purged)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::controller::backend::MockBackupBackend;
    use crate::controller::registry::fixtures::*;
    use crate::controller::ControllerConfig;
    use crate::events::{MockEventPublisher, NoopEventPublisher};

    fn context(mock: MockBackupBackend) -> Context {
        Context::for_testing(
            Arc::new(mock),
            Arc::new(NoopEventPublisher),
            ControllerConfig::default(),
        )
    }

    #[test]
    fn message_names_failure_and_tolerance() {
        assert_eq!(
            max_failure_message(2, 2),
            "failure backups 2 reach max tolerance 2"
        );
    }

    #[test]
    fn suspended_status_sets_condition() {
        let status = suspended_status(&ScheduleVmBackupStatus::default(), true, "too many");
        assert!(status.suspended);
        let condition = status.suspend_condition().unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.reason, REASON_REACH_MAX_FAILURE);
        assert_eq!(condition.message, "too many");

        let resumed = suspended_status(&status, false, "");
        assert!(!resumed.suspended);
        let condition = resumed.suspend_condition().unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert!(condition.reason.is_empty());
        assert!(condition.message.is_empty());
    }

    #[tokio::test]
    async fn suspend_pauses_trigger_and_writes_status() {
        let mut mock = MockBackupBackend::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_set_trigger_suspended()
            .withf(|_, suspended| *suspended)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mock.expect_patch_schedule_status()
            .withf(|_, status| status.suspended)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|schedule, status| {
                let mut updated = schedule.clone();
                updated.status = Some(status.clone());
                Ok(updated)
            });
        let ctx = context(mock);

        let updated = handle_reach_max_failure(&ctx, &schedule(3, 2), 2)
            .await
            .unwrap();
        assert!(updated.is_suspended());
        assert_eq!(
            updated.status.unwrap().suspend_condition().unwrap().message,
            "failure backups 2 reach max tolerance 2"
        );
    }

    #[tokio::test]
    async fn suspension_publishes_warning_event() {
        let mut mock = MockBackupBackend::new();
        mock.expect_set_trigger_suspended().returning(|_, _| Ok(()));
        mock.expect_patch_schedule_status()
            .returning(|schedule, status| {
                let mut updated = schedule.clone();
                updated.status = Some(status.clone());
                Ok(updated)
            });
        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .withf(|regarding, type_, reason, action, note| {
                regarding.name.as_deref() == Some("nightly")
                    && *type_ == EventType::Warning
                    && reason == reasons::BACKUP_SUSPENDED
                    && action == actions::SUSPEND
                    && note.as_deref() == Some("failure backups 2 reach max tolerance 2")
            })
            .times(1)
            .return_const(());
        let ctx = Context::for_testing(
            Arc::new(mock),
            Arc::new(events),
            ControllerConfig::default(),
        );

        handle_reach_max_failure(&ctx, &schedule(3, 2), 2)
            .await
            .unwrap();
    }

    /// Story: re-suspending an already suspended schedule writes nothing
    #[tokio::test]
    async fn story_unchanged_suspension_skips_write() {
        let message = max_failure_message(2, 2);
        let mut schedule = schedule(3, 2);
        schedule.status = Some(suspended_status(
            &ScheduleVmBackupStatus::default(),
            true,
            &message,
        ));

        let mut mock = MockBackupBackend::new();
        mock.expect_set_trigger_suspended().returning(|_, _| Ok(()));
        mock.expect_patch_schedule_status().never();
        let ctx = context(mock);

        let updated = update_suspend_status(&ctx, &schedule, true, &message)
            .await
            .unwrap();
        assert!(updated.is_suspended());
    }

    #[tokio::test]
    async fn trigger_failure_aborts_before_status_write() {
        let mut mock = MockBackupBackend::new();
        mock.expect_set_trigger_suspended()
            .returning(|_, _| Err(Error::not_found("CronJob", "lattice-system/svmb-uid-1")));
        mock.expect_patch_schedule_status().never();
        let ctx = context(mock);

        let err = handle_reach_max_failure(&ctx, &schedule(3, 2), 2)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    /// Story: an operator resumes a schedule whose failures were already
    /// cleared; it resumes in one cycle and the request flag is reset
    #[tokio::test]
    async fn story_resume_below_threshold_completes_immediately() {
        let mut schedule = suspended(schedule(3, 2), 2);
        schedule.spec.resume_request = true;

        let mut mock = MockBackupBackend::new();
        mock.expect_set_trigger_suspended()
            .withf(|_, suspended| !*suspended)
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_patch_schedule_status()
            .withf(|_, status| !status.suspended)
            .times(1)
            .returning(|schedule, status| {
                let mut updated = schedule.clone();
                updated.status = Some(status.clone());
                Ok(updated)
            });
        mock.expect_clear_resume_request()
            .times(1)
            .returning(|schedule| {
                let mut updated = schedule.clone();
                updated.spec.resume_request = false;
                Ok(updated)
            });
        mock.expect_delete_vm_backup().never();
        let ctx = context(mock);

        let inventory = BackupInventory::classify(vec![failed(1), ready(2)]);
        let result = handle_resume(&ctx, &schedule, &inventory).await.unwrap();

        let Resume::Resumed(updated) = result else {
            panic!("expected resume to complete");
        };
        assert!(!updated.is_suspended());
        assert!(!updated.spec.resume_request);
    }

    /// Story: resuming at the failure threshold purges the failed backups
    /// first and leaves the schedule suspended until the next cycle
    #[tokio::test]
    async fn story_resume_at_threshold_purges_failures() {
        let mut schedule = suspended(schedule(3, 2), 2);
        schedule.spec.resume_request = true;

        let mut mock = MockBackupBackend::new();
        mock.expect_get_volume_snapshot().returning(|_, _| Ok(None));
        mock.expect_delete_vm_backup()
            .times(2)
            .returning(|_, _| Ok(()));
        mock.expect_set_trigger_suspended().never();
        mock.expect_patch_schedule_status().never();
        let ctx = context(mock);

        let inventory = BackupInventory::classify(vec![ready(1), failed(2), failed(3)]);
        let result = handle_resume(&ctx, &schedule, &inventory).await.unwrap();
        assert!(matches!(result, Resume::Purged));
    }

    #[tokio::test]
    async fn purge_error_aborts_resume() {
        let mut schedule = suspended(schedule(3, 2), 2);
        schedule.spec.resume_request = true;

        let mut mock = MockBackupBackend::new();
        mock.expect_get_volume_snapshot().returning(|_, _| Ok(None));
        mock.expect_delete_vm_backup()
            .returning(|_, _| Err(Error::internal("delete vmbackup failed")));
        mock.expect_set_trigger_suspended().never();
        let ctx = context(mock);

        let inventory = BackupInventory::classify(vec![failed(1), failed(2)]);
        let err = handle_resume(&ctx, &schedule, &inventory).await.unwrap_err();
        assert!(matches!(err, Error::Partial(_)));
    }
}
