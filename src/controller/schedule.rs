//! ScheduleVmBackup reconciliation
//!
//! One cycle runs the steps in a fixed order against a fresh read of the
//! schedule's backups:
//!
//! 1. Resume handling, if `spec.resumeRequest` is set
//! 2. Retention GC
//! 3. Creation decision, only for cron triggers and only if not suspended
//! 4. Status update from a re-read of the backups
//!
//! Every step is idempotent, so a cycle can be re-run from scratch after any
//! failure. The watch path ([`reconcile`]) and the cron path ([`on_trigger`])
//! share the same cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::backend::{BackupBackend, KubeBackend};
use super::creation::{new_vm_backup, Creation};
use super::registry::current_vm_backups;
use super::retention::gc_vm_backups;
use super::status::reconcile_vm_backup_list;
use super::registry::ScheduleRef;
use super::suspend::{handle_resume, Resume};
use crate::crd::ScheduleVmBackup;
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{
    AggregateError, Error, CONTROLLER_NAME, DEFAULT_RECHECK_INTERVAL_SECS,
    DEFAULT_RESYNC_INTERVAL_SECS, DEFAULT_TRIGGER_DEADLINE_SECS, DEFAULT_TRIGGER_NAMESPACE,
};

/// Runtime settings for the controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Namespace holding the trigger CronJobs
    pub trigger_namespace: String,
    /// Delay before re-checking a schedule waiting on a running backup,
    /// also used as the error requeue delay
    pub recheck_interval: Duration,
    /// Periodic resync for schedules with nothing pending
    pub resync_interval: Duration,
    /// How long one cron trigger keeps retrying transient failures
    pub trigger_deadline: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            trigger_namespace: DEFAULT_TRIGGER_NAMESPACE.to_string(),
            recheck_interval: Duration::from_secs(DEFAULT_RECHECK_INTERVAL_SECS),
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS),
            trigger_deadline: Duration::from_secs(DEFAULT_TRIGGER_DEADLINE_SECS),
        }
    }
}

/// Controller context shared by all reconciliations
pub struct Context {
    /// Registry, snapshot and trigger operations (trait object for testability)
    pub backend: Arc<dyn BackupBackend>,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Runtime settings
    pub config: ControllerConfig,
}

impl Context {
    /// Create a context backed by the given Kubernetes client
    pub fn new(client: Client, config: ControllerConfig) -> Self {
        Self {
            backend: Arc::new(KubeBackend::new(
                client.clone(),
                config.trigger_namespace.clone(),
            )),
            events: Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            config,
        }
    }

    /// Create a context from explicit parts
    pub fn with_backend(
        backend: Arc<dyn BackupBackend>,
        events: Arc<dyn EventPublisher>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            backend,
            events,
            config,
        }
    }

    /// Create a context for testing with a mock backend
    #[cfg(test)]
    pub fn for_testing(
        backend: Arc<dyn BackupBackend>,
        events: Arc<dyn EventPublisher>,
        config: ControllerConfig,
    ) -> Self {
        Self::with_backend(backend, events, config)
    }
}

/// Successful result of a reconcile cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing pending
    Done,
    /// Run again after the given delay
    Requeue(Duration),
}

impl Outcome {
    /// Combine two outcomes, keeping the earliest requeue
    pub fn merge(self, other: Outcome) -> Outcome {
        match (self, other) {
            (Outcome::Done, o) | (o, Outcome::Done) => o,
            (Outcome::Requeue(a), Outcome::Requeue(b)) => Outcome::Requeue(a.min(b)),
        }
    }
}

/// Run one reconcile cycle for a schedule.
///
/// `trigger` is the cron fire time; `None` for watch-driven cycles, which
/// never create backups. Listing the backups is the only fatal step; the
/// errors of the other steps are collected and returned together after the
/// status update has run.
pub async fn run_cycle(
    ctx: &Context,
    schedule: &ScheduleVmBackup,
    trigger: Option<DateTime<Utc>>,
) -> Result<Outcome, Error> {
    let backend = ctx.backend.as_ref();
    let mut schedule = schedule.clone();
    let mut outcome = Outcome::Done;
    let mut errors = AggregateError::new();

    if schedule.spec.resume_request {
        let inventory = current_vm_backups(backend, &schedule).await?;
        match handle_resume(ctx, &schedule, &inventory).await {
            Ok(Resume::Resumed(updated)) => schedule = updated,
            Ok(Resume::Purged) => {
                outcome = outcome.merge(Outcome::Requeue(ctx.config.recheck_interval))
            }
            Err(e) => errors.push(e),
        }
    }

    let inventory = current_vm_backups(backend, &schedule).await?;

    match gc_vm_backups(ctx, &schedule, &inventory).await {
        Ok(gc) => outcome = outcome.merge(gc),
        Err(e) => errors.extend(e),
    }

    if let Some(at) = trigger {
        if schedule.is_suspended() {
            info!("schedule suspended, skipping backup");
        } else {
            match new_vm_backup(ctx, &schedule, &inventory, at).await {
                Ok(Creation::Created(_)) => {}
                Ok(Creation::Suspended(updated)) => schedule = updated,
                Err(e) => errors.push(e),
            }
        }
    }

    match current_vm_backups(backend, &schedule).await {
        Ok(inventory) => match reconcile_vm_backup_list(ctx, &schedule, &inventory).await {
            Ok(_) => {}
            Err(e) => errors.push(e),
        },
        Err(e) => errors.push(e),
    }

    match errors.into_error() {
        Some(err) => Err(err),
        None => Ok(outcome),
    }
}

/// Reconcile a ScheduleVmBackup (watch path)
///
/// Runs a cycle without creating backups. Schedules with nothing pending are
/// resynced periodically; a deferred GC is re-checked after the recheck
/// interval. A spec that fails validation is left alone until it changes.
#[instrument(
    skip(schedule, ctx),
    fields(schedule = %schedule.name_any(), namespace = %schedule.namespace().unwrap_or_default())
)]
pub async fn reconcile(schedule: Arc<ScheduleVmBackup>, ctx: Arc<Context>) -> Result<Action, Error> {
    if schedule.metadata.deletion_timestamp.is_some() {
        debug!("schedule is being deleted");
        return Ok(Action::await_change());
    }

    if let Err(e) = schedule.spec.validate() {
        warn!(error = %e, "invalid schedule spec, waiting for a change");
        return Ok(Action::await_change());
    }

    debug!("reconciling schedule");
    match run_cycle(&ctx, &schedule, None).await? {
        Outcome::Done => Ok(Action::requeue(ctx.config.resync_interval)),
        Outcome::Requeue(delay) => Ok(Action::requeue(delay)),
    }
}

/// Handle a cron trigger for the named schedule at time `at` (cron path)
///
/// A schedule deleted before its trigger was cleaned up is a no-op.
#[instrument(skip_all, fields(schedule = %name, namespace = %namespace))]
pub async fn on_trigger(
    ctx: &Context,
    namespace: &str,
    name: &str,
    at: DateTime<Utc>,
) -> Result<Outcome, Error> {
    let schedule_ref = ScheduleRef {
        namespace: namespace.to_string(),
        name: name.to_string(),
    };
    let Some(schedule) = schedule_ref.resolve(ctx.backend.as_ref()).await? else {
        info!("schedule no longer exists, ignoring trigger");
        return Ok(Outcome::Done);
    };

    info!(%at, "schedule triggered");
    run_cycle(ctx, &schedule, Some(at)).await
}

/// Run [`on_trigger`] until it applies, retrying transient errors with
/// backoff for up to `trigger_deadline`.
///
/// `at` is held fixed so every attempt targets the same backup name.
pub async fn trigger_until_applied(
    ctx: &Context,
    namespace: &str,
    name: &str,
    at: DateTime<Utc>,
) -> Result<Outcome, Error> {
    let retry = RetryConfig::with_deadline(ctx.config.trigger_deadline)
        .initial_delay(ctx.config.recheck_interval);
    retry_with_backoff(&retry, "cron trigger", Error::is_transient, || {
        on_trigger(ctx, namespace, name, at)
    })
    .await
}

/// Error policy for the controller
///
/// Transient errors (races, running backups, stale writes) are expected and
/// logged quietly; everything is retried after the recheck interval.
pub fn error_policy(schedule: Arc<ScheduleVmBackup>, error: &Error, ctx: Arc<Context>) -> Action {
    if error.is_transient() {
        warn!(
            error = %error,
            schedule = %schedule.name_any(),
            "reconciliation incomplete, retrying"
        );
    } else {
        error!(
            ?error,
            schedule = %schedule.name_any(),
            "reconciliation failed"
        );
    }
    Action::requeue(ctx.config.recheck_interval)
}
