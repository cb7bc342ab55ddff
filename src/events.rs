//! Kubernetes Events for schedule transitions
//!
//! Suspend, resume, purge, creation and retention show up in
//! `kubectl describe svmb`. Publishing is best-effort: a failed event is
//! logged and never fails a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::warn;

/// Sink for schedule events
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record an event on `regarding`. Never fails.
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by the events.k8s.io recorder
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `reporter` becomes the event's reportingComponent; the pod name, if
    /// known, its reportingInstance
    pub fn new(client: Client, reporter: &str) -> Self {
        let reporter = Reporter {
            controller: reporter.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, regarding).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

/// Drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _regarding: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons
pub mod reasons {
    /// A trigger created a VM backup
    pub const BACKUP_CREATED: &str = "BackupCreated";
    /// Failures reached maxFailure
    pub const BACKUP_SUSPENDED: &str = "BackupSuspended";
    /// An operator resumed the schedule
    pub const BACKUP_RESUMED: &str = "BackupResumed";
    /// Failed backups removed on the way to a resume
    pub const FAILURES_PURGED: &str = "FailuresPurged";
    /// Backups beyond `retain` removed
    pub const RETENTION_APPLIED: &str = "RetentionApplied";
}

/// Event actions
#[allow(missing_docs)]
pub mod actions {
    pub const CREATE: &str = "Create";
    pub const SUSPEND: &str = "Suspend";
    pub const RESUME: &str = "Resume";
    pub const GARBAGE_COLLECT: &str = "GarbageCollect";
}
