//! Error types for the VM backup controller
//!
//! [`Error`] is the single error type returned by reconciliation steps.
//! [`AggregateError`] collects the failures of best-effort batch operations
//! (snapshot cleanup, retention passes) so that every item is attempted before
//! the caller sees the result.

use std::fmt;

use thiserror::Error;

/// Main error type for VM backup operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The named resource does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g., "VirtualMachineBackup")
        kind: &'static str,
        /// `namespace/name` or bare name of the resource
        name: String,
    },

    /// Optimistic concurrency failure: the object changed since it was read
    #[error("conflict updating {kind} {name}: object has been modified")]
    Conflict {
        /// Resource kind
        kind: &'static str,
        /// `namespace/name` of the resource
        name: String,
    },

    /// Create raced with an existing object of the same name
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: &'static str,
        /// `namespace/name` of the resource
        name: String,
    },

    /// The latest VM backup is still running; retry later
    #[error("latest vm backup {0} in progress")]
    BackupInProgress(String),

    /// Storage snapshot could not be resolved or removed
    #[error("storage error: {0}")]
    Storage(String),

    /// Some items of a batch operation failed
    #[error("partial failure: {0}")]
    Partial(AggregateError),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-found error for the given kind and name
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Create a storage error with the given message
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Map a kube-rs error for the given object, turning 404/409 responses
    /// into [`Error::NotFound`] / [`Error::Conflict`].
    pub fn from_kube(kind: &'static str, name: impl Into<String>, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound {
                kind,
                name: name.into(),
            },
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                kind,
                name: name.into(),
            },
            e => Self::Kube(e),
        }
    }

    /// True if the object is already gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// True for errors that are expected to clear up on a later cycle
    /// (races, in-progress dependencies, stale versions).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotFound { .. }
            | Self::Conflict { .. }
            | Self::AlreadyExists { .. }
            | Self::BackupInProgress(_) => true,
            Self::Partial(agg) => agg.causes().iter().all(Error::is_transient),
            _ => false,
        }
    }
}

/// Ordered collection of errors from a best-effort batch operation.
///
/// An empty aggregate means every item succeeded. Callers must treat a
/// non-empty aggregate as "partially applied": some sub-resources may
/// already be gone.
#[derive(Debug, Default)]
pub struct AggregateError {
    causes: Vec<Error>,
}

impl AggregateError {
    /// Create an empty aggregate
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure. Nested aggregates are flattened.
    pub fn push(&mut self, err: impl Into<Error>) {
        match err.into() {
            Error::Partial(inner) => self.causes.extend(inner.causes),
            e => self.causes.push(e),
        }
    }

    /// Append every failure of another aggregate
    pub fn extend(&mut self, other: AggregateError) {
        self.causes.extend(other.causes);
    }

    /// True if no failure was recorded
    pub fn is_empty(&self) -> bool {
        self.causes.is_empty()
    }

    /// Number of recorded failures
    pub fn len(&self) -> usize {
        self.causes.len()
    }

    /// Recorded failures in the order they happened
    pub fn causes(&self) -> &[Error] {
        &self.causes
    }

    /// `Ok(())` if empty, otherwise the aggregate itself
    pub fn into_result(self) -> Result<(), AggregateError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Collapse into a single [`Error`]: `None` if empty, the cause itself if
    /// there is exactly one, [`Error::Partial`] otherwise.
    pub fn into_error(mut self) -> Option<Error> {
        match self.causes.len() {
            0 => None,
            1 => self.causes.pop(),
            _ => Some(Error::Partial(self)),
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cause) in self.causes.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

impl From<AggregateError> for Error {
    fn from(agg: AggregateError) -> Self {
        Self::Partial(agg)
    }
}
