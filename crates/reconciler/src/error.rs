use keel_action::ActionError;
use keel_core::values::ValuesError;
use keel_store::{DependentError, LocksClosed};

use crate::client::ObjectError;

/// How the runner should treat a failed reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// API timeouts, unavailability, cancellation. Retried with backoff.
    Transient,
    /// Optimistic update conflict. Requeued immediately.
    Conflict,
    /// Malformed values or a rejected chart. Retried with backoff; needs a user fix.
    Terminal,
    /// Uninstall failed; the finalizer stays until a retry succeeds.
    UninstallPending,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Terminal => "terminal",
            ErrorClass::UninstallPending => "uninstall_pending",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("reading {key}: {source}")]
    Fetch { key: String, source: ObjectError },
    #[error("writing {key}: {source}")]
    Write { key: String, source: ObjectError },
    #[error("resolving values: {0}")]
    Values(#[from] ValuesError),
    #[error("building action client: {0}")]
    Client(#[source] ActionError),
    #[error(transparent)]
    Action(ActionError),
    #[error("uninstalling release {release}: {source}")]
    Uninstall { release: String, source: ActionError },
    #[error("syncing dependent watches: {0}")]
    Dependents(#[from] DependentError),
    #[error(transparent)]
    Locks(#[from] LocksClosed),
    #[error("reconcile cancelled")]
    Cancelled,
}

impl ReconcileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Fetch { source, .. } | ReconcileError::Write { source, .. } if source.is_conflict() => {
                ErrorClass::Conflict
            }
            ReconcileError::Fetch { .. } | ReconcileError::Write { .. } => ErrorClass::Transient,
            ReconcileError::Values(_) => ErrorClass::Terminal,
            ReconcileError::Client(_) => ErrorClass::Transient,
            ReconcileError::Action(ActionError::Chart { .. }) => ErrorClass::Terminal,
            ReconcileError::Action(_) => ErrorClass::Transient,
            ReconcileError::Uninstall { .. } => ErrorClass::UninstallPending,
            ReconcileError::Dependents(DependentError::Manifest(_)) => ErrorClass::Terminal,
            ReconcileError::Dependents(_) => ErrorClass::Transient,
            ReconcileError::Locks(_) | ReconcileError::Cancelled => ErrorClass::Transient,
        }
    }

    pub fn is_conflict(&self) -> bool { self.class() == ErrorClass::Conflict }

    pub fn is_cancelled(&self) -> bool { matches!(self, ReconcileError::Cancelled) }
}
