//! Keel action client: the five release operations the reconciler consumes.
//!
//! Implementations must be safe to retry: repeating a call after a timeout or
//! crash must not leave duplicate or inconsistent release state.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use keel_core::annotations::ActionOptions;
use keel_core::{Chart, ManagedObject, Release, Values};
use serde::{Deserialize, Serialize};

pub mod fake;
pub mod helm;

pub use helm::{HelmCli, HelmCliGetter, ManifestApplier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Get,
    Install,
    Upgrade,
    Uninstall,
    Reconcile,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Install => "install",
            Operation::Upgrade => "upgrade",
            Operation::Uninstall => "uninstall",
            Operation::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("release {0:?} not found")]
    NotFound(String),
    /// Chart or values rejected by the packaging subsystem (rendering, validation).
    #[error("{op} {release}: chart rejected: {message}")]
    Chart { op: Operation, release: String, message: String },
    #[error("{op} {release}: {message}")]
    Failed { op: Operation, release: String, message: String },
    #[error("action client unavailable: {0}")]
    Unavailable(String),
}

impl ActionError {
    pub fn failed(op: Operation, release: &str, message: impl Into<String>) -> Self {
        Self::Failed { op, release: release.to_string(), message: message.into() }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, ActionError::NotFound(_)) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UninstallResult {
    pub release: Option<Release>,
    pub info: String,
}

/// Release operations against a single release namespace.
#[async_trait::async_trait]
pub trait ActionClient: Send + Sync {
    /// Fails with [`ActionError::NotFound`] when no release exists under `name`.
    async fn get(&self, name: &str) -> Result<Release, ActionError>;

    async fn install(
        &self,
        name: &str,
        namespace: &str,
        chart: &Chart,
        values: &Values,
        opts: ActionOptions,
    ) -> Result<Release, ActionError>;

    async fn upgrade(
        &self,
        name: &str,
        namespace: &str,
        chart: &Chart,
        values: &Values,
        opts: ActionOptions,
    ) -> Result<Release, ActionError>;

    /// Fails with [`ActionError::NotFound`] if the release is already gone.
    async fn uninstall(&self, name: &str, opts: ActionOptions) -> Result<UninstallResult, ActionError>;

    /// Re-apply the release's manifest against live state without a new revision.
    async fn reconcile(&self, release: &Release) -> Result<(), ActionError>;
}

/// Hands out an action client scoped to one managed object.
pub trait ActionClientGetter: Send + Sync {
    fn client_for(&self, obj: &ManagedObject) -> Result<Arc<dyn ActionClient>, ActionError>;
}
