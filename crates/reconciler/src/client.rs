//! Access to managed objects in the cluster.

use keel_core::{ManagedObject, ObjectKey};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ObjectError {
    #[error("{0} not found")]
    NotFound(String),
    /// Optimistic concurrency failure: the object changed since it was read.
    #[error("conflict writing {0}")]
    Conflict(String),
    #[error("object api: {0}")]
    Api(String),
}

impl ObjectError {
    pub fn is_not_found(&self) -> bool { matches!(self, ObjectError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, ObjectError::Conflict(_)) }
}

/// Reads and writes the primary custom resource.
///
/// `update` writes metadata (finalizers, labels, annotations); `update_status`
/// writes only the status subresource. Both return the stored object with its
/// new resource version.
#[async_trait::async_trait]
pub trait ObjectClient: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<ManagedObject, ObjectError>;
    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject, ObjectError>;
    async fn update_status(&self, obj: &ManagedObject) -> Result<ManagedObject, ObjectError>;
}
