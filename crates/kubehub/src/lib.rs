//! Keel kubehub: discovery, the kube-backed object client and watcher wiring.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::Client;
use tracing::info;

pub mod convert;
pub mod discovery;
pub mod objects;
pub mod watch;

pub use discovery::ApiResolver;
pub use objects::KubeObjectClient;
pub use watch::{watch_primary, ChildFilter, KubeWatchRegistrar, Lifecycle, PrimaryTracker};

/// Client from the ambient kubeconfig or in-cluster service account.
pub async fn client() -> Result<Client> {
    let client = Client::try_default().await.context("building kube client")?;
    info!(namespace = %client.default_namespace(), "kube client ready");
    Ok(client)
}
