//! Seams to the hosting platform's administrative API.
//!
//! The dispatcher and worker never talk to the platform directly; they go
//! through these traits so the admin client stays swappable (and trivially
//! fake-able in tests). `cffaas-capi` provides the real implementation.

use async_trait::async_trait;

use crate::error::Result;

/// A resolved package: the artifact identity and where to download it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub guid: String,
    pub download_url: String,
}

/// Launches a short-lived sibling task from the deployed droplet.
#[async_trait]
pub trait TaskCreator: Send + Sync {
    async fn create_task(&self, command: &str) -> Result<()>;
}

/// Resolves app names to their current deployable package.
#[async_trait]
pub trait PackageClient: Send + Sync {
    async fn get_app_guid(&self, app_name: &str) -> Result<String>;

    async fn get_package(&self, app_guid: &str) -> Result<PackageInfo>;
}

/// Reports how many instances of an app are currently running.
///
/// The response-cache peer manager uses this to keep the peer set in step
/// with the platform's scaling decisions.
#[async_trait]
pub trait InstanceLister: Send + Sync {
    async fn instance_count(&self, app_guid: &str) -> Result<usize>;
}
