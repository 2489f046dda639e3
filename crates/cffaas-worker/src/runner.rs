//! Executes one work item.
//!
//! The runner resolves the working directory through the package manager,
//! merges the pool-wide base environment with `CF_FAAS_RELAY_ADDR` and hands
//! the command to the executor. A failed execution posts
//! `{"status_code":500}` back to the rendezvous URL so the end user sees a
//! defined error instead of a hang; a missing package is only logged, the
//! dispatcher's own deadline covers the caller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use cffaas_common::error::Result;
use cffaas_common::event::Work;

use crate::executor::Executor;
use crate::package_manager::PackageManager;

/// Deadline for the failure report POST.
const FAILURE_POST_TIMEOUT: Duration = Duration::from_secs(1);

/// Supplies the working directory for an app's current package.
#[async_trait]
pub trait PackageSource: Send + Sync {
    async fn package_for_app(&self, app_name: &str) -> Result<PathBuf>;
}

#[async_trait]
impl PackageSource for PackageManager {
    async fn package_for_app(&self, app_name: &str) -> Result<PathBuf> {
        PackageManager::package_for_app(self, app_name).await
    }
}

/// Runs submitted work items.
pub struct Runner {
    packages: Arc<dyn PackageSource>,
    executor: Arc<dyn Executor>,
    base_env: HashMap<String, String>,
    http: reqwest::Client,
}

impl Runner {
    /// # Arguments
    /// * `packages` - Source of per-app working directories
    /// * `executor` - Command execution seam
    /// * `base_env` - Environment merged into every invocation
    /// * `http` - Client used to report execution failures
    pub fn new(
        packages: Arc<dyn PackageSource>,
        executor: Arc<dyn Executor>,
        base_env: HashMap<String, String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            packages,
            executor,
            base_env,
            http,
        }
    }

    /// Executes `work` to completion.
    pub async fn submit(&self, work: Work) {
        let cwd = match self.packages.package_for_app(&work.app_name).await {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(
                    app_name = %work.app_name,
                    error = %e,
                    "failed to fetch package for app"
                );
                return;
            }
        };

        let mut envs = self.base_env.clone();
        envs.insert("CF_FAAS_RELAY_ADDR".to_string(), work.href.clone());

        if let Err(e) = self.executor.execute(&cwd, &envs, &work.command).await {
            tracing::warn!(href = %work.href, error = %e, "execution failed; reporting 500");
            self.post_failure(&work.href).await;
        }
    }

    async fn post_failure(&self, href: &str) {
        let result = self
            .http
            .post(href)
            .header("Content-Type", "application/json")
            .header("X-Forwarded-Proto", "https")
            .body(r#"{"status_code":500}"#)
            .timeout(FAILURE_POST_TIMEOUT)
            .send()
            .await;

        if let Err(e) = result {
            tracing::warn!(href, error = %e, "failed to report execution failure");
        }
    }
}
