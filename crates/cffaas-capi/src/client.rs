//! Cloud Controller client.
//!
//! One client serves both sides of the system: the dispatcher uses it to
//! launch worker tasks and to size the response-cache peer set, the worker
//! uses it to resolve app names to downloadable packages. Every call carries
//! its own short deadline; callers treat failures as transient and retry on
//! their next tick.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use cffaas_common::error::{FaasError, Result};
use cffaas_common::platform::{InstanceLister, PackageClient, PackageInfo, TaskCreator};

/// Default per-request deadline for admin API calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Client for the platform's administrative API.
pub struct CapiClient {
    addr: String,
    app_guid: String,
    space_guid: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct V2AppsPage {
    resources: Vec<V2App>,
}

#[derive(Deserialize)]
struct V2App {
    metadata: V2Metadata,
}

#[derive(Deserialize)]
struct V2Metadata {
    guid: String,
}

#[derive(Deserialize)]
struct V3PackagesPage {
    resources: Vec<V3Package>,
}

#[derive(Deserialize)]
struct V3Package {
    guid: String,
    links: V3PackageLinks,
}

#[derive(Deserialize)]
struct V3PackageLinks {
    download: V3Link,
}

#[derive(Deserialize)]
struct V3Link {
    href: String,
}

#[derive(Deserialize)]
struct V3StatsPage {
    resources: Vec<serde_json::Value>,
}

impl CapiClient {
    /// Creates a new client.
    ///
    /// # Arguments
    /// * `addr` - Base address of the admin API (already rewritten to http
    ///   so `HTTP_PROXY` applies)
    /// * `app_guid` - This deployment's application guid (tasks are launched
    ///   against it)
    /// * `space_guid` - The space used to scope app-name lookups
    /// * `http` - Shared reqwest client
    pub fn new(addr: String, app_guid: String, space_guid: String, http: reqwest::Client) -> Self {
        Self {
            addr,
            app_guid,
            space_guid,
            http,
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: String) -> Result<T> {
        let resp = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FaasError::UnexpectedStatus {
                context: url,
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.json().await?)
    }
}

#[async_trait]
impl PackageClient for CapiClient {
    async fn get_app_guid(&self, app_name: &str) -> Result<String> {
        let url = format!(
            "{}/v2/apps?q=name%3A{}&q=space_guid%3A{}",
            self.addr, app_name, self.space_guid
        );

        let page: V2AppsPage = self.get_json(url).await?;
        let app = page
            .resources
            .into_iter()
            .next()
            .ok_or_else(|| FaasError::UnknownApp(app_name.to_string()))?;

        Ok(app.metadata.guid)
    }

    async fn get_package(&self, app_guid: &str) -> Result<PackageInfo> {
        let url = format!(
            "{}/v3/apps/{}/packages?order_by=-created_at&states=READY",
            self.addr, app_guid
        );

        let page: V3PackagesPage = self.get_json(url).await?;
        let package = page.resources.into_iter().next().ok_or_else(|| {
            FaasError::Package(format!("no ready package for app {}", app_guid))
        })?;

        Ok(PackageInfo {
            guid: package.guid,
            download_url: package.links.download.href,
        })
    }
}

#[async_trait]
impl TaskCreator for CapiClient {
    async fn create_task(&self, command: &str) -> Result<()> {
        let url = format!("{}/v3/apps/{}/tasks", self.addr, self.app_guid);

        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "command": command }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FaasError::UnexpectedStatus {
                context: url,
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(app_guid = %self.app_guid, "created task");
        Ok(())
    }
}

#[async_trait]
impl InstanceLister for CapiClient {
    async fn instance_count(&self, app_guid: &str) -> Result<usize> {
        let url = format!("{}/v3/apps/{}/processes/web/stats", self.addr, app_guid);
        let page: V3StatsPage = self.get_json(url).await?;
        Ok(page.resources.len())
    }
}
