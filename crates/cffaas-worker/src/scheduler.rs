//! The worker's long-poll loop.
//!
//! A freshly launched worker polls the dispatcher's pool endpoint for work,
//! pinned to the instance that launched it with the `X-CF-APP-INSTANCE`
//! routing header and carrying a cache-busting header so no intermediary
//! replays a stale work item. A `200` yields a work item that is executed
//! asynchronously while the loop polls again; anything else ends the loop -
//! and with it the worker process. Idle workers drain away by design; the
//! platform launches new ones when demand returns.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cffaas_common::event::Work;

use crate::runner::Runner;

/// Drives the poll/execute loop of one worker process.
pub struct Scheduler {
    pool_addr: String,
    app_instance: String,
    wait_for: Duration,
    runner: Arc<Runner>,
    http: reqwest::Client,
}

impl Scheduler {
    /// # Arguments
    /// * `pool_addr` - The dispatcher's pool endpoint URL
    /// * `app_instance` - `<app-guid>:<index>` identity of the launching
    ///   instance
    /// * `wait_for` - Per-poll deadline; must exceed the pool's own blocking
    ///   window
    /// * `runner` - Executes received work items
    /// * `http` - Polling client
    pub fn new(
        pool_addr: String,
        app_instance: String,
        wait_for: Duration,
        runner: Arc<Runner>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            pool_addr,
            app_instance,
            wait_for,
            runner,
            http,
        }
    }

    /// Polls until the pool has nothing for us or a transport error occurs.
    pub async fn run(&self) {
        loop {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            let buster = format!("{}{}", nanos, rand::random::<u64>());

            let resp = self
                .http
                .get(&self.pool_addr)
                .header("X-CF-APP-INSTANCE", &self.app_instance)
                .header("Cache-Buster", buster)
                .timeout(self.wait_for)
                .send()
                .await;

            let resp = match resp {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to poll for work; shutting down");
                    return;
                }
            };

            if resp.status() != reqwest::StatusCode::OK {
                tracing::info!(status = %resp.status(), "no work available; shutting down");
                return;
            }

            match resp.json::<Work>().await {
                Ok(work) => {
                    tracing::debug!(href = %work.href, "received work");
                    let runner = self.runner.clone();
                    tokio::spawn(async move {
                        runner.submit(work).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode work item; shutting down");
                    return;
                }
            }
        }
    }
}
