//! Per-route glue: relay the request, submit work, await the response.
//!
//! Everything inside one inbound request shares a single deadline: parking
//! the request, handing work to a worker and waiting for the posted
//! response. When the deadline fires the whole chain is dropped, which frees
//! the parked slot and abandons the queued work. Any failure surfaces to the
//! end user as a plain `500`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::Full;

use cffaas_common::error::Result;
use cffaas_common::event::{self, Work};
use cffaas_common::http::{map_to_headers, status_response, EventRequest, EventResponse};

use crate::handler::Handler;
use crate::relayer::RequestRelayer;
use crate::worker_pool::WorkerPool;

/// Deadline shared by relay, submit and wait.
const EVENT_DEADLINE: Duration = Duration::from_secs(10);

/// Handler for one user-declared HTTP route.
pub struct HttpEvent {
    command: String,
    app_name: String,
    relayer: Arc<RequestRelayer>,
    pool: WorkerPool,
    deadline: Duration,
}

impl HttpEvent {
    pub fn new(
        command: String,
        app_name: String,
        relayer: Arc<RequestRelayer>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            command,
            app_name,
            relayer,
            pool,
            deadline: EVENT_DEADLINE,
        }
    }

    /// Overrides the per-request deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    async fn relay_and_wait(&self, req: EventRequest) -> Result<event::Response> {
        let (url, wait) = self.relayer.relay(&req)?;

        self.pool
            .submit_work(Work {
                href: url.to_string(),
                command: self.command.clone(),
                app_name: self.app_name.clone(),
            })
            .await;

        // Blocks until the worker posts the response back.
        wait.wait().await
    }
}

#[async_trait]
impl Handler for HttpEvent {
    async fn handle(&self, req: EventRequest) -> EventResponse {
        match tokio::time::timeout(self.deadline, self.relay_and_wait(req)).await {
            Ok(Ok(envelope)) => {
                let status = StatusCode::from_u16(envelope.status_code)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let mut resp = http::Response::new(Full::new(Bytes::from(envelope.body)));
                *resp.status_mut() = status;
                *resp.headers_mut() = map_to_headers(&envelope.headers);
                resp
            }
            Ok(Err(e)) => {
                tracing::error!(app_name = %self.app_name, error = %e, "running task failed");
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Err(_) => {
                tracing::error!(
                    app_name = %self.app_name,
                    "gave up waiting for a worker response"
                );
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}
