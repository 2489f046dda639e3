//! Builds the full handler tree from a resolved manifest.
//!
//! The relayer and worker pool are passed in rather than created here: they
//! are process-lifetime singletons whose internal paths must stay stable
//! across hot swaps, and keeping them as parameters keeps the handler graph
//! a DAG with the hot-swap cell owning the root.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use http::Method;

use cffaas_common::error::{FaasError, Result};

use crate::cache::ResponseCache;
use crate::groupcache::{GroupCachePool, BASE_PATH};
use crate::handler::SharedHandler;
use crate::http_event::HttpEvent;
use crate::manifest::HttpFunction;
use crate::mux::RouteTable;
use crate::relayer::RequestRelayer;
use crate::worker_pool::WorkerPool;

/// Builds routing trees wired to one relayer/pool/groupcache trio.
pub struct RouterBuilder {
    default_app_name: String,
    groupcache: Arc<GroupCachePool>,
    relayer: Arc<RequestRelayer>,
    pool: WorkerPool,
    pool_path: String,
    event_deadline: Option<std::time::Duration>,
}

impl RouterBuilder {
    /// # Arguments
    /// * `default_app_name` - Used for functions that do not name an app
    /// * `groupcache` - The distributed cache pool backing cached routes
    /// * `relayer` - The process's rendezvous table
    /// * `pool` - The process's worker pool
    /// * `pool_path` - The unguessable path workers poll for work
    pub fn new(
        default_app_name: String,
        groupcache: Arc<GroupCachePool>,
        relayer: Arc<RequestRelayer>,
        pool: WorkerPool,
        pool_path: String,
    ) -> Self {
        Self {
            default_app_name,
            groupcache,
            relayer,
            pool,
            pool_path,
            event_deadline: None,
        }
    }

    /// Overrides the per-request deadline on every built route.
    pub fn with_event_deadline(mut self, deadline: std::time::Duration) -> Self {
        self.event_deadline = Some(deadline);
        self
    }

    /// Builds an immutable tree serving `functions` plus the internal
    /// relayer, pool and group-cache endpoints.
    pub fn build(&self, functions: &[HttpFunction]) -> Result<SharedHandler> {
        let mut table = RouteTable::builder()
            .route_methods(
                vec![Method::GET, Method::POST],
                &self.relayer.route_pattern(),
                self.relayer.clone(),
            )
            .route(
                Method::GET,
                &format!("{}/{{name}}/{{key}}", BASE_PATH),
                self.groupcache.clone(),
            )
            .route(Method::GET, &self.pool_path, Arc::new(self.pool.clone()));

        for f in functions {
            let app_name = if f.handler.app_name.is_empty() {
                self.default_app_name.clone()
            } else {
                f.handler.app_name.clone()
            };

            let mut event = HttpEvent::new(
                f.handler.command.clone(),
                app_name,
                self.relayer.clone(),
                self.pool.clone(),
            );
            if let Some(deadline) = self.event_deadline {
                event = event.with_deadline(deadline);
            }
            let event: SharedHandler = Arc::new(event);

            for e in &f.events {
                let method: Method = e
                    .method
                    .to_uppercase()
                    .parse()
                    .map_err(|_| FaasError::Manifest(format!("bad method {:?}", e.method)))?;

                match e.cache.duration()? {
                    Some(duration) if !duration.is_zero() => {
                        let cached = ResponseCache::new(
                            &URL_SAFE.encode(e.path.as_bytes()),
                            &e.cache.header,
                            event.clone(),
                            duration,
                            &self.groupcache,
                        );
                        table = table.route(method, &e.path, Arc::new(cached));
                    }
                    _ => {
                        table = table.route(method, &e.path, event.clone());
                    }
                }
            }
        }

        Ok(Arc::new(table.build()))
    }
}
