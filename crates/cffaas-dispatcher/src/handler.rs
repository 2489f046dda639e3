//! The handler seam every dispatcher component plugs into.
//!
//! Bodies are collected before a request enters the tree, so handlers take
//! `http::Request<Bytes>` and return a fully-buffered response. Path
//! variables captured by the mux ride along in the request extensions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use cffaas_common::http::{EventRequest, EventResponse};

/// An HTTP handler in the dispatcher's routing tree.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: EventRequest) -> EventResponse;
}

/// Shared, immutable handler reference.
pub type SharedHandler = Arc<dyn Handler>;

/// Path variables captured by the mux for the matched route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathVars(pub HashMap<String, String>);

/// Returns the path variables captured for this request, if any.
pub fn path_vars(req: &EventRequest) -> HashMap<String, String> {
    req.extensions()
        .get::<PathVars>()
        .map(|vars| vars.0.clone())
        .unwrap_or_default()
}
