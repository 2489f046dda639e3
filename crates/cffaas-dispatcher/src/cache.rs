//! Time-bucketed memoization of idempotent responses.
//!
//! Only `GET` traffic is cacheable; everything else passes straight through.
//! The cache key is a base64-url fingerprint of method, full URL, the
//! allow-listed headers (sorted `name:value` strings) and the current time
//! bucket - `floor(now / duration)` - so entries expire implicitly when the
//! bucket rolls over. Storage is the distributed group cache; any cache
//! failure degrades to invoking the wrapped handler directly.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};

use cffaas_common::error::{FaasError, Result};
use cffaas_common::event;
use cffaas_common::http::{headers_to_map, map_to_headers, EventRequest, EventResponse};

use crate::groupcache::{Getter, Group, GroupCachePool};
use crate::handler::{Handler, SharedHandler};

#[derive(Debug, Serialize, Deserialize)]
struct Fingerprint {
    method: String,
    path: String,
    #[serde(default)]
    headers: Vec<String>,
    time_key: i64,
}

/// Caching wrapper around one route handler.
pub struct ResponseCache {
    inner: SharedHandler,
    group: Arc<Group>,
    duration: Duration,
    allowed_headers: HashSet<String>,
}

impl ResponseCache {
    /// Wraps `inner` with a cache group registered on `pool`.
    ///
    /// # Arguments
    /// * `name` - Group name, unique per route
    /// * `headers` - Header allow-list included in the fingerprint
    /// * `inner` - The handler producing cacheable responses
    /// * `duration` - Bucket length; effectively the TTL
    /// * `pool` - The distributed cache this group stores into
    pub fn new(
        name: &str,
        headers: &[String],
        inner: SharedHandler,
        duration: Duration,
        pool: &Arc<GroupCachePool>,
    ) -> Self {
        let allowed_headers = headers.iter().map(|h| h.to_lowercase()).collect();
        let group = pool.add_group(
            name,
            Arc::new(CacheFiller {
                inner: inner.clone(),
            }),
        );

        Self {
            inner,
            group,
            duration,
            allowed_headers,
        }
    }

    fn fingerprint(&self, req: &EventRequest) -> Result<String> {
        let mut headers: Vec<String> = req
            .headers()
            .iter()
            .filter(|(name, _)| self.allowed_headers.contains(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| format!("{}:{}", name.as_str(), v))
            })
            .collect();
        headers.sort();

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| FaasError::Cache(e.to_string()))?
            .as_nanos() as i64;
        let bucket = self.duration.as_nanos() as i64;
        let time_key = now - now % bucket;

        let fingerprint = Fingerprint {
            method: req.method().to_string(),
            path: req.uri().to_string(),
            headers,
            time_key,
        };

        Ok(URL_SAFE.encode(serde_json::to_vec(&fingerprint)?))
    }
}

#[async_trait]
impl Handler for ResponseCache {
    async fn handle(&self, req: EventRequest) -> EventResponse {
        if req.method() != http::Method::GET {
            return self.inner.handle(req).await;
        }

        let key = match self.fingerprint(&req) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(error = %e, "failed to fingerprint request");
                return self.inner.handle(req).await;
            }
        };

        let cached = self.group.get(&key).await;
        match cached.and_then(|bytes| Ok(serde_json::from_slice::<event::Response>(&bytes)?)) {
            Ok(envelope) => {
                let status = StatusCode::from_u16(envelope.status_code)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let mut resp = http::Response::new(Full::new(Bytes::from(envelope.body)));
                *resp.status_mut() = status;
                *resp.headers_mut() = map_to_headers(&envelope.headers);
                resp
            }
            Err(e) => {
                tracing::debug!(error = %e, "cache miss path failed; serving directly");
                self.inner.handle(req).await
            }
        }
    }
}

/// Group getter that replays the fingerprinted request against the wrapped
/// handler and records the response envelope.
struct CacheFiller {
    inner: SharedHandler,
}

#[async_trait]
impl Getter for CacheFiller {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let decoded = URL_SAFE
            .decode(key.as_bytes())
            .map_err(|e| FaasError::Cache(format!("undecodable cache key: {}", e)))?;
        let fingerprint: Fingerprint = serde_json::from_slice(&decoded)?;

        let method: http::Method = fingerprint
            .method
            .parse()
            .map_err(|_| FaasError::Cache(format!("bad method {}", fingerprint.method)))?;

        let mut builder = http::Request::builder().method(method).uri(&fingerprint.path);
        for header in &fingerprint.headers {
            if let Some((name, value)) = header.split_once(':') {
                builder = builder.header(name, value);
            }
        }
        let req = builder.body(Bytes::new())?;

        let resp = self.inner.handle(req).await;
        let (parts, body) = resp.into_parts();
        let body = body
            .collect()
            .await
            .map(|c| c.to_bytes())
            .unwrap_or_default();

        let envelope = event::Response {
            status_code: parts.status.as_u16(),
            headers: headers_to_map(&parts.headers),
            body: body.to_vec(),
        };

        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }
}
