//! HTTP helpers shared by the dispatcher and worker.
//!
//! Request bodies are collected up front, bounded by [`MAX_BODY_SIZE`], and
//! handlers operate on [`EventRequest`] (`http::Request<Bytes>`) and produce
//! [`EventResponse`] (`http::Response<Full<Bytes>>`). Header conversion goes
//! through `http::HeaderMap`, which canonicalises names to lowercase, so
//! lookups are case-insensitive everywhere.

use std::collections::HashMap;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use serde::Serialize;

use crate::error::{FaasError, Result};

/// Maximum request body size (10 MB)
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Type alias for hyper incoming requests
pub type HyperRequest = http::Request<Incoming>;

/// Type alias for a request whose body has already been collected
pub type EventRequest = http::Request<Bytes>;

/// Type alias for responses with a full body
pub type EventResponse = Response<Full<Bytes>>;

/// Collects an incoming body into memory, rejecting oversized payloads.
pub async fn collect_body(body: Incoming) -> Result<Bytes> {
    let collected = body
        .collect()
        .await
        .map_err(|e| FaasError::RelayFailed(format!("failed to read request body: {}", e)))?;
    let bytes = collected.to_bytes();
    if bytes.len() > MAX_BODY_SIZE {
        return Err(FaasError::BodyTooLarge(bytes.len(), MAX_BODY_SIZE));
    }
    Ok(bytes)
}

/// Builds an `application/json` response from a serializable value.
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> EventResponse {
    let body = serde_json::to_vec(value).unwrap_or_default();

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Builds an empty response with the given status code.
pub fn status_response(status: StatusCode) -> EventResponse {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Builds a `{"error": ...}` response with the given status code.
pub fn error_response(status: StatusCode, message: &str) -> EventResponse {
    let body = serde_json::json!({ "error": message });
    json_response(status, &body)
}

/// Converts a `HeaderMap` into the map-of-lists shape the envelopes use.
pub fn headers_to_map(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    out
}

/// Converts an envelope header map back into a `HeaderMap`.
///
/// Names or values that are not valid HTTP are skipped rather than failing
/// the whole response.
pub fn map_to_headers(map: &HashMap<String, Vec<String>>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in map {
        let Ok(name) = name.parse::<HeaderName>() else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_response_sets_content_type() {
        let resp = json_response(StatusCode::OK, &serde_json::json!({"href": "x"}));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn test_status_response_has_empty_body() {
        let resp = status_response(StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_headers_round_trip_lowercases_names() {
        let mut headers = HeaderMap::new();
        headers.append("X-Tenant", HeaderValue::from_static("acme"));
        headers.append("X-Tenant", HeaderValue::from_static("beta"));

        let map = headers_to_map(&headers);
        assert_eq!(map["x-tenant"], vec!["acme", "beta"]);

        let back = map_to_headers(&map);
        let values: Vec<_> = back.get_all("x-tenant").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_map_to_headers_skips_invalid_entries() {
        let map = HashMap::from([
            ("bad name".to_string(), vec!["v".to_string()]),
            ("good".to_string(), vec!["v".to_string()]),
        ]);
        let headers = map_to_headers(&map);
        assert!(headers.get("good").is_some());
        assert_eq!(headers.len(), 1);
    }
}
