//! Park/resume rendezvous between inbound requests and out-of-band workers.
//!
//! [`RequestRelayer::relay`] snapshots an inbound request under a freshly
//! minted token path and returns the token URL together with a wait handle.
//! A worker `GET`s the token URL to read the snapshot and `POST`s the
//! response envelope back to the same URL, which unblocks the waiter.
//!
//! The token path is the sole authority over the parked entry: a `GET` does
//! not consume it, the first `POST` does, and dropping the wait handle (the
//! originator gave up) removes it. Tokens are minted from a strong random
//! source mixed with wall-clock nanos; a collision would be a programming
//! error, not a handled case.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use http::{Method, StatusCode};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use url::Url;

use cffaas_common::error::{FaasError, Result};
use cffaas_common::event;
use cffaas_common::http::{
    error_response, headers_to_map, json_response, status_response, EventRequest, EventResponse,
};

use crate::handler::{path_vars, Handler};

struct Parked {
    request: event::Request,
    resp_tx: oneshot::Sender<event::Response>,
    err_tx: oneshot::Sender<FaasError>,
}

type ParkedMap = Arc<Mutex<HashMap<String, Parked>>>;

/// Process-local rendezvous table for parked requests.
pub struct RequestRelayer {
    external_addr: String,
    path_prefix: String,
    parked: ParkedMap,
}

impl RequestRelayer {
    /// Creates a relayer.
    ///
    /// # Arguments
    /// * `external_addr` - Base address workers reach this process at
    ///   (e.g. `http://app.example.com`)
    /// * `path_prefix` - Unguessable path prefix token paths are minted
    ///   under, without leading slash (e.g. `8271...93/relayer`)
    pub fn new(external_addr: String, path_prefix: String) -> Self {
        Self {
            external_addr,
            path_prefix,
            parked: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Parks an inbound request and returns its token URL plus wait handle.
    ///
    /// The wait handle resolves when a worker posts the response back, fails
    /// when the relayer signals an error for this token, and cleans the
    /// parked entry up on drop whatever happened.
    pub fn relay(&self, req: &EventRequest) -> Result<(Url, RelayWait)> {
        let path = self.mint_path();

        let snapshot = event::Request {
            path: req.uri().path().to_string(),
            url_variables: path_vars(req),
            method: req.method().to_string(),
            headers: headers_to_map(req.headers()),
            body: req.body().to_vec(),
        };

        let (resp_tx, resp_rx) = oneshot::channel();
        let (err_tx, err_rx) = oneshot::channel();

        let previous = self.parked.lock().insert(
            path.clone(),
            Parked {
                request: snapshot,
                resp_tx,
                err_tx,
            },
        );
        debug_assert!(previous.is_none(), "token path collision: {}", path);

        let url = Url::parse(&format!("{}{}", self.external_addr, path))?;

        Ok((
            url,
            RelayWait {
                resp_rx,
                err_rx,
                _guard: ParkGuard {
                    parked: self.parked.clone(),
                    path,
                },
            },
        ))
    }

    fn mint_path(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        format!(
            "/{}/{}{}",
            self.path_prefix,
            rand::random::<u64>(),
            nanos
        )
    }

    /// Number of currently parked entries.
    pub fn parked_len(&self) -> usize {
        self.parked.lock().len()
    }

    /// The mux pattern matching every token this relayer mints.
    pub fn route_pattern(&self) -> String {
        format!("/{}/{{token}}", self.path_prefix)
    }

    fn serve_get(&self, token: &str) -> EventResponse {
        let snapshot = {
            let parked = self.parked.lock();
            parked.get(token).map(|entry| entry.request.clone())
        };

        match snapshot {
            Some(request) => json_response(StatusCode::OK, &request),
            None => status_response(StatusCode::NOT_FOUND),
        }
    }

    fn serve_post(&self, token: &str, body: &[u8]) -> EventResponse {
        let Some(entry) = self.parked.lock().remove(token) else {
            return status_response(StatusCode::NOT_FOUND);
        };

        match serde_json::from_slice::<event::Response>(body) {
            Ok(response) => {
                // The waiter may have just given up; nothing left to do then.
                let _ = entry.resp_tx.send(response);
                status_response(StatusCode::OK)
            }
            Err(e) => {
                tracing::warn!(token, error = %e, "failed to decode posted response");
                let _ = entry
                    .err_tx
                    .send(FaasError::RelayFailed(format!("malformed response: {}", e)));
                status_response(StatusCode::EXPECTATION_FAILED)
            }
        }
    }
}

#[async_trait]
impl Handler for RequestRelayer {
    async fn handle(&self, req: EventRequest) -> EventResponse {
        // Parked bodies are only ever exposed over the platform's TLS edge.
        let forwarded_proto = req
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok());
        if forwarded_proto != Some("https") {
            return error_response(StatusCode::BAD_REQUEST, "rejecting non-https requests");
        }

        let token = req.uri().path().to_string();
        match *req.method() {
            Method::GET => self.serve_get(&token),
            Method::POST => self.serve_post(&token, req.body()),
            _ => status_response(StatusCode::METHOD_NOT_ALLOWED),
        }
    }
}

/// Wait handle returned by [`RequestRelayer::relay`].
///
/// Dropping it removes the parked entry, so a waiter that times out or whose
/// client disconnects never leaks its slot.
pub struct RelayWait {
    resp_rx: oneshot::Receiver<event::Response>,
    err_rx: oneshot::Receiver<FaasError>,
    _guard: ParkGuard,
}

impl RelayWait {
    /// Blocks until the worker posts a response or the relayer reports a
    /// failure for this token.
    pub async fn wait(mut self) -> Result<event::Response> {
        let mut resp_open = true;
        let mut err_open = true;

        // Whichever channel carries a value wins; a channel closed without a
        // value only means its sender half was dropped mid-delivery, so keep
        // listening on the other one.
        loop {
            tokio::select! {
                biased;
                resp = &mut self.resp_rx, if resp_open => match resp {
                    Ok(response) => return Ok(response),
                    Err(_) => resp_open = false,
                },
                err = &mut self.err_rx, if err_open => match err {
                    Ok(e) => return Err(e),
                    Err(_) => err_open = false,
                },
                else => return Err(FaasError::RelayCancelled),
            }
        }
    }
}

struct ParkGuard {
    parked: ParkedMap,
    path: String,
}

impl Drop for ParkGuard {
    fn drop(&mut self) {
        self.parked.lock().remove(&self.path);
    }
}
