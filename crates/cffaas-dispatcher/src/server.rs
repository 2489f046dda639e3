//! Hyper accept loops.
//!
//! One listener serves the hot-swappable routing tree; a second one answers
//! the platform's liveness probes. Bodies are collected (and bounded) here
//! so everything below the listener works on fully-buffered requests.

use std::convert::Infallible;
use std::net::SocketAddr;

use http::StatusCode;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use cffaas_common::error::{FaasError, Result};
use cffaas_common::http::{collect_body, status_response, HyperRequest};

use crate::handler::SharedHandler;

/// Binds a listener, logging the bound address.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    Ok(listener)
}

/// Serves the handler tree until the listener fails.
pub async fn serve(listener: TcpListener, handler: SharedHandler) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: HyperRequest| {
                let handler = handler.clone();
                async move {
                    let (parts, body) = req.into_parts();
                    let body = match collect_body(body).await {
                        Ok(body) => body,
                        Err(FaasError::BodyTooLarge(size, max)) => {
                            tracing::warn!(size, max, "rejecting oversized request body");
                            return Ok(status_response(StatusCode::PAYLOAD_TOO_LARGE));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to read request body");
                            return Ok(status_response(StatusCode::BAD_REQUEST));
                        }
                    };

                    let req = http::Request::from_parts(parts, body);
                    Ok::<_, Infallible>(handler.handle(req).await)
                }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %err, "error serving connection");
            }
        });
    }
}

/// Serves the liveness endpoint: any request answers `200`.
pub async fn serve_health(listener: TcpListener) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = service_fn(|req: HyperRequest| async move {
                let _ = req;
                Ok::<_, Infallible>(status_response(StatusCode::OK))
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %err, "error serving health connection");
            }
        });
    }
}
