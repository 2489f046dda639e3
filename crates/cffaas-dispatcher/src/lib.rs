//! CF FaaS Dispatcher
//!
//! The serving side of the system. One long-running instance of this crate
//! parks inbound HTTP requests, hands them to out-of-band workers through a
//! rendezvous protocol, memoizes idempotent responses across instances and
//! serves everything behind a hot-swappable routing tree.
//!
//! # Architecture
//!
//! - [`relayer`] - park/resume rendezvous between inbound requests and workers
//! - [`worker_pool`] - hands work to long-polling workers, provokes task
//!   creation under pressure (rate-budgeted)
//! - [`http_event`] - per-route glue: relay, submit, await, respond
//! - [`cache`] / [`groupcache`] - distributed, time-bucketed response
//!   memoization
//! - [`mux`] - immutable method + pattern route table
//! - [`hot_swap`] - atomic replacement of the live routing tree
//! - [`manifest`] - declarative route manifest and its plugin resolver
//! - [`router`] - builds the full handler tree from a resolved manifest
//! - [`server`] - hyper accept loops (main listener and health endpoint)

pub mod cache;
pub mod groupcache;
pub mod handler;
pub mod hot_swap;
pub mod http_event;
pub mod manifest;
pub mod mux;
pub mod relayer;
pub mod router;
pub mod server;
pub mod worker_pool;

pub use handler::{Handler, SharedHandler};
pub use hot_swap::HotSwap;
pub use relayer::RequestRelayer;
pub use router::RouterBuilder;
pub use worker_pool::WorkerPool;
