//! CF FaaS
//!
//! A function-as-a-service dispatcher that runs on platforms whose only
//! primitives are long-running HTTP application instances and short-lived
//! sibling tasks launched from the same deployed droplet.
//!
//! This crate re-exports the workspace members for convenience; the pieces
//! live in:
//!
//! - [`cffaas_common`] - envelope types, error enum, HTTP helpers, platform traits
//! - [`cffaas_capi`] - Cloud Controller admin client
//! - [`cffaas_dispatcher`] - relayer, worker pool, response cache, router
//! - [`cffaas_worker`] - worker poll loop, runner, package manager

pub use cffaas_capi as capi;
pub use cffaas_common as common;
pub use cffaas_dispatcher as dispatcher;
pub use cffaas_worker as worker;
