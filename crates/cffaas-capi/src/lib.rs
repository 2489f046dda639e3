//! Cloud Controller admin client.
//!
//! Implements the platform traits from `cffaas-common` against the v2/v3
//! Cloud Controller API: app-name lookup, current-package resolution, task
//! creation and instance listing.

pub mod client;

pub use client::CapiClient;
