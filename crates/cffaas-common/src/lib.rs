//! CF FaaS Common Types
//!
//! This crate provides the shared pieces used by every CF FaaS component:
//!
//! - **Envelopes**: the request/response snapshots that travel between the
//!   dispatcher and out-of-band workers, plus the work item handed to a
//!   polling worker
//! - **Errors**: the crate-wide [`FaasError`] enum and `Result` alias
//! - **HTTP helpers**: hyper type aliases, bounded body collection and JSON
//!   response builders
//! - **Platform traits**: the seams behind which the hosting platform's
//!   administrative API sits ([`platform::TaskCreator`],
//!   [`platform::PackageClient`], [`platform::InstanceLister`])
//!
//! # Wire format
//!
//! Envelope bodies are JSON with raw bytes carried as standard base64, so a
//! worker written in any language can fetch a parked request and post a
//! response back.

pub mod error;
pub mod event;
pub mod http;
pub mod platform;

pub use error::{FaasError, Result};
pub use event::{Request, Response, Work};
