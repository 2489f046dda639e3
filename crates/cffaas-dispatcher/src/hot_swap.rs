//! Atomic replacement of the live routing tree.
//!
//! The process starts serving a bootstrap tree immediately and swaps the
//! real one in once manifest resolution finishes. A request dispatched after
//! `swap` observes either the old tree or the new one, never a mix: the
//! handler reference is cloned under a read lock and the swap takes the
//! write lock only for the pointer store.

use async_trait::async_trait;
use parking_lot::RwLock;

use cffaas_common::http::{EventRequest, EventResponse};

use crate::handler::{Handler, SharedHandler};

/// The single serving cell the listener dispatches through.
pub struct HotSwap {
    current: RwLock<SharedHandler>,
}

impl HotSwap {
    pub fn new(initial: SharedHandler) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Installs a new tree. In-flight requests finish on the tree they
    /// started with.
    pub fn swap(&self, next: SharedHandler) {
        *self.current.write() = next;
    }
}

#[async_trait]
impl Handler for HotSwap {
    async fn handle(&self, req: EventRequest) -> EventResponse {
        let handler = self.current.read().clone();
        handler.handle(req).await
    }
}
