//! Application state shared across request handlers.

use std::sync::Arc;

use crate::allocation::{AllocationCoordinator, Allocator};
use crate::store::DeviceStore;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    allocator: Arc<Allocator>,
}

impl AppState {
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { allocator }),
        }
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.inner.allocator
    }

    pub fn coordinator(&self) -> &Arc<AllocationCoordinator> {
        self.inner.allocator.coordinator()
    }

    pub fn store(&self) -> &Arc<dyn DeviceStore> {
        self.coordinator().store()
    }
}
