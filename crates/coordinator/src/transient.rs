use std::sync::Arc;

use mappa_indices::IndicesService;
use tracing::{debug, warn};

pub(crate) const TRANSIENT_REASON: &str = "created for mapping processing";

/// Removes a collection materialized only to process mappings.
///
/// Teardown runs on drop, so every exit path releases it exactly once.
pub(crate) struct TransientCollection {
    indices: Arc<dyn IndicesService>,
    name: String,
}

impl TransientCollection {
    pub(crate) fn new(indices: Arc<dyn IndicesService>, name: impl Into<String>) -> Self {
        Self { indices, name: name.into() }
    }
}

impl Drop for TransientCollection {
    fn drop(&mut self) {
        match self.indices.remove_index(&self.name, TRANSIENT_REASON) {
            Ok(()) => debug!(collection = %self.name, "transient collection removed"),
            Err(e) => warn!(collection = %self.name, error = %e, "failed to remove transient collection"),
        }
    }
}
