//! Model resource lifecycle
//!
//! - [`ModelRegistry`]: process-wide residency, one slot per category
//! - [`ResourceLoader`]: per-category `ensure()` handle
//! - [`ModelProvider`]: the download/initialize collaborator

mod loader;
mod registry;
mod state;

pub use loader::{ensure_all, ResourceLoader};
pub use registry::{ModelRegistry, ProgressReporter};
pub use state::{LoadState, ModelCategory};

use crate::backend::BackendError;
use async_trait::async_trait;

/// Fetches and initializes model weights
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Fetch weights, reporting progress as it goes
    async fn download(
        &self,
        category: ModelCategory,
        progress: &ProgressReporter,
    ) -> Result<(), BackendError>;

    /// Load fetched weights into the engine
    async fn initialize(&self, category: ModelCategory) -> Result<(), BackendError>;
}
