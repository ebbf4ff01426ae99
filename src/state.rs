//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::share::{ChunkAssembler, DownloadTracker, ExpiryReaper, ShareRegistry};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    registry: ShareRegistry,
    assembler: ChunkAssembler,
    downloads: DownloadTracker,
    reaper: ExpiryReaper,
}

impl AppState {
    /// Create application state around a registry
    pub fn new(config: Config, registry: ShareRegistry) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                assembler: ChunkAssembler::new(registry.clone()),
                downloads: DownloadTracker::new(registry.clone()),
                reaper: ExpiryReaper::new(registry.clone()),
                registry,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &ShareRegistry {
        &self.inner.registry
    }

    pub fn assembler(&self) -> &ChunkAssembler {
        &self.inner.assembler
    }

    pub fn downloads(&self) -> &DownloadTracker {
        &self.inner.downloads
    }

    pub fn reaper(&self) -> &ExpiryReaper {
        &self.inner.reaper
    }
}
