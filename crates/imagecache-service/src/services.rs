//! Provides the image service and a way to initialize it.
//!
//! [`ImageService`] wires the [`FetchCoordinator`] to its store, its origin and a clock,
//! according to the provided [`Config`]. It is created once at startup and shared by all
//! request handlers.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::caching::{ArtifactStore, FetchCoordinator, FreshnessPolicy};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::download::{HttpOrigin, Origin};
use crate::utils::http::DownloadTimeouts;

#[derive(Debug, Clone)]
pub struct ImageService {
    config: Arc<Config>,
    coordinator: FetchCoordinator,
}

impl ImageService {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates the service with a custom [`Clock`].
    pub fn with_clock(mut config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate();

        let store = ArtifactStore::open(&config.image_dir, &config.cached_image_name)
            .with_context(|| {
                format!(
                    "failed to open image directory {}",
                    config.image_dir.display()
                )
            })?;

        let timeouts = DownloadTimeouts::from_config(&config);
        let origin: Arc<dyn Origin> = Arc::new(
            HttpOrigin::new(config.origin_url.clone(), timeouts)
                .context("failed to create HTTP client")?,
        );

        let coordinator = FetchCoordinator::new(
            FreshnessPolicy::new(config.cache_duration),
            origin,
            Arc::new(store),
            clock,
        )
        .serve_stale_on_error(config.serve_stale_on_error);

        tracing::info!(
            image_dir = %coordinator.store().dir().display(),
            origin = %config.origin_url,
            cache_duration = ?config.cache_duration,
            "Image service ready"
        );

        Ok(Self {
            config: Arc::new(config),
            coordinator,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }
}
