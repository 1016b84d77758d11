//! TTL-cached front for the registry client
//!
//! Keyed by `pull-secret:image`. Errors are never cached, so a registry
//! outage does not suppress a later retry.

use super::{Platform, Registry};
use crate::cache::{Cache, CacheMetrics};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct CachedRegistry {
    registry: Arc<dyn Registry>,
    cache: Arc<Cache<Vec<Platform>>>,
    metrics: CacheMetrics,
}

impl CachedRegistry {
    pub fn new(
        registry: Arc<dyn Registry>,
        cache_duration: Duration,
        prometheus_registry: &prometheus::Registry,
    ) -> Result<Self> {
        Ok(Self {
            registry,
            cache: Arc::new(Cache::new(cache_duration)),
            metrics: CacheMetrics::new("noe", "registry", prometheus_registry)?,
        })
    }
}

#[async_trait]
impl Registry for CachedRegistry {
    async fn list_archs(&self, image_pull_secret: &str, image: &str) -> Result<Vec<Platform>> {
        self.metrics.requests.inc();
        let cache_key = format!("{}:{}", image_pull_secret, image);

        let result = self
            .cache
            .load_or_call(&cache_key, || async {
                self.registry.list_archs(image_pull_secret, image).await
            })
            .await;

        // Trigger a cleanup of the cache, but don't wait for it to finish.
        // Waiting for the cleanup would slow down the response.
        let cache = self.cache.clone();
        tokio::spawn(async move { cache.clean_up(Instant::now()) });

        let (archs, cached) = result?;
        if cached {
            self.metrics.responses.with_label_values(&["hit"]).inc();
        } else {
            self.metrics.responses.with_label_values(&["miss"]).inc();
        }
        Ok(archs)
    }
}
