//! Resolver: enriches bridges with geo data under a bounded worker pool

use crate::bridge::error::LookupError;
use crate::bridge::geo::GeoLookup;
use crate::bridge::models::{BridgeRecord, EnrichedBridge};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Default number of concurrent lookups
pub const DEFAULT_CONCURRENCY: usize = 15;

/// Hard ceiling on concurrent lookups
pub const MAX_CONCURRENCY: usize = 64;

/// Configuration for the resolver
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Number of concurrent lookup workers
    pub concurrency: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl ResolverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Concurrency clamped to `1..=MAX_CONCURRENCY`
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }
}

/// The batch stopped admitting lookups because the run was cancelled
#[derive(Debug, Error)]
#[error("resolution cancelled after {completed} of {total} lookups")]
pub struct ResolveCancelled {
    pub completed: usize,
    pub total: usize,
}

/// Resolves bridges against a shared geo index
pub struct Resolver {
    config: ResolverConfig,
    cancel: CancellationToken,
}

impl Resolver {
    /// Create a new resolver with default configuration
    pub fn new() -> Self {
        Self::with_config(ResolverConfig::default(), CancellationToken::new())
    }

    pub fn with_config(config: ResolverConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Resolve a single bridge on the blocking pool
    ///
    /// A failing or panicking lookup becomes a `LookupError` status rather than
    /// an error for the caller.
    pub async fn resolve_one<G>(index: Arc<G>, bridge: BridgeRecord) -> EnrichedBridge
    where
        G: GeoLookup + ?Sized + 'static,
    {
        let address = bridge.address;
        let outcome = tokio::task::spawn_blocking(move || index.lookup_ip(address)).await;

        match outcome {
            Ok(Ok(Some(geo))) => EnrichedBridge::resolved(bridge, geo),
            Ok(Ok(None)) => EnrichedBridge::not_found(bridge),
            Ok(Err(e)) => {
                log::debug!("Lookup failed for {}: {}", bridge.address, e);
                EnrichedBridge::lookup_error(bridge, e)
            }
            Err(e) => {
                log::warn!("Lookup worker for {} failed: {}", bridge.address, e);
                EnrichedBridge::lookup_error(bridge, LookupError::Worker(e.to_string()))
            }
        }
    }

    /// Resolve every bridge, at most `concurrency` at a time
    ///
    /// Output order is unspecified. Each input yields exactly one
    /// `EnrichedBridge`. If the run is cancelled, lookups already running are
    /// allowed to finish, no new ones start, and the batch is reported as
    /// cancelled instead of returning a partial set.
    pub async fn resolve_all<G>(
        &self,
        bridges: Vec<BridgeRecord>,
        index: Arc<G>,
    ) -> Result<Vec<EnrichedBridge>, ResolveCancelled>
    where
        G: GeoLookup + ?Sized + 'static,
    {
        let total = bridges.len();
        let concurrency = self.config.effective_concurrency();
        let semaphore = Arc::new(Semaphore::new(concurrency));

        log::info!("Resolving {} bridges with {} workers", total, concurrency);

        let results = stream::iter(bridges)
            .map(|bridge| {
                let sem = Arc::clone(&semaphore);
                let index = Arc::clone(&index);
                let cancel = self.cancel.clone();
                async move {
                    let _permit = sem.acquire_owned().await.ok()?;
                    if cancel.is_cancelled() {
                        return None;
                    }
                    Some(Self::resolve_one(index, bridge).await)
                }
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;

        let enriched: Vec<EnrichedBridge> = results.into_iter().flatten().collect();
        if enriched.len() < total {
            log::warn!(
                "Resolution cancelled after {} of {} lookups",
                enriched.len(),
                total
            );
            return Err(ResolveCancelled {
                completed: enriched.len(),
                total,
            });
        }

        Ok(enriched)
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}
