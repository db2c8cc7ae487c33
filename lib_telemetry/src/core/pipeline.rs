//! # Fan-out Pipeline Assembly
//!
//! Wires one store, one registry and one status provider into the full set
//! of components sharing them. Binaries and integration tests build the core
//! through [`FanoutCore::new`] instead of repeating the wiring.

use std::sync::Arc;
use tracing::info;

use super::aggregator::BatchAggregator;
use super::dispatcher::{Dispatcher, PubSubFanout};
use super::rate_limiter::RateLimiter;
use super::registry::ConnectionRegistry;
use super::scheduler::BroadcastScheduler;
use crate::configs::FanoutConfig;
use crate::connections::EphemeralStore;
use crate::error::Result;
use crate::ingestors::TelemetryIngestor;
use crate::providers::StatusProvider;

/// Every component of the fan-out core, sharing one store and one registry.
#[derive(Clone)]
pub struct FanoutCore {
    pub config: FanoutConfig,
    pub store: Arc<dyn EphemeralStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub aggregator: Arc<BatchAggregator>,
    pub scheduler: BroadcastScheduler,
    pub ingestor: TelemetryIngestor,
}

impl FanoutCore {
    /// Builds the core publishing through a [`Dispatcher`] over a fresh
    /// registry. Fails when `config` does not validate.
    pub fn new(
        config: FanoutConfig,
        store: Arc<dyn EphemeralStore>,
        provider: Arc<dyn StatusProvider>,
    ) -> Result<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = Arc::new(Dispatcher::new(Arc::clone(&registry)));
        Self::with_fanout(config, store, registry, fanout, provider)
    }

    /// Builds the core around a caller-supplied publisher.
    pub fn with_fanout(
        config: FanoutConfig,
        store: Arc<dyn EphemeralStore>,
        registry: Arc<ConnectionRegistry>,
        fanout: Arc<dyn PubSubFanout>,
        provider: Arc<dyn StatusProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let limiter = Arc::new(RateLimiter::new(Arc::clone(&store), &config));
        let aggregator = Arc::new(BatchAggregator::new(Arc::clone(&store), &config));
        let scheduler = BroadcastScheduler::new(
            Arc::clone(&store),
            Arc::clone(&aggregator),
            Arc::clone(&registry),
            fanout,
            provider,
            &config,
        );
        let ingestor =
            TelemetryIngestor::new(Arc::clone(&limiter), Arc::clone(&aggregator), scheduler.clone());

        info!(
            "Fan-out core ready (burst {}/{}s, sustained {}/{}s, debounce {}ms)",
            config.burst_rate,
            config.burst_period_seconds,
            config.sustained_rate,
            config.sustained_period_seconds,
            config.debounce_interval_ms
        );

        Ok(Self {
            config,
            store,
            registry,
            limiter,
            aggregator,
            scheduler,
            ingestor,
        })
    }
}
