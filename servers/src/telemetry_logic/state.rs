use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use lib_telemetry::{EphemeralStore, FanoutCore, MemoryStore, RedisStore};

use crate::telemetry_logic::config::Config;
use crate::telemetry_logic::model::StatsBody;
use crate::telemetry_logic::provider::LivenessProvider;

#[derive(Clone)]
pub struct AppState {
    pub core: FanoutCore,
    // Also held by the core; kept here to feed it observations.
    pub provider: Arc<LivenessProvider>,
    // Set when running on the in-process store, so the monitor can sweep it.
    pub memory: Option<Arc<MemoryStore>>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Connects the configured store and assembles the fan-out core.
    pub async fn build(config: &Config) -> Result<Self> {
        let provider = Arc::new(LivenessProvider::new(config.device_online_window()));

        let mut fanout = config.fanout();
        let (store, memory): (Arc<dyn EphemeralStore>, Option<Arc<MemoryStore>>) =
            match &config.redis_url {
                Some(url) => {
                    // Another gateway may share this server; keep batches and
                    // markers private to the instance holding the sockets.
                    let instance = fanout
                        .instance_id
                        .get_or_insert_with(|| Uuid::new_v4().simple().to_string());
                    tracing::info!("Using redis store as instance {}.", instance);
                    (Arc::new(RedisStore::connect(url).await?), None)
                }
                None => {
                    tracing::info!("No redis URL configured; using the in-memory store.");
                    let memory = Arc::new(MemoryStore::new());
                    (memory.clone(), Some(memory))
                }
            };

        let core = FanoutCore::new(fanout, store, provider.clone())?;
        Ok(Self::from_parts(core, provider, memory))
    }

    pub fn from_parts(
        core: FanoutCore,
        provider: Arc<LivenessProvider>,
        memory: Option<Arc<MemoryStore>>,
    ) -> Self {
        Self {
            core,
            provider,
            memory,
            started_at: Utc::now(),
        }
    }

    pub fn store_kind(&self) -> &'static str {
        if self.memory.is_some() { "memory" } else { "redis" }
    }

    pub fn stats(&self) -> StatsBody {
        StatsBody {
            started_at: self.started_at,
            store: self.store_kind(),
            registry: self.core.registry.stats(),
            scheduler: self.core.scheduler.stats(),
            known_devices: self.provider.len(),
        }
    }
}
