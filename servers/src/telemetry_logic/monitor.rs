use tokio::sync::broadcast;
use tokio::time::interval;

use crate::telemetry_logic::config::Config;
use crate::telemetry_logic::state::AppState;

/// Periodic housekeeping: evicts idle connections, forgets long-silent
/// devices and sweeps expired keys from the in-memory store.
pub async fn run(config: Config, app_state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let mut check_interval = interval(config.cleanup_interval());
    let stale_timeout = config.stale_timeout();
    let device_retention = config.device_retention();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Monitor service received shutdown signal.");
                break;
            }
            _ = check_interval.tick() => {
                let evicted = app_state.core.registry.cleanup_stale(stale_timeout);
                if !evicted.is_empty() {
                    tracing::warn!(
                        "Evicted {} connections idle for more than {} seconds.",
                        evicted.len(),
                        stale_timeout.as_secs()
                    );
                }

                let forgotten = app_state.provider.evict_silent(device_retention);
                if forgotten > 0 {
                    tracing::info!(
                        "Forgot {} devices silent for more than {} seconds.",
                        forgotten,
                        device_retention.as_secs()
                    );
                }

                if let Some(memory) = &app_state.memory {
                    let purged = memory.purge_expired();
                    if purged > 0 {
                        tracing::debug!("Purged {} expired keys from the memory store.", purged);
                    }
                }

                let stats = app_state.core.registry.stats();
                tracing::debug!(
                    "Registry: {} connections, {} subscribers, {} topics.",
                    stats.connections,
                    stats.subscribers,
                    stats.topics
                );
            }
        }
    }
}
