//! Background unloading of models that have not been used for a while

use crate::config::IdleEvictionConfig;
use crate::registry::ModelRegistry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodically unloads ready models idle beyond the configured TTL
///
/// Eviction goes through [`ModelRegistry::unload_if_idle`], the same path as a
/// manual unload, so it takes exclusive accelerator access before releasing
/// anything.
#[derive(Debug)]
pub struct IdleEvictor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl IdleEvictor {
    /// Start the eviction loop on the current runtime
    #[must_use]
    pub fn spawn(registry: Arc<ModelRegistry>, config: IdleEvictionConfig) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::run(registry, config, cancel.clone()));
        info!(
            idle_ttl_secs = config.idle_ttl.as_secs(),
            check_interval_secs = config.check_interval.as_secs(),
            "idle eviction enabled"
        );
        Self { cancel, handle }
    }

    async fn run(
        registry: Arc<ModelRegistry>,
        config: IdleEvictionConfig,
        cancel: CancellationToken,
    ) {
        let mut ticks = tokio::time::interval(config.check_interval);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticks.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticks.tick() => {},
            }

            for id in registry.idle_models(config.idle_ttl) {
                if cancel.is_cancelled() {
                    break;
                }
                match registry.unload_if_idle(&id, config.idle_ttl).await {
                    Ok(true) => info!(model = %id, "evicted idle model"),
                    Ok(false) => debug!(model = %id, "model became busy, skipping eviction"),
                    Err(e) => warn!(model = %id, error = %e, "idle eviction failed"),
                }
            }
        }
        debug!("idle eviction stopped");
    }

    /// Stop the loop and wait for an eviction in progress to finish
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "idle eviction task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::mock_factory;
    use crate::gate::AcceleratorGate;
    use crate::models::builtin_catalog;
    use crate::registry::{ModelState, Placement};
    use std::time::Duration;

    fn registry() -> Arc<ModelRegistry> {
        Arc::new(
            ModelRegistry::new(
                builtin_catalog(),
                Arc::new(mock_factory()),
                AcceleratorGate::new(1).unwrap(),
                Placement::default(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_idle_model_is_evicted() {
        let registry = registry();
        drop(registry.get_or_load("rmbg2").await.unwrap());

        let evictor = IdleEvictor::spawn(
            Arc::clone(&registry),
            IdleEvictionConfig {
                idle_ttl: Duration::from_millis(20),
                check_interval: Duration::from_millis(10),
            },
        );

        let mut evicted = false;
        for _ in 0..100 {
            if registry.status_of("rmbg2").unwrap().state == ModelState::Unloaded {
                evicted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        evictor.stop().await;
        assert!(evicted);
    }

    #[tokio::test]
    async fn test_leased_model_is_kept() {
        let registry = registry();
        let lease = registry.get_or_load("ben2").await.unwrap();

        let evictor = IdleEvictor::spawn(
            Arc::clone(&registry),
            IdleEvictionConfig {
                idle_ttl: Duration::from_millis(1),
                check_interval: Duration::from_millis(5),
            },
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        evictor.stop().await;

        assert_eq!(registry.status_of("ben2").unwrap().state, ModelState::Ready);
        drop(lease);
    }
}
