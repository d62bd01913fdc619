//! Periodic health sweeper: probes every instance on a fixed cadence
//! through a bounded worker pool and writes the health triplet back to the
//! state store. Runs concurrently with dispatch; last write wins.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::dispatch::Dispatcher;
use crate::manager::InstanceManager;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONCURRENT_PROBES: usize = 10;

pub struct HealthSweeper {
    manager: Arc<InstanceManager>,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    probe_timeout: Duration,
    max_concurrent: usize,
}

impl HealthSweeper {
    pub fn new(manager: Arc<InstanceManager>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            manager,
            dispatcher,
            interval: SWEEP_INTERVAL,
            probe_timeout: PROBE_TIMEOUT,
            max_concurrent: MAX_CONCURRENT_PROBES,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }

    /// One full pass over the fleet. Public so callers (and tests) can run
    /// a sweep on demand.
    pub async fn sweep(&self) {
        let configs = self.manager.all_configs().await;
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut probes = JoinSet::new();

        for config in configs {
            let Some(client) = self.dispatcher.client(&config.name) else {
                continue;
            };
            let manager = self.manager.clone();
            let semaphore = semaphore.clone();
            let probe_timeout = self.probe_timeout;
            let name = config.name.clone();

            probes.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                match tokio::time::timeout(probe_timeout, client.health_check()).await {
                    Ok(Ok(latency_ms)) => {
                        manager.apply_health_result(&name, true, latency_ms, None).await;
                    }
                    Ok(Err(message)) => {
                        tracing::warn!(instance = %name, error = %message, "health probe failed");
                        manager
                            .apply_health_result(&name, false, 0.0, Some(message))
                            .await;
                    }
                    Err(_) => {
                        tracing::warn!(instance = %name, "health probe timed out");
                        manager
                            .apply_health_result(
                                &name,
                                false,
                                0.0,
                                Some("health check timed out".to_string()),
                            )
                            .await;
                    }
                }
            });
        }

        while probes.join_next().await.is_some() {}
    }
}
