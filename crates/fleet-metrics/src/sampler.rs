//! Metric sampler: periodic, timeout-bounded sampling fanned out to alarms.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, info, warn};

use fleet_state::{MetricSample, epoch_secs};

use crate::source::MetricSource;

/// What one sampling period produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    Sample(MetricSample),
    /// The source failed or timed out; `at` is when the period ended.
    Missing { at: u64 },
}

/// Samples a `MetricSource` on a fixed period and broadcasts each
/// observation to every subscribed alarm.
pub struct MetricSampler {
    source: Arc<dyn MetricSource>,
    interval: Duration,
    timeout: Duration,
    tx: broadcast::Sender<Observation>,
    latest: RwLock<Option<MetricSample>>,
    missed: AtomicU64,
}

impl MetricSampler {
    /// Create a sampler. `timeout` bounds every call into the source.
    pub fn new(source: Arc<dyn MetricSource>, interval: Duration, timeout: Duration) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            source,
            interval,
            timeout,
            tx,
            latest: RwLock::new(None),
            missed: AtomicU64::new(0),
        }
    }

    /// Subscribe to future observations.
    pub fn subscribe(&self) -> broadcast::Receiver<Observation> {
        self.tx.subscribe()
    }

    /// Last successful sample, if any.
    pub async fn latest(&self) -> Option<MetricSample> {
        *self.latest.read().await
    }

    /// Number of periods that produced no data.
    pub fn missed_samples(&self) -> u64 {
        self.missed.load(Ordering::Relaxed)
    }

    /// Take one sample and publish it.
    pub async fn tick(&self) -> Observation {
        let observation = match tokio::time::timeout(self.timeout, self.source.sample()).await {
            Ok(Ok(sample)) => {
                *self.latest.write().await = Some(sample);
                debug!(value = sample.value, timestamp = sample.timestamp, "metric sampled");
                Observation::Sample(sample)
            }
            Ok(Err(e)) => {
                self.missed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "metric sample failed, treating as no data");
                Observation::Missing { at: epoch_secs() }
            }
            Err(_) => {
                self.missed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "metric sample timed out, treating as no data"
                );
                Observation::Missing { at: epoch_secs() }
            }
        };

        // No receivers just means no alarms are listening yet.
        let _ = self.tx.send(observation);
        observation
    }

    /// Run the sampling loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "metric sampler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("metric sampler shutting down");
                    break;
                }
            }
        }
    }
}
