//! Metric sources.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use fleet_state::{BoxFuture, MetricSample, epoch_secs};

/// Produces the fleet's aggregate utilization signal (e.g. average CPU).
///
/// An `Err` means the sample was missed; the sampler publishes it as
/// "no data" rather than failing the loop.
pub trait MetricSource: Send + Sync {
    fn sample(&self) -> BoxFuture<'_, anyhow::Result<MetricSample>>;
}

/// A source that replays a fixed script of values, cycling forever.
///
/// `None` entries simulate missed samples.
pub struct ScriptedSource {
    script: Vec<Option<f64>>,
    cursor: AtomicUsize,
    overrides: Mutex<Option<f64>>,
}

impl ScriptedSource {
    pub fn new(script: Vec<Option<f64>>) -> Self {
        Self {
            script,
            cursor: AtomicUsize::new(0),
            overrides: Mutex::new(None),
        }
    }

    /// Build from plain values with no gaps.
    pub fn from_values(values: &[f64]) -> Self {
        Self::new(values.iter().copied().map(Some).collect())
    }

    /// Pin every following sample to `value` until cleared.
    pub fn pin(&self, value: Option<f64>) {
        let mut guard = self
            .overrides
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = value;
    }

    fn next_value(&self) -> Option<f64> {
        let pinned = *self
            .overrides
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if pinned.is_some() {
            return pinned;
        }
        if self.script.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.script[idx % self.script.len()]
    }
}

impl MetricSource for ScriptedSource {
    fn sample(&self) -> BoxFuture<'_, anyhow::Result<MetricSample>> {
        let value = self.next_value();
        Box::pin(async move {
            match value {
                Some(value) => Ok(MetricSample {
                    timestamp: epoch_secs(),
                    value,
                }),
                None => Err(anyhow::anyhow!("scripted gap: no data")),
            }
        })
    }
}
