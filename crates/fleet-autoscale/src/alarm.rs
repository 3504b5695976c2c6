//! Threshold alarms over the sampled metric stream.

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use fleet_metrics::{Observation, SampleWindow};
use fleet_state::{AlarmEvent, AlarmKind, Comparison};

/// Static definition of one alarm.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmConfig {
    pub kind: AlarmKind,
    pub threshold: f64,
    pub comparison: Comparison,
    /// Consecutive breaching samples required to fire.
    pub evaluation_periods: u32,
}

impl AlarmConfig {
    /// Fires when the metric stays above `threshold`.
    pub fn high(threshold: f64, evaluation_periods: u32) -> Self {
        Self {
            kind: AlarmKind::HighUtilization,
            threshold,
            comparison: Comparison::GreaterThan,
            evaluation_periods,
        }
    }

    /// Fires when the metric stays below `threshold`.
    pub fn low(threshold: f64, evaluation_periods: u32) -> Self {
        Self {
            kind: AlarmKind::LowUtilization,
            threshold,
            comparison: Comparison::LessThan,
            evaluation_periods,
        }
    }
}

/// Where an alarm is in its breach run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    Idle,
    Accumulating { consecutive_breaches: u32 },
    /// The last sample completed a run and emitted an event. The next
    /// sample starts counting from zero.
    Fired,
}

/// Stateful detector for one alarm.
#[derive(Debug, Clone)]
pub struct AlarmEvaluator {
    config: AlarmConfig,
    state: AlarmState,
    window: SampleWindow,
}

impl AlarmEvaluator {
    pub fn new(mut config: AlarmConfig) -> Self {
        config.evaluation_periods = config.evaluation_periods.max(1);
        let window = SampleWindow::new(config.evaluation_periods as usize);
        Self {
            config,
            state: AlarmState::Idle,
            window,
        }
    }

    pub fn kind(&self) -> AlarmKind {
        self.config.kind
    }

    pub fn config(&self) -> &AlarmConfig {
        &self.config
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    pub fn consecutive_breaches(&self) -> u32 {
        match self.state {
            AlarmState::Accumulating { consecutive_breaches } => consecutive_breaches,
            AlarmState::Idle | AlarmState::Fired => 0,
        }
    }

    /// Recent samples, bounded to the evaluation periods.
    pub fn window(&self) -> &SampleWindow {
        &self.window
    }

    /// Feed one observation. Returns an event when this sample completes
    /// a breach run.
    pub fn observe(&mut self, observation: &Observation) -> Option<AlarmEvent> {
        let sample = match observation {
            Observation::Sample(sample) => *sample,
            Observation::Missing { at } => {
                debug!(
                    alarm = %self.config.kind,
                    at,
                    breaches = self.consecutive_breaches(),
                    "no data, alarm state unchanged"
                );
                return None;
            }
        };
        self.window.push(sample);

        if !self
            .config
            .comparison
            .breaches(sample.value, self.config.threshold)
        {
            if self.consecutive_breaches() > 0 {
                debug!(
                    alarm = %self.config.kind,
                    value = sample.value,
                    threshold = self.config.threshold,
                    "breach run broken, counter reset"
                );
            }
            self.state = AlarmState::Idle;
            return None;
        }

        let breaches = self.consecutive_breaches() + 1;
        if breaches >= self.config.evaluation_periods {
            self.state = AlarmState::Fired;
            info!(
                alarm = %self.config.kind,
                value = sample.value,
                threshold = self.config.threshold,
                periods = self.config.evaluation_periods,
                "alarm fired"
            );
            return Some(AlarmEvent {
                kind: self.config.kind,
                value: sample.value,
                at: sample.timestamp,
            });
        }

        self.state = AlarmState::Accumulating {
            consecutive_breaches: breaches,
        };
        debug!(
            alarm = %self.config.kind,
            breaches,
            periods = self.config.evaluation_periods,
            "alarm accumulating"
        );
        None
    }
}

/// Drive one alarm from the sampler's broadcast stream, forwarding every
/// event it fires. Each alarm runs in its own task.
pub async fn run_alarm(
    mut evaluator: AlarmEvaluator,
    mut observations: broadcast::Receiver<Observation>,
    events: mpsc::Sender<AlarmEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let kind = evaluator.kind();
    info!(alarm = %kind, threshold = evaluator.config().threshold, "alarm evaluator started");

    loop {
        tokio::select! {
            received = observations.recv() => match received {
                Ok(observation) => {
                    if let Some(event) = evaluator.observe(&observation)
                        && events.send(event).await.is_err()
                    {
                        debug!(alarm = %kind, "event receiver dropped");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Skipped observations are lost data, not breaks in the run.
                    warn!(alarm = %kind, skipped, "alarm lagged behind sampler");
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => {
                info!(alarm = %kind, "alarm evaluator shutting down");
                break;
            }
        }
    }
}
