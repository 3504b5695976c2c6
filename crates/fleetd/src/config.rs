//! fleet.toml configuration parser.
//!
//! The file mirrors the operator's view (durations as `"60s"` strings,
//! optional sections with defaults). [`FleetConfig::resolve`] validates it
//! and produces the typed [`Settings`] the daemon is built from.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fleet_autoscale::{AlarmConfig, ScalingPolicy};
use fleet_controller::{ControllerSettings, RetryPolicy};
use fleet_health::HealthSettings;
use fleet_state::{AlarmKind, CapacityDelta, Comparison, FleetState, LaunchTemplate, parse_duration};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{field}: invalid duration {value:?}")]
    Duration { field: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub fleet: FleetSection,
    #[serde(default)]
    pub metric: MetricConfig,
    pub alarms: AlarmsConfig,
    #[serde(default)]
    pub policies: PoliciesConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSection {
    pub name: String,
    pub min_size: u32,
    pub max_size: u32,
    /// Defaults to `min_size`.
    pub desired_capacity: Option<u32>,
    #[serde(default)]
    pub replace_unhealthy: bool,
    #[serde(default = "default_activity_history")]
    pub activity_history: usize,
    /// Directory for the membership database. In-memory when unset.
    pub data_dir: Option<PathBuf>,
    pub launch_template: LaunchTemplate,
}

fn default_activity_history() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    pub interval: String,
    pub timeout: String,
    /// `host:port` of the utilization endpoint (`run` only).
    pub endpoint: Option<String>,
    pub path: String,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            interval: "60s".to_string(),
            timeout: "10s".to_string(),
            endpoint: None,
            path: "/utilization".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmsConfig {
    pub high: AlarmSection,
    pub low: AlarmSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmSection {
    pub threshold: f64,
    pub evaluation_periods: u32,
    /// Defaults to `greater_than` for high, `less_than` for low.
    pub comparison: Option<Comparison>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoliciesConfig {
    #[serde(default = "PolicySection::scale_out")]
    pub scale_out: PolicySection,
    #[serde(default = "PolicySection::scale_in")]
    pub scale_in: PolicySection,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            scale_out: PolicySection::scale_out(),
            scale_in: PolicySection::scale_in(),
        }
    }
}

/// Either a fixed `adjustment` or a `percent` change (with `min_step`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySection {
    pub adjustment: Option<i32>,
    pub percent: Option<i32>,
    pub min_step: Option<u32>,
    pub cooldown: String,
}

impl PolicySection {
    fn scale_out() -> Self {
        Self {
            adjustment: Some(1),
            percent: None,
            min_step: None,
            cooldown: "300s".to_string(),
        }
    }

    fn scale_in() -> Self {
        Self {
            adjustment: Some(-1),
            ..Self::scale_out()
        }
    }

    fn delta(&self, field: &str) -> ConfigResult<CapacityDelta> {
        let delta = match (self.adjustment, self.percent) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(format!(
                    "{field}: set either adjustment or percent, not both"
                )));
            }
            (_, Some(percent)) => CapacityDelta::PercentChangeInCapacity {
                percent,
                min_step: self.min_step.unwrap_or(1),
            },
            (Some(adjustment), None) => CapacityDelta::step(adjustment),
            (None, None) => {
                return Err(ConfigError::Invalid(format!(
                    "{field}: adjustment or percent is required"
                )));
            }
        };
        Ok(delta)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub path: String,
    pub interval: String,
    pub timeout: String,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            interval: "30s".to_string(),
            timeout: "5s".to_string(),
            healthy_threshold: 3,
            unhealthy_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// `host:port` of the provisioning API (`run` only).
    pub endpoint: Option<String>,
    pub max_attempts: u32,
    pub base_backoff: String,
    pub max_backoff: String,
    /// Bound on terminate calls. Launches are never cut short.
    pub terminate_timeout: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_attempts: 4,
            base_backoff: "1s".to_string(),
            max_backoff: "30s".to_string(),
            terminate_timeout: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    /// `host:port` of the load-balancing API (`run` only).
    pub endpoint: Option<String>,
    pub timeout: String,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout: "5s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    pub interval: String,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Utilization values replayed in a cycle.
    pub utilization: Vec<f64>,
    /// Fraction of launches that fail transiently.
    pub failure_rate: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            utilization: vec![50.0],
            failure_rate: 0.0,
        }
    }
}

/// Endpoints of the real collaborators, required by `fleetd run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoints {
    pub metric: String,
    pub metric_path: String,
    pub provisioning: String,
    pub load_balancer: String,
    pub terminate_timeout: Duration,
    pub lb_timeout: Duration,
}

/// Validated, typed configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub name: String,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_capacity: u32,
    pub data_dir: Option<PathBuf>,
    pub controller: ControllerSettings,
    pub alarms: Vec<AlarmConfig>,
    pub scale_out: ScalingPolicy,
    pub scale_in: ScalingPolicy,
    pub health: HealthSettings,
    pub metric_interval: Duration,
    pub metric_timeout: Duration,
    pub reconcile_interval: Duration,
    pub listen: Option<SocketAddr>,
}

impl Settings {
    pub fn fleet_state(&self) -> FleetState {
        FleetState::new(self.min_size, self.max_size, self.desired_capacity)
    }
}

fn duration(field: &'static str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field,
        value: value.to_string(),
    })
}

fn nonzero_duration(field: &'static str, value: &str) -> ConfigResult<Duration> {
    let d = duration(field, value)?;
    if d.is_zero() {
        return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
    }
    Ok(d)
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.resolve()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Validate every section and convert to runtime types.
    pub fn resolve(&self) -> ConfigResult<Settings> {
        let fleet = &self.fleet;
        if fleet.name.is_empty() {
            return Err(ConfigError::Invalid("fleet.name must not be empty".into()));
        }
        if fleet.min_size > fleet.max_size {
            return Err(ConfigError::Invalid(format!(
                "fleet.min_size ({}) exceeds fleet.max_size ({})",
                fleet.min_size, fleet.max_size
            )));
        }
        let desired = fleet.desired_capacity.unwrap_or(fleet.min_size);
        if desired < fleet.min_size || desired > fleet.max_size {
            return Err(ConfigError::Invalid(format!(
                "fleet.desired_capacity ({desired}) outside [{}, {}]",
                fleet.min_size, fleet.max_size
            )));
        }

        let alarms = vec![
            alarm(AlarmKind::HighUtilization, "alarms.high", &self.alarms.high)?,
            alarm(AlarmKind::LowUtilization, "alarms.low", &self.alarms.low)?,
        ];

        let scale_out = ScalingPolicy {
            adjustment: self.policies.scale_out.delta("policies.scale_out")?,
            cooldown: duration("policies.scale_out.cooldown", &self.policies.scale_out.cooldown)?,
        };
        let scale_in = ScalingPolicy {
            adjustment: self.policies.scale_in.delta("policies.scale_in")?,
            cooldown: duration("policies.scale_in.cooldown", &self.policies.scale_in.cooldown)?,
        };
        if scale_out.adjustment.resolve(fleet.max_size.max(1)) <= 0 {
            return Err(ConfigError::Invalid("policies.scale_out must increase capacity".into()));
        }
        if scale_in.adjustment.resolve(fleet.max_size.max(1)) >= 0 {
            return Err(ConfigError::Invalid("policies.scale_in must decrease capacity".into()));
        }

        let h = &self.health;
        if h.healthy_threshold == 0 || h.unhealthy_threshold == 0 {
            return Err(ConfigError::Invalid("health thresholds must be at least 1".into()));
        }
        let health = HealthSettings {
            path: h.path.clone(),
            interval: nonzero_duration("health.interval", &h.interval)?,
            timeout: nonzero_duration("health.timeout", &h.timeout)?,
            healthy_threshold: h.healthy_threshold,
            unhealthy_threshold: h.unhealthy_threshold,
        };

        let p = &self.provisioning;
        if p.max_attempts == 0 {
            return Err(ConfigError::Invalid("provisioning.max_attempts must be at least 1".into()));
        }
        let retry = RetryPolicy {
            max_attempts: p.max_attempts,
            base_backoff: duration("provisioning.base_backoff", &p.base_backoff)?,
            max_backoff: duration("provisioning.max_backoff", &p.max_backoff)?,
        };
        nonzero_duration("provisioning.terminate_timeout", &p.terminate_timeout)?;
        nonzero_duration("load_balancer.timeout", &self.load_balancer.timeout)?;

        if !(0.0..=1.0).contains(&self.simulation.failure_rate) {
            return Err(ConfigError::Invalid("simulation.failure_rate must be within [0, 1]".into()));
        }

        Ok(Settings {
            name: fleet.name.clone(),
            min_size: fleet.min_size,
            max_size: fleet.max_size,
            desired_capacity: desired,
            data_dir: fleet.data_dir.clone(),
            controller: ControllerSettings {
                template: fleet.launch_template.clone(),
                retry,
                replace_unhealthy: fleet.replace_unhealthy,
                activity_history: fleet.activity_history.max(1),
            },
            alarms,
            scale_out,
            scale_in,
            health,
            metric_interval: nonzero_duration("metric.interval", &self.metric.interval)?,
            metric_timeout: nonzero_duration("metric.timeout", &self.metric.timeout)?,
            reconcile_interval: nonzero_duration("reconcile.interval", &self.reconcile.interval)?,
            listen: self.server.as_ref().map(|s| s.listen),
        })
    }

    /// Collaborator endpoints, which `run` cannot do without.
    pub fn remote_endpoints(&self) -> ConfigResult<RemoteEndpoints> {
        let require = |value: &Option<String>, field: &str| {
            value
                .clone()
                .ok_or_else(|| ConfigError::Invalid(format!("{field} is required for `run`")))
        };
        Ok(RemoteEndpoints {
            metric: require(&self.metric.endpoint, "metric.endpoint")?,
            metric_path: self.metric.path.clone(),
            provisioning: require(&self.provisioning.endpoint, "provisioning.endpoint")?,
            load_balancer: require(&self.load_balancer.endpoint, "load_balancer.endpoint")?,
            terminate_timeout: nonzero_duration(
                "provisioning.terminate_timeout",
                &self.provisioning.terminate_timeout,
            )?,
            lb_timeout: nonzero_duration("load_balancer.timeout", &self.load_balancer.timeout)?,
        })
    }
}

fn alarm(kind: AlarmKind, field: &str, section: &AlarmSection) -> ConfigResult<AlarmConfig> {
    if section.evaluation_periods == 0 {
        return Err(ConfigError::Invalid(format!(
            "{field}.evaluation_periods must be at least 1"
        )));
    }
    if !section.threshold.is_finite() {
        return Err(ConfigError::Invalid(format!("{field}.threshold must be a number")));
    }
    let mut config = match kind {
        AlarmKind::HighUtilization => AlarmConfig::high(section.threshold, section.evaluation_periods),
        AlarmKind::LowUtilization => AlarmConfig::low(section.threshold, section.evaluation_periods),
    };
    if let Some(comparison) = section.comparison {
        config.comparison = comparison;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[fleet]
name = "web"
min_size = 2
max_size = 4

[fleet.launch_template]
name = "web"
image = "web:1.0"
instance_type = "small"

[alarms.high]
threshold = 80.0
evaluation_periods = 2

[alarms.low]
threshold = 20.0
evaluation_periods = 2
"#;

    #[test]
    fn parse_minimal_with_defaults() {
        let config = FleetConfig::from_toml(MINIMAL).unwrap();
        let settings = config.resolve().unwrap();

        assert_eq!(settings.name, "web");
        assert_eq!(settings.desired_capacity, 2);
        assert_eq!(settings.metric_interval, Duration::from_secs(60));
        assert_eq!(settings.scale_out.adjustment, CapacityDelta::step(1));
        assert_eq!(settings.scale_in.adjustment, CapacityDelta::step(-1));
        assert_eq!(settings.scale_out.cooldown, Duration::from_secs(300));
        assert_eq!(settings.alarms[0].comparison, Comparison::GreaterThan);
        assert_eq!(settings.alarms[1].comparison, Comparison::LessThan);
        assert_eq!(settings.health.unhealthy_threshold, 3);
        assert!(settings.listen.is_none());
        assert!(settings.data_dir.is_none());
    }

    #[test]
    fn parse_full() {
        let toml_str = format!(
            "{MINIMAL}{}",
            r#"
[metric]
interval = "15s"
timeout = "2s"
endpoint = "127.0.0.1:9100"
path = "/cpu"

[policies.scale_out]
percent = 50
min_step = 2
cooldown = "2m"

[policies.scale_in]
adjustment = -2
cooldown = "10m"

[health]
path = "/healthz"
interval = "10s"
timeout = "1s"
healthy_threshold = 2
unhealthy_threshold = 3

[provisioning]
endpoint = "127.0.0.1:7000"
max_attempts = 5
base_backoff = "500ms"
max_backoff = "20s"
terminate_timeout = "1m"

[load_balancer]
endpoint = "127.0.0.1:7001"
timeout = "3s"

[reconcile]
interval = "45s"

[server]
listen = "127.0.0.1:9090"
"#
        );
        let config = FleetConfig::from_toml(&toml_str).unwrap();
        let settings = config.resolve().unwrap();

        assert_eq!(
            settings.scale_out.adjustment,
            CapacityDelta::PercentChangeInCapacity { percent: 50, min_step: 2 }
        );
        assert_eq!(settings.scale_in.cooldown, Duration::from_secs(600));
        assert_eq!(settings.health.path, "/healthz");
        assert_eq!(settings.controller.retry.base_backoff, Duration::from_millis(500));
        assert_eq!(settings.reconcile_interval, Duration::from_secs(45));
        assert_eq!(settings.listen, Some("127.0.0.1:9090".parse().unwrap()));

        let remote = config.remote_endpoints().unwrap();
        assert_eq!(remote.metric, "127.0.0.1:9100");
        assert_eq!(remote.metric_path, "/cpu");
        assert_eq!(remote.terminate_timeout, Duration::from_secs(60));
    }

    #[test]
    fn min_above_max_is_rejected() {
        let bad = MINIMAL.replace("min_size = 2", "min_size = 5");
        assert!(matches!(
            FleetConfig::from_toml(&bad),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn zero_evaluation_periods_is_rejected() {
        let bad = MINIMAL.replacen("evaluation_periods = 2", "evaluation_periods = 0", 1);
        assert!(matches!(
            FleetConfig::from_toml(&bad),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn zero_health_threshold_is_rejected() {
        let bad = format!("{MINIMAL}\n[health]\npath = \"/\"\ninterval = \"5s\"\ntimeout = \"1s\"\nhealthy_threshold = 0\nunhealthy_threshold = 3\n");
        assert!(FleetConfig::from_toml(&bad).is_err());
    }

    #[test]
    fn bad_duration_names_the_field() {
        let bad = format!("{MINIMAL}\n[reconcile]\ninterval = \"soon\"\n");
        match FleetConfig::from_toml(&bad) {
            Err(ConfigError::Duration { field, value }) => {
                assert_eq!(field, "reconcile.interval");
                assert_eq!(value, "soon");
            }
            other => panic!("expected duration error, got {other:?}"),
        }
    }

    #[test]
    fn scale_in_must_shrink() {
        let bad = format!("{MINIMAL}\n[policies.scale_in]\nadjustment = 1\ncooldown = \"60s\"\n");
        assert!(matches!(
            FleetConfig::from_toml(&bad),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn run_requires_endpoints() {
        let config = FleetConfig::from_toml(MINIMAL).unwrap();
        assert!(config.remote_endpoints().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = FleetConfig::from_toml(MINIMAL).unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("web:1.0"));
        FleetConfig::from_toml(&rendered).unwrap();
    }

    #[test]
    fn example_config_is_valid() {
        let config = FleetConfig::from_toml(include_str!("../fleet.example.toml")).unwrap();
        let settings = config.resolve().unwrap();
        assert_eq!(settings.max_size, 6);
        assert_eq!(settings.health.interval, Duration::from_secs(120));
        assert_eq!(config.simulation.utilization.len(), 8);
        assert!(config.remote_endpoints().is_ok());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = FleetConfig::from_file(Path::new("/nonexistent/fleet.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
