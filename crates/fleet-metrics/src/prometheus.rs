//! Prometheus text exposition format.
//!
//! Renders the control loop's view of a fleet for scraping by a
//! Prometheus server or compatible agent.

use fleet_state::{FleetSnapshot, MetricSample};

/// Everything the `/metrics` endpoint reports for one fleet.
#[derive(Debug, Clone)]
pub struct FleetGauges {
    pub fleet: String,
    pub snapshot: FleetSnapshot,
    pub registered_targets: usize,
    pub last_metric: Option<MetricSample>,
    pub missed_samples: u64,
    pub degraded_events: u64,
}

/// Render fleet gauges into Prometheus text format.
pub fn render_prometheus(g: &FleetGauges) -> String {
    let mut out = String::new();
    let label = format!("fleet=\"{}\"", g.fleet);
    let health = g.snapshot.health_counts();

    gauge(&mut out, "fleet_desired_capacity", "Desired number of in-service members.", &label, g.snapshot.desired_capacity);
    gauge(&mut out, "fleet_min_size", "Minimum fleet size.", &label, g.snapshot.min_size);
    gauge(&mut out, "fleet_max_size", "Maximum fleet size.", &label, g.snapshot.max_size);

    out.push_str("# HELP fleet_members Tracked members by health state.\n");
    out.push_str("# TYPE fleet_members gauge\n");
    for (state, count) in [
        ("healthy", health.healthy),
        ("unhealthy", health.unhealthy),
        ("unknown", health.unknown),
    ] {
        out.push_str(&format!(
            "fleet_members{{{label},health=\"{state}\"}} {count}\n"
        ));
    }
    let terminating = g.snapshot.members.iter().filter(|m| m.terminating).count();
    gauge(&mut out, "fleet_members_terminating", "Members being drained and terminated.", &label, terminating);

    gauge(&mut out, "fleet_registered_targets", "Targets registered with the load balancer.", &label, g.registered_targets);

    out.push_str("# HELP fleet_utilization Last sampled utilization value.\n");
    out.push_str("# TYPE fleet_utilization gauge\n");
    if let Some(sample) = g.last_metric {
        out.push_str(&format!("fleet_utilization{{{label}}} {:.2}\n", sample.value));
    }

    out.push_str("# HELP fleet_missed_samples_total Sampling periods that produced no data.\n");
    out.push_str("# TYPE fleet_missed_samples_total counter\n");
    out.push_str(&format!("fleet_missed_samples_total{{{label}}} {}\n", g.missed_samples));

    out.push_str("# HELP fleet_degraded_capacity_total Scale operations that ended below desired capacity.\n");
    out.push_str("# TYPE fleet_degraded_capacity_total counter\n");
    out.push_str(&format!("fleet_degraded_capacity_total{{{label}}} {}\n", g.degraded_events));

    out
}

fn gauge(out: &mut String, name: &str, help: &str, label: &str, value: impl std::fmt::Display) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} gauge\n"));
    out.push_str(&format!("{name}{{{label}}} {value}\n"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::{FleetMember, HealthState};

    fn member(id: &str, health: HealthState) -> FleetMember {
        FleetMember {
            id: id.to_string(),
            address: "10.0.0.1:8080".to_string(),
            launch_time: 1000,
            health_state: health,
            registered: health == HealthState::Healthy,
            terminating: false,
        }
    }

    fn test_gauges() -> FleetGauges {
        FleetGauges {
            fleet: "web".to_string(),
            snapshot: FleetSnapshot {
                desired_capacity: 3,
                min_size: 2,
                max_size: 4,
                members: vec![
                    member("a", HealthState::Healthy),
                    member("b", HealthState::Healthy),
                    member("c", HealthState::Unhealthy),
                ],
            },
            registered_targets: 2,
            last_metric: Some(MetricSample { timestamp: 1000, value: 85.0 }),
            missed_samples: 1,
            degraded_events: 0,
        }
    }

    #[test]
    fn render_fleet_gauges() {
        let output = render_prometheus(&test_gauges());

        assert!(output.contains("fleet_desired_capacity{fleet=\"web\"} 3"));
        assert!(output.contains("fleet_min_size{fleet=\"web\"} 2"));
        assert!(output.contains("fleet_max_size{fleet=\"web\"} 4"));
        assert!(output.contains("fleet_members{fleet=\"web\",health=\"healthy\"} 2"));
        assert!(output.contains("fleet_members{fleet=\"web\",health=\"unhealthy\"} 1"));
        assert!(output.contains("fleet_registered_targets{fleet=\"web\"} 2"));
        assert!(output.contains("fleet_utilization{fleet=\"web\"} 85.00"));
        assert!(output.contains("fleet_missed_samples_total{fleet=\"web\"} 1"));
    }

    #[test]
    fn render_without_samples_omits_utilization_value() {
        let mut gauges = test_gauges();
        gauges.last_metric = None;
        let output = render_prometheus(&gauges);

        assert!(output.contains("# TYPE fleet_utilization gauge"));
        assert!(!output.contains("fleet_utilization{"));
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let output = render_prometheus(&test_gauges());

        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            assert!(
                line.contains('{') && line.contains('}'),
                "line should have labels: {line}"
            );
        }
    }
}
