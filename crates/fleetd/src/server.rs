//! Read-only status endpoints.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/metrics` | Prometheus exposition |
//! | GET | `/fleet` | Fleet snapshot, targets and recent activities as JSON |

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use fleet_controller::FleetController;
use fleet_metrics::{FleetGauges, MetricSampler, render_prometheus};
use fleet_state::{FleetSnapshot, MemberId, MetricSample, ScalingActivity};

/// Activities included in `/fleet`.
const RECENT_ACTIVITIES: usize = 20;

#[derive(Clone)]
pub struct StatusState {
    pub fleet: String,
    pub controller: Arc<FleetController>,
    pub sampler: Arc<MetricSampler>,
}

impl StatusState {
    async fn gauges(&self) -> FleetGauges {
        FleetGauges {
            fleet: self.fleet.clone(),
            snapshot: self.controller.snapshot().await,
            registered_targets: self.controller.registrar().registered().await.len(),
            last_metric: self.sampler.latest().await,
            missed_samples: self.sampler.missed_samples(),
            degraded_events: self.controller.degraded_events(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FleetStatus {
    pub fleet: String,
    pub snapshot: FleetSnapshot,
    pub registered_targets: BTreeSet<MemberId>,
    pub last_metric: Option<MetricSample>,
    pub degraded_events: u64,
    pub activities: Vec<ScalingActivity>,
}

pub fn build_router(state: StatusState) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics))
        .route("/fleet", get(fleet_status))
        .with_state(state)
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<StatusState>) -> impl IntoResponse {
    let body = render_prometheus(&state.gauges().await);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// GET /fleet
pub async fn fleet_status(State(state): State<StatusState>) -> impl IntoResponse {
    let activities = match state.controller.recent_activities(RECENT_ACTIVITIES) {
        Ok(activities) => activities,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    Json(FleetStatus {
        fleet: state.fleet.clone(),
        snapshot: state.controller.snapshot().await,
        registered_targets: state.controller.registrar().registered().await,
        last_metric: state.sampler.latest().await,
        degraded_events: state.controller.degraded_events(),
        activities,
    })
    .into_response()
}
