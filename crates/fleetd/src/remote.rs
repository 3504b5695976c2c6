//! HTTP collaborators used by `fleetd run`.
//!
//! | Collaborator | Request | Success |
//! |---|---|---|
//! | provisioning | `POST /instances` (template JSON) | 2xx + `InstanceHandle` JSON |
//! | provisioning | `DELETE /instances/{id}` | 2xx or 404 |
//! | load balancer | `PUT /targets/{id}` (target JSON) | 2xx, 409 = already registered |
//! | load balancer | `DELETE /targets/{id}` | 2xx, 404 = not registered |
//! | metric | `GET {path}` | 2xx, body `{"value": f64}` or a bare number |
//!
//! Launch requests carry no local timeout: an instance the API creates
//! must always come back to the controller to be tracked.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use fleet_controller::{ProvisionError, ProvisionResult, Provisioner};
use fleet_lb::{LbError, LbResult, LoadBalancer};
use fleet_metrics::MetricSource;
use fleet_state::{BoxFuture, InstanceHandle, LaunchTemplate, MetricSample, Target, epoch_secs};

/// Transport failure talking to a collaborator.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("connect: {0}")]
    Connect(String),

    #[error("request: {0}")]
    Request(String),

    #[error("timed out")]
    TimedOut,
}

/// Minimal HTTP/1 JSON client: one connection per call.
#[derive(Debug, Clone)]
pub struct HttpClient {
    address: String,
}

impl HttpClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send a request and collect the whole response body.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> Result<(StatusCode, Bytes), CallError> {
        let exchange = self.exchange(method, path, body);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| CallError::TimedOut)?,
            None => exchange.await,
        }
    }

    async fn exchange(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), CallError> {
        let uri = format!("http://{}{}", self.address, path);
        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| CallError::Connect(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| CallError::Connect(e.to_string()))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header("host", &self.address)
            .header("user-agent", "fleetd/0.1");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| CallError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| CallError::Request(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| CallError::Request(e.to_string()))?
            .to_bytes();

        debug!(%method, %uri, %status, "collaborator call");
        Ok((status, bytes))
    }
}

fn retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn status_error(status: StatusCode, body: &Bytes) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {text}")
    }
}

// ── Provisioning ───────────────────────────────────────────────

pub struct RemoteProvisioner {
    client: HttpClient,
    terminate_timeout: Duration,
}

impl RemoteProvisioner {
    pub fn new(client: HttpClient, terminate_timeout: Duration) -> Self {
        Self {
            client,
            terminate_timeout,
        }
    }

    async fn launch_instance(&self, template: &LaunchTemplate) -> ProvisionResult<InstanceHandle> {
        let body = serde_json::to_vec(template)
            .map_err(|e| ProvisionError::Permanent(format!("encode template: {e}")))?;
        let (status, bytes) = self
            .client
            .call(Method::POST, "/instances", Some(body), None)
            .await
            .map_err(|e| ProvisionError::Transient(e.to_string()))?;

        if status.is_success() {
            serde_json::from_slice(&bytes)
                .map_err(|e| ProvisionError::Permanent(format!("invalid launch response: {e}")))
        } else if retryable(status) {
            Err(ProvisionError::Transient(status_error(status, &bytes)))
        } else {
            Err(ProvisionError::Permanent(status_error(status, &bytes)))
        }
    }

    async fn terminate_instance(&self, instance: &InstanceHandle) -> ProvisionResult<()> {
        let path = format!("/instances/{}", instance.id);
        let (status, bytes) = self
            .client
            .call(Method::DELETE, &path, None, Some(self.terminate_timeout))
            .await
            .map_err(|e| ProvisionError::Transient(e.to_string()))?;

        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else if retryable(status) {
            Err(ProvisionError::Transient(status_error(status, &bytes)))
        } else {
            Err(ProvisionError::Permanent(status_error(status, &bytes)))
        }
    }
}

impl Provisioner for RemoteProvisioner {
    fn launch<'a>(
        &'a self,
        template: &'a LaunchTemplate,
    ) -> BoxFuture<'a, ProvisionResult<InstanceHandle>> {
        Box::pin(self.launch_instance(template))
    }

    fn terminate<'a>(&'a self, instance: &'a InstanceHandle) -> BoxFuture<'a, ProvisionResult<()>> {
        Box::pin(self.terminate_instance(instance))
    }
}

// ── Load balancing ─────────────────────────────────────────────

pub struct RemoteLoadBalancer {
    client: HttpClient,
    timeout: Duration,
}

impl RemoteLoadBalancer {
    pub fn new(client: HttpClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn send(&self, method: Method, target: &Target, conflict: StatusCode) -> LbResult<()> {
        let path = format!("/targets/{}", target.member_id);
        let body = if method == Method::PUT {
            Some(serde_json::to_vec(target).map_err(|e| LbError::Unavailable(e.to_string()))?)
        } else {
            None
        };
        let (status, bytes) = self
            .client
            .call(method, &path, body, Some(self.timeout))
            .await
            .map_err(|e| LbError::Unavailable(e.to_string()))?;

        if status.is_success() {
            Ok(())
        } else if status == conflict {
            Err(LbError::Conflict(status_error(status, &bytes)))
        } else {
            Err(LbError::Unavailable(status_error(status, &bytes)))
        }
    }
}

impl LoadBalancer for RemoteLoadBalancer {
    fn register<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, LbResult<()>> {
        Box::pin(self.send(Method::PUT, target, StatusCode::CONFLICT))
    }

    fn deregister<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, LbResult<()>> {
        Box::pin(self.send(Method::DELETE, target, StatusCode::NOT_FOUND))
    }
}

// ── Metric ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Reading {
    value: f64,
}

/// Reads aggregate utilization from an HTTP endpoint. The sampler bounds
/// each call with its own timeout.
pub struct HttpMetricSource {
    client: HttpClient,
    path: String,
}

impl HttpMetricSource {
    pub fn new(client: HttpClient, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
        }
    }

    async fn read(&self) -> anyhow::Result<MetricSample> {
        let (status, bytes) = self
            .client
            .call(Method::GET, &self.path, None, None)
            .await
            .map_err(|e| anyhow::anyhow!("metric endpoint {}: {e}", self.client.address()))?;
        if !status.is_success() {
            anyhow::bail!("metric endpoint returned {}", status_error(status, &bytes));
        }
        let value = parse_reading(&bytes)?;
        Ok(MetricSample {
            timestamp: epoch_secs(),
            value,
        })
    }
}

impl MetricSource for HttpMetricSource {
    fn sample(&self) -> BoxFuture<'_, anyhow::Result<MetricSample>> {
        Box::pin(self.read())
    }
}

fn parse_reading(bytes: &[u8]) -> anyhow::Result<f64> {
    if let Ok(reading) = serde_json::from_slice::<Reading>(bytes) {
        return Ok(reading.value);
    }
    let text = std::str::from_utf8(bytes)?.trim();
    let value: f64 = text
        .parse()
        .map_err(|_| anyhow::anyhow!("unreadable metric value {text:?}"))?;
    if !value.is_finite() {
        anyhow::bail!("metric value is not finite");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, State};
    use axum::routing::{get, post, put};
    use axum::{Json, Router};

    #[derive(Default)]
    struct FakeCloud {
        instances: Mutex<Vec<String>>,
        targets: Mutex<Vec<String>>,
        launch_status: Mutex<Option<StatusCode>>,
        terminate_status: Mutex<Option<StatusCode>>,
    }

    async fn launch(
        State(cloud): State<Arc<FakeCloud>>,
        Json(template): Json<LaunchTemplate>,
    ) -> Result<Json<InstanceHandle>, StatusCode> {
        if let Some(status) = *cloud.launch_status.lock().unwrap() {
            return Err(status);
        }
        let mut instances = cloud.instances.lock().unwrap();
        let id = format!("{}-{}", template.name, instances.len() + 1);
        instances.push(id.clone());
        Ok(Json(InstanceHandle {
            id,
            address: "10.1.0.1:8080".to_string(),
        }))
    }

    async fn terminate(State(cloud): State<Arc<FakeCloud>>, Path(id): Path<String>) -> StatusCode {
        if let Some(status) = *cloud.terminate_status.lock().unwrap() {
            return status;
        }
        let mut instances = cloud.instances.lock().unwrap();
        let before = instances.len();
        instances.retain(|i| *i != id);
        if instances.len() == before {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::NO_CONTENT
        }
    }

    async fn register(State(cloud): State<Arc<FakeCloud>>, Path(id): Path<String>) -> StatusCode {
        let mut targets = cloud.targets.lock().unwrap();
        if targets.contains(&id) {
            return StatusCode::CONFLICT;
        }
        targets.push(id);
        StatusCode::OK
    }

    async fn deregister(State(cloud): State<Arc<FakeCloud>>, Path(id): Path<String>) -> StatusCode {
        let mut targets = cloud.targets.lock().unwrap();
        let before = targets.len();
        targets.retain(|t| *t != id);
        if targets.len() == before {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::OK
        }
    }

    async fn serve(cloud: Arc<FakeCloud>) -> HttpClient {
        let router = Router::new()
            .route("/instances", post(launch))
            .route("/instances/{id}", axum::routing::delete(terminate))
            .route("/targets/{id}", put(register).delete(deregister))
            .route("/utilization", get(|| async { Json(serde_json::json!({ "value": 42.5 })) }))
            .route("/plain", get(|| async { "17\n" }))
            .route("/broken", get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }))
            .with_state(cloud);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        HttpClient::new(addr)
    }

    fn template() -> LaunchTemplate {
        LaunchTemplate {
            name: "web".to_string(),
            image: "web:1.0".to_string(),
            instance_type: "small".to_string(),
            tags: Default::default(),
        }
    }

    #[tokio::test]
    async fn provisioner_launches_and_terminates() {
        let cloud = Arc::new(FakeCloud::default());
        let provisioner = RemoteProvisioner::new(serve(cloud.clone()).await, Duration::from_secs(2));

        let handle = provisioner.launch(&template()).await.unwrap();
        assert_eq!(handle.id, "web-1");
        assert_eq!(cloud.instances.lock().unwrap().len(), 1);

        provisioner.terminate(&handle).await.unwrap();
        assert!(cloud.instances.lock().unwrap().is_empty());
        // Already gone is still success.
        provisioner.terminate(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn provisioner_classifies_errors() {
        let cloud = Arc::new(FakeCloud::default());
        let provisioner = RemoteProvisioner::new(serve(cloud.clone()).await, Duration::from_secs(2));

        *cloud.launch_status.lock().unwrap() = Some(StatusCode::TOO_MANY_REQUESTS);
        assert!(matches!(
            provisioner.launch(&template()).await,
            Err(ProvisionError::Transient(_))
        ));

        *cloud.launch_status.lock().unwrap() = Some(StatusCode::BAD_REQUEST);
        assert!(matches!(
            provisioner.launch(&template()).await,
            Err(ProvisionError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn terminate_classifies_errors() {
        let cloud = Arc::new(FakeCloud::default());
        let provisioner = RemoteProvisioner::new(serve(cloud.clone()).await, Duration::from_secs(2));
        let handle = provisioner.launch(&template()).await.unwrap();

        *cloud.terminate_status.lock().unwrap() = Some(StatusCode::FORBIDDEN);
        assert!(matches!(
            provisioner.terminate(&handle).await,
            Err(ProvisionError::Permanent(_))
        ));

        *cloud.terminate_status.lock().unwrap() = Some(StatusCode::BAD_REQUEST);
        assert!(matches!(
            provisioner.terminate(&handle).await,
            Err(ProvisionError::Permanent(_))
        ));

        *cloud.terminate_status.lock().unwrap() = Some(StatusCode::SERVICE_UNAVAILABLE);
        assert!(matches!(
            provisioner.terminate(&handle).await,
            Err(ProvisionError::Transient(_))
        ));

        *cloud.terminate_status.lock().unwrap() = None;
        provisioner.terminate(&handle).await.unwrap();
        assert!(cloud.instances.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_provisioner_is_transient() {
        let provisioner =
            RemoteProvisioner::new(HttpClient::new("127.0.0.1:1"), Duration::from_millis(500));
        assert!(matches!(
            provisioner.launch(&template()).await,
            Err(ProvisionError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn load_balancer_maps_conflicts() {
        let cloud = Arc::new(FakeCloud::default());
        let lb = RemoteLoadBalancer::new(serve(cloud.clone()).await, Duration::from_secs(2));
        let target = Target {
            member_id: "i-1".to_string(),
            address: "10.1.0.1:8080".to_string(),
        };

        lb.register(&target).await.unwrap();
        assert!(matches!(lb.register(&target).await, Err(LbError::Conflict(_))));
        lb.deregister(&target).await.unwrap();
        assert!(matches!(lb.deregister(&target).await, Err(LbError::Conflict(_))));
    }

    #[tokio::test]
    async fn unreachable_load_balancer_is_unavailable() {
        let lb = RemoteLoadBalancer::new(HttpClient::new("127.0.0.1:1"), Duration::from_millis(500));
        let target = Target {
            member_id: "i-1".to_string(),
            address: "x".to_string(),
        };
        assert!(matches!(lb.register(&target).await, Err(LbError::Unavailable(_))));
    }

    #[tokio::test]
    async fn metric_source_reads_json_and_plain_values() {
        let client = serve(Arc::new(FakeCloud::default())).await;

        let json = HttpMetricSource::new(client.clone(), "/utilization");
        assert_eq!(json.sample().await.unwrap().value, 42.5);

        let plain = HttpMetricSource::new(client.clone(), "/plain");
        assert_eq!(plain.sample().await.unwrap().value, 17.0);

        let broken = HttpMetricSource::new(client, "/broken");
        assert!(broken.sample().await.is_err());
    }

    #[test]
    fn parse_reading_rejects_garbage() {
        assert!(parse_reading(b"high").is_err());
        assert!(parse_reading(b"NaN").is_err());
        assert_eq!(parse_reading(b" 3.5 ").unwrap(), 3.5);
    }
}
