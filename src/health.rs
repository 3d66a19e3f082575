// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Health and metrics endpoints.
//!
//! - `/healthz`: liveness, always `ok` while the process serves.
//! - `/healthz/ready`: 200 once every registered check passes.
//! - `/healthz/deep`: the per-check report as JSON.
//! - `/metrics`: the metric storage in Prometheus text format.
//! - `/requirements`: saved requirement values as JSON.
//! - `/requirements/{name}/{value}`: evaluates one requirement checker.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::metrics::MetricStorage;
use crate::requirements::{RequirementError, RequirementsView};

/// Boxed future for health checks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Health check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Check passed.
    Healthy,
    /// Check failed.
    Unhealthy,
}

impl From<bool> for HealthStatus {
    fn from(healthy: bool) -> Self {
        if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Result of running every check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,

    /// Status per check.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, HealthStatus>,
}

/// A readiness check.
pub trait HealthCheck: Send + Sync + 'static {
    /// Name shown in the deep report.
    fn name(&self) -> &str;

    /// Returns true when healthy.
    fn check(&self) -> BoxFuture<'_, bool>;
}

/// Check backed by a shared flag, such as the hook manager readiness.
pub struct FlagCheck {
    name: String,
    flag: Arc<AtomicBool>,
}

impl FlagCheck {
    /// Creates a check reading `flag`.
    pub fn new(name: impl Into<String>, flag: Arc<AtomicBool>) -> Self {
        Self {
            name: name.into(),
            flag,
        }
    }
}

impl HealthCheck for FlagCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> BoxFuture<'_, bool> {
        let healthy = self.flag.load(Ordering::Relaxed);
        Box::pin(async move { healthy })
    }
}

/// Registered readiness checks.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    checks: Arc<RwLock<Vec<Arc<dyn HealthCheck>>>>,
}

impl HealthRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a check.
    pub async fn register(&self, check: Arc<dyn HealthCheck>) {
        self.checks.write().await.push(check);
    }

    /// Removes a check by name.
    pub async fn unregister(&self, name: &str) -> bool {
        let mut checks = self.checks.write().await;
        let before = checks.len();
        checks.retain(|c| c.name() != name);
        checks.len() < before
    }

    /// Runs every check.
    pub async fn check_all(&self) -> HealthReport {
        let checks = self.checks.read().await;
        let mut report = BTreeMap::new();
        let mut healthy = true;
        for check in checks.iter() {
            let ok = check.check().await;
            healthy &= ok;
            report.insert(check.name().to_string(), HealthStatus::from(ok));
        }
        HealthReport {
            status: HealthStatus::from(healthy),
            checks: report,
        }
    }

    /// Returns the number of registered checks.
    pub async fn len(&self) -> usize {
        self.checks.read().await.len()
    }

    /// Returns true if no check is registered.
    pub async fn is_empty(&self) -> bool {
        self.checks.read().await.is_empty()
    }
}

#[derive(Clone)]
struct ServerState {
    checks: HealthRegistry,
    metrics: MetricStorage,
    requirements: Option<RequirementsView>,
}

/// Outcome of one requirement check.
#[derive(Debug, Serialize)]
struct RequirementReport<'a> {
    requirement: &'a str,
    value: &'a str,
    satisfied: bool,
}

/// HTTP server for health and metrics.
pub struct HealthServer {
    state: ServerState,
    bind_address: String,
    bind_port: u16,
}

impl HealthServer {
    /// Creates a server exposing `metrics`.
    pub fn new(bind_address: impl Into<String>, bind_port: u16, metrics: MetricStorage) -> Self {
        Self {
            state: ServerState {
                checks: HealthRegistry::new(),
                metrics,
                requirements: None,
            },
            bind_address: bind_address.into(),
            bind_port,
        }
    }

    /// Serves `requirements` under `/requirements`.
    pub fn with_requirements(mut self, requirements: RequirementsView) -> Self {
        self.state.requirements = Some(requirements);
        self
    }

    /// Returns the readiness registry.
    pub fn registry(&self) -> &HealthRegistry {
        &self.state.checks
    }

    /// Serves until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.bind_address, self.bind_port);
        let listener = TcpListener::bind(&addr).await?;
        info!(address = %addr, "health server listening");

        loop {
            let (stream, _) = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("health server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            let state = self.state.clone();
            let io = TokioIo::new(stream);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let state = state.clone();
                    async move { Ok::<_, hyper::Error>(route(req.uri().path(), &state).await) }
                });
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    debug!(error = %e, "health connection closed with error");
                }
            });
        }
    }

    /// Serves in a background task.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(self.run(cancel))
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn status_code(status: HealthStatus) -> StatusCode {
    match status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn route(path: &str, state: &ServerState) -> Response<Full<Bytes>> {
    match path {
        "/healthz" | "/healthz/live" => respond(StatusCode::OK, "text/plain", "ok"),
        "/healthz/ready" => {
            let report = state.checks.check_all().await;
            let body = match report.status {
                HealthStatus::Healthy => "ok",
                HealthStatus::Unhealthy => "not ready",
            };
            respond(status_code(report.status), "text/plain", body)
        }
        "/healthz/deep" => {
            let report = state.checks.check_all().await;
            let json = serde_json::to_string(&report).unwrap_or_default();
            respond(status_code(report.status), "application/json", json)
        }
        "/metrics" => match state.metrics.render() {
            Ok(text) => respond(StatusCode::OK, PROMETHEUS_CONTENT_TYPE, text),
            Err(e) => {
                error!(error = %e, "cannot encode metrics");
                respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string())
            }
        },
        _ => match (path.strip_prefix("/requirements"), &state.requirements) {
            (Some(rest), Some(requirements)) => requirement(rest, requirements).await,
            _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
        },
    }
}

async fn requirement(rest: &str, requirements: &RequirementsView) -> Response<Full<Bytes>> {
    let rest = rest.trim_matches('/');
    if rest.is_empty() {
        let json = serde_json::to_string(&requirements.saved_values()).unwrap_or_default();
        return respond(StatusCode::OK, "application/json", json);
    }

    let Some((name, value)) = rest.split_once('/') else {
        return respond(StatusCode::NOT_FOUND, "text/plain", "not found");
    };
    match requirements.check(name, value).await {
        Ok(satisfied) => {
            let report = RequirementReport {
                requirement: name,
                value,
                satisfied,
            };
            let json = serde_json::to_string(&report).unwrap_or_default();
            respond(StatusCode::OK, "application/json", json)
        }
        Err(e) => {
            let status = match e {
                RequirementError::Unknown(_) => StatusCode::NOT_FOUND,
                RequirementError::Unavailable(..) => StatusCode::SERVICE_UNAVAILABLE,
                RequirementError::Version(_) => StatusCode::BAD_REQUEST,
            };
            respond(status, "text/plain", e.to_string())
        }
    }
}
