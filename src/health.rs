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

//! Health check support.
//!
//! `/healthz` and `/healthz/live` always answer `ok` while the process is
//! up. `/healthz/ready` is `ok` only when every registered checker passes;
//! `/healthz/deep` returns the per-checker results as JSON.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;

use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode as HttpStatusCode;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::reconciler::SyncStatus;

/// Boxed future for health checks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Health check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The component is healthy.
    Healthy,
    /// The component is unhealthy.
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

/// Health check result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// The overall health status.
    pub status: HealthStatus,

    /// Individual component health.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub checks: HashMap<String, HealthStatus>,
}

/// Health checker trait.
pub trait HealthChecker: Send + Sync + 'static {
    /// Returns `true` if the component is healthy.
    fn check(&self) -> BoxFuture<'_, bool>;

    /// Returns the name of this checker.
    fn name(&self) -> &str;
}

/// Reports healthy while the reconciler's artifact is converged.
pub struct SyncStatusChecker {
    status: Arc<SyncStatus>,
}

impl SyncStatusChecker {
    /// Wraps a reconciler status handle.
    pub fn new(status: Arc<SyncStatus>) -> Self {
        Self { status }
    }
}

impl HealthChecker for SyncStatusChecker {
    fn check(&self) -> BoxFuture<'_, bool> {
        let converged = self.status.is_converged();
        Box::pin(async move { converged })
    }

    fn name(&self) -> &str {
        "reconciler"
    }
}

/// Health check registry.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    checkers: Arc<RwLock<Vec<Arc<dyn HealthChecker>>>>,
}

impl HealthRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a health checker.
    pub async fn register(&self, checker: Arc<dyn HealthChecker>) {
        self.checkers.write().await.push(checker);
    }

    /// Runs all health checks and returns the results.
    pub async fn check_all(&self) -> HealthCheck {
        let checkers = self.checkers.read().await;
        let mut checks = HashMap::new();
        let mut overall_healthy = true;

        for checker in checkers.iter() {
            let healthy = checker.check().await;
            overall_healthy &= healthy;
            checks.insert(checker.name().to_string(), HealthStatus::from(healthy));
        }

        HealthCheck {
            status: HealthStatus::from(overall_healthy),
            checks,
        }
    }
}

/// Health check server.
pub struct HealthServer {
    registry: HealthRegistry,
    bind_address: String,
    bind_port: u16,
}

impl HealthServer {
    /// Creates a new health server.
    pub fn new(bind_address: String, bind_port: u16) -> Self {
        Self {
            registry: HealthRegistry::new(),
            bind_address,
            bind_port,
        }
    }

    /// Returns the health registry.
    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    /// Binds the listener and serves requests in a background task.
    ///
    /// Bind errors are returned to the caller. Errors after that point are
    /// logged by the task before it exits.
    pub async fn spawn(self) -> anyhow::Result<JoinHandle<()>> {
        let addr = format!("{}:{}", self.bind_address, self.bind_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind health server to {}", addr))?;

        tracing::info!("health server listening on {}", addr);

        let registry = self.registry;
        Ok(tokio::spawn(async move {
            if let Err(e) = serve(listener, registry).await {
                tracing::error!(error = %e, "health server stopped");
            }
        }))
    }
}

async fn serve(listener: TcpListener, registry: HealthRegistry) -> std::io::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let registry = registry.clone();
        let io = TokioIo::new(stream);

        tokio::task::spawn(async move {
            let http = hyper::server::conn::http1::Builder::new();
            let service =
                service_fn(move |req: Request<Incoming>| handle_request(req, registry.clone()));

            if let Err(e) = http.serve_connection(io, service).await {
                tracing::debug!(error = %e, "health connection closed with error");
            }
        });
    }
}

fn response(
    status: HttpStatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Maps a request path to a response.
async fn route(path: &str, registry: &HealthRegistry) -> Response<Full<Bytes>> {
    match path {
        "/healthz" | "/healthz/live" => response(HttpStatusCode::OK, "text/plain", "ok"),
        "/healthz/ready" => {
            let result = registry.check_all().await;
            if result.status == HealthStatus::Healthy {
                response(HttpStatusCode::OK, "text/plain", "ok")
            } else {
                response(HttpStatusCode::SERVICE_UNAVAILABLE, "text/plain", "not ready")
            }
        }
        "/healthz/deep" => {
            let result = registry.check_all().await;
            let status = if result.status == HealthStatus::Healthy {
                HttpStatusCode::OK
            } else {
                HttpStatusCode::SERVICE_UNAVAILABLE
            };
            let json = serde_json::to_string(&result).unwrap_or_default();
            response(status, "application/json", json)
        }
        _ => response(HttpStatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}

async fn handle_request(
    req: Request<Incoming>,
    registry: HealthRegistry,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path(), &registry).await)
}
