//! Jiva Backend Adapter
//!
//! Drives the Jiva storage engine over HTTP. Volume creation and removal go
//! through the management API; replica status and resize go to the
//! volume's own controller process, whose address the management API
//! returns at provision time.

use crate::crd::BackendEndpoint;
use crate::domain::ports::{
    BackendControl, ProvisionRequest, ReplicaHealth, ReplicaStatus, ReplicaStatusSnapshot,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Jiva adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JivaBackendConfig {
    /// Base URL of the management API
    pub management_url: String,
    /// Timeout of a single HTTP request, in seconds
    pub request_timeout_secs: u64,
    /// Total time spent retrying a transient failure, in milliseconds
    pub retry_budget_ms: u64,
}

impl Default for JivaBackendConfig {
    fn default() -> Self {
        Self {
            management_url: "http://jiva-operator.openebs.svc:8080".to_string(),
            request_timeout_secs: 10,
            retry_budget_ms: 5_000,
        }
    }
}

// =============================================================================
// Wire Types
// =============================================================================

/// Collection envelope used by the controller API
#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplicaResource {
    address: String,
    mode: String,
    #[serde(default)]
    size: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeResource {
    #[serde(default)]
    read_only: bool,
    #[serde(default)]
    size: String,
}

#[derive(Debug, Serialize)]
struct ResizeInput {
    size: String,
}

fn replica_health(mode: &str) -> ReplicaHealth {
    match mode {
        "RW" => ReplicaHealth::Healthy,
        "WO" => ReplicaHealth::Degraded,
        _ => ReplicaHealth::Unreachable,
    }
}

fn parse_size(raw: &str) -> u64 {
    raw.trim().parse().unwrap_or(0)
}

// =============================================================================
// Jiva Adapter
// =============================================================================

/// HTTP client for the Jiva management and controller APIs
#[derive(Debug, Clone)]
pub struct JivaBackend {
    config: JivaBackendConfig,
    client: reqwest::Client,
}

impl JivaBackend {
    pub fn new(config: JivaBackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    fn management(&self, path: &str) -> String {
        format!("{}{}", self.config.management_url.trim_end_matches('/'), path)
    }

    fn controller(endpoint: &BackendEndpoint, path: &str) -> String {
        format!("{}{}", endpoint.controller_api.trim_end_matches('/'), path)
    }

    /// Retry `op` while it fails with a transient error and the budget lasts
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_secs(2))
            .with_max_elapsed_time(Some(Duration::from_millis(self.config.retry_budget_ms)))
            .build();

        backoff::future::retry_notify(
            policy,
            || {
                let attempt = op();
                async move {
                    attempt.await.map_err(|e| {
                        if e.is_transient() {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |e: Error, wait: Duration| {
                warn!(operation, error = %e, retry_in_ms = wait.as_millis() as u64, "backend call failed, retrying");
            },
        )
        .await
    }

    /// Turn a non-success response into an error, keeping the body as detail
    async fn check(operation: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let reason = format!("HTTP {}: {}", status, body.trim());
        Err(match status {
            StatusCode::INSUFFICIENT_STORAGE => Error::ResourceExhausted(reason),
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
                Error::BackendUnavailable(reason)
            }
            _ => Error::backend(operation, reason),
        })
    }
}

#[async_trait]
impl BackendControl for JivaBackend {
    #[instrument(skip(self, request), fields(volume = %request.name))]
    async fn provision(&self, request: &ProvisionRequest) -> Result<BackendEndpoint> {
        let url = self.management("/latest/volumes");
        let endpoint: BackendEndpoint = self
            .with_retry("provision", || async {
                let response = self.client.post(&url).json(request).send().await?;
                let response = Self::check("provision", response).await?;
                response
                    .json::<BackendEndpoint>()
                    .await
                    .map_err(|e| Error::backend("provision", e))
            })
            .await?;

        info!(
            controller = %endpoint.controller_api,
            iqn = %endpoint.iqn,
            replicas = request.replica_count,
            "Jiva volume provisioned"
        );
        Ok(endpoint)
    }

    #[instrument(skip(self))]
    async fn teardown(&self, name: &str) -> Result<()> {
        let url = self.management(&format!("/latest/volumes/{}", urlencoding::encode(name)));
        self.with_retry("teardown", || async {
            let response = self.client.delete(&url).send().await?;
            match response.status() {
                StatusCode::NOT_FOUND => {
                    debug!("volume already removed from backend");
                    Ok(())
                }
                StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                    let body = response.text().await.unwrap_or_default();
                    Err(Error::DetachRefused {
                        volume_id: name.to_string(),
                        reason: body.trim().to_string(),
                    })
                }
                _ => Self::check("teardown", response).await.map(|_| ()),
            }
        })
        .await?;

        info!("Jiva volume torn down");
        Ok(())
    }

    async fn replica_status(&self, endpoint: &BackendEndpoint) -> Result<ReplicaStatusSnapshot> {
        let replicas_url = Self::controller(endpoint, "/v1/replicas");
        let volumes_url = Self::controller(endpoint, "/v1/volumes");

        let replicas: Collection<ReplicaResource> = {
            let response = self.client.get(&replicas_url).send().await?;
            Self::check("replica status", response)
                .await?
                .json()
                .await
                .map_err(|e| Error::backend("replica status", e))?
        };
        let volumes: Collection<VolumeResource> = {
            let response = self.client.get(&volumes_url).send().await?;
            Self::check("volume status", response)
                .await?
                .json()
                .await
                .map_err(|e| Error::backend("volume status", e))?
        };

        let (controller_quorum, controller_size_bytes) = match volumes.data.first() {
            Some(volume) => (!volume.read_only, parse_size(&volume.size)),
            None => (false, 0),
        };

        Ok(ReplicaStatusSnapshot {
            replicas: replicas
                .data
                .into_iter()
                .map(|r| ReplicaStatus {
                    health: replica_health(&r.mode),
                    size_bytes: parse_size(&r.size),
                    address: r.address,
                })
                .collect(),
            controller_quorum,
            controller_size_bytes,
        })
    }

    #[instrument(skip(self, endpoint))]
    async fn resize(&self, endpoint: &BackendEndpoint, name: &str, size_bytes: u64) -> Result<()> {
        let url = Self::controller(
            endpoint,
            &format!("/v1/volumes/{}?action=resize", urlencoding::encode(name)),
        );
        let input = ResizeInput {
            size: size_bytes.to_string(),
        };
        self.with_retry("resize", || async {
            let response = self.client.post(&url).json(&input).send().await?;
            Self::check("resize", response).await.map(|_| ())
        })
        .await?;

        info!(size_bytes, "Jiva volume resize requested");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let response = self.client.get(self.management("/latest")).send().await;
        Ok(matches!(response, Ok(r) if r.status().is_success()))
    }

    fn backend_name(&self) -> &str {
        "jiva"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{delete, get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Calls {
        provisions: AtomicUsize,
        resizes: AtomicUsize,
    }

    async fn serve(calls: Arc<Calls>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base = format!("http://{}", addr);
        let controller_api = base.clone();

        let app = Router::new()
            .route(
                "/latest/volumes",
                post(
                    move |State(calls): State<Arc<Calls>>, Json(body): Json<Value>| {
                        let controller_api = controller_api.clone();
                        async move {
                            calls.provisions.fetch_add(1, Ordering::SeqCst);
                            if body["capacityBytes"].as_u64() > Some(1 << 40) {
                                return (AxumStatus::INSUFFICIENT_STORAGE, Json(json!({})));
                            }
                            let name = body["name"].as_str().unwrap_or_default().to_string();
                            (
                                AxumStatus::OK,
                                Json(json!({
                                    "controllerApi": controller_api,
                                    "targetPortal": "10.0.0.5:3260",
                                    "iqn": format!("iqn.2016-09.com.openebs.jiva:{}", name),
                                    "lun": 0
                                })),
                            )
                        }
                    },
                ),
            )
            .route(
                "/latest/volumes/:name",
                delete(|Path(name): Path<String>| async move {
                    match name.as_str() {
                        "busy" => (AxumStatus::CONFLICT, "target has connected initiators"),
                        "gone" => (AxumStatus::NOT_FOUND, "not found"),
                        _ => (AxumStatus::OK, ""),
                    }
                }),
            )
            .route(
                "/v1/replicas",
                get(|| async {
                    Json(json!({"data": [
                        {"address": "tcp://10.0.1.1:9502", "mode": "RW", "size": "1073741824"},
                        {"address": "tcp://10.0.1.2:9502", "mode": "RW", "size": "1073741824"},
                        {"address": "tcp://10.0.1.3:9502", "mode": "ERR", "size": "0"}
                    ]}))
                }),
            )
            .route(
                "/v1/volumes",
                get(|| async {
                    Json(json!({"data": [{"name": "v1", "readOnly": false, "size": "1073741824"}]}))
                }),
            )
            .route(
                "/v1/volumes/:name",
                post(
                    |State(calls): State<Arc<Calls>>,
                     Query(query): Query<HashMap<String, String>>,
                     Json(body): Json<Value>| async move {
                        if query.get("action").map(String::as_str) != Some("resize")
                            || body["size"].as_str().is_none()
                        {
                            return AxumStatus::BAD_REQUEST;
                        }
                        calls.resizes.fetch_add(1, Ordering::SeqCst);
                        AxumStatus::OK
                    },
                ),
            )
            .with_state(calls);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    fn backend(base: &str) -> JivaBackend {
        JivaBackend::new(JivaBackendConfig {
            management_url: base.to_string(),
            request_timeout_secs: 5,
            retry_budget_ms: 200,
        })
        .unwrap()
    }

    fn request(name: &str, capacity_bytes: u64) -> ProvisionRequest {
        ProvisionRequest {
            name: name.to_string(),
            capacity_bytes,
            replica_count: 3,
            parameters: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_provision_returns_endpoint() {
        let calls = Arc::new(Calls::default());
        let base = serve(calls.clone()).await;

        let endpoint = backend(&base).provision(&request("v1", 1 << 30)).await.unwrap();
        assert_eq!(endpoint.controller_api, base);
        assert_eq!(endpoint.iqn, "iqn.2016-09.com.openebs.jiva:v1");
        assert_eq!(calls.provisions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provision_out_of_capacity() {
        let calls = Arc::new(Calls::default());
        let base = serve(calls.clone()).await;

        let err = backend(&base)
            .provision(&request("huge", 1 << 41))
            .await
            .unwrap_err();
        assert_matches!(err, Error::ResourceExhausted(_));
        // Not transient, so not retried
        assert_eq!(calls.provisions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_teardown_statuses() {
        let base = serve(Arc::new(Calls::default())).await;
        let backend = backend(&base);

        backend.teardown("v1").await.unwrap();
        backend.teardown("gone").await.unwrap();
        let err = backend.teardown("busy").await.unwrap_err();
        assert_matches!(err, Error::DetachRefused { volume_id, .. } if volume_id == "busy");
    }

    #[tokio::test]
    async fn test_replica_status_snapshot() {
        let base = serve(Arc::new(Calls::default())).await;
        let backend = backend(&base);
        let endpoint = backend.provision(&request("v1", 1 << 30)).await.unwrap();

        let snapshot = backend.replica_status(&endpoint).await.unwrap();
        assert_eq!(snapshot.replicas.len(), 3);
        assert_eq!(snapshot.healthy_count(), 2);
        assert_eq!(snapshot.replicas[2].health, ReplicaHealth::Unreachable);
        assert!(snapshot.controller_quorum);
        assert_eq!(snapshot.controller_size_bytes, 1 << 30);
    }

    #[tokio::test]
    async fn test_resize_posts_action() {
        let calls = Arc::new(Calls::default());
        let base = serve(calls.clone()).await;
        let backend = backend(&base);
        let endpoint = backend.provision(&request("v1", 1 << 30)).await.unwrap();

        backend.resize(&endpoint, "v1", 2 << 30).await.unwrap();
        assert_eq!(calls.resizes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_controller_is_unavailable() {
        let backend = backend("http://127.0.0.1:1");
        let endpoint = BackendEndpoint {
            controller_api: "http://127.0.0.1:1".into(),
            target_portal: "127.0.0.1:3260".into(),
            iqn: "iqn.test".into(),
            lun: 0,
        };
        let err = backend.replica_status(&endpoint).await.unwrap_err();
        assert_eq!(err.code(), crate::error::Code::Unavailable);
        assert!(!backend.health_check().await.unwrap());
    }

    #[test]
    fn test_replica_modes() {
        assert_eq!(replica_health("RW"), ReplicaHealth::Healthy);
        assert_eq!(replica_health("WO"), ReplicaHealth::Degraded);
        assert_eq!(replica_health("ERR"), ReplicaHealth::Unreachable);
        assert_eq!(parse_size("garbage"), 0);
    }
}
