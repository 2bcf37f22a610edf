//! RPC routes and handlers
//!
//! Each handler decodes its request, builds a [`CallContext`] from the
//! deadline header and the server's shutdown token, runs the service method
//! and records the outcome in [`Metrics`].

use crate::csi::types::{
    ControllerExpandVolumeRequest, ControllerPublishVolumeRequest,
    ControllerUnpublishVolumeRequest, CreateVolumeRequest, DeleteVolumeRequest,
    ListVolumesRequest, NodeExpandVolumeRequest, NodePublishVolumeRequest,
    NodeStageVolumeRequest, NodeUnpublishVolumeRequest, NodeUnstageVolumeRequest,
    ValidateVolumeCapabilitiesRequest,
};
use crate::csi::{CallContext, ControllerService, IdentityService, NodeService};
use crate::error::{Code, Error, Result};
use crate::metrics::Metrics;
use axum::{
    error_handling::HandleErrorLayer,
    extract::{rejection::JsonRejection, Json, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::timeout::{error::Elapsed, TimeoutLayer};
use tower::{BoxError, ServiceBuilder};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

/// Request header carrying the caller's remaining time budget
pub const DEADLINE_HEADER: &str = "x-csi-deadline-ms";

/// Time a handler keeps after its call deadline to roll back host state
/// before the server drops it
const CLEANUP_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Error Body
// =============================================================================

/// Error body returned with every non-2xx response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: Code,
    pub message: String,
}

impl RpcError {
    pub fn status(&self) -> StatusCode {
        match self.code {
            Code::Ok => StatusCode::OK,
            Code::InvalidArgument => StatusCode::BAD_REQUEST,
            Code::NotFound => StatusCode::NOT_FOUND,
            Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
            Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
            Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for RpcError {
    fn from(e: Error) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

// =============================================================================
// Router
// =============================================================================

/// Services this process serves; the identity service is always present
#[derive(Clone)]
pub struct Services {
    pub identity: Arc<IdentityService>,
    pub controller: Option<Arc<ControllerService>>,
    pub node: Option<Arc<NodeService>>,
}

/// Per-service handler state
struct Rpc<S> {
    service: Arc<S>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

impl<S> Clone for Rpc<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

impl<S> Rpc<S> {
    fn new(
        service: Arc<S>,
        metrics: &Arc<Metrics>,
        shutdown: &CancellationToken,
        request_timeout: Duration,
    ) -> Self {
        Self {
            service,
            metrics: metrics.clone(),
            shutdown: shutdown.clone(),
            request_timeout,
        }
    }

    /// Run one call and turn its result into a response
    async fn call<T, F, Fut>(&self, method: &'static str, headers: &HeaderMap, f: F) -> Response
    where
        T: Serialize,
        F: FnOnce(Arc<S>, CallContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = match call_context(headers, &self.shutdown, self.request_timeout) {
            Ok(ctx) => f(self.service.clone(), ctx).await,
            Err(e) => Err(e),
        };
        let elapsed = started.elapsed();

        match result {
            Ok(body) => {
                self.metrics.observe(method, Code::Ok, elapsed);
                debug!(method, elapsed_ms = elapsed.as_millis() as u64, "rpc ok");
                Json(body).into_response()
            }
            Err(e) => {
                let code = e.code();
                self.metrics.observe(method, code, elapsed);
                if code == Code::Internal {
                    error!(method, error = %e, "rpc failed");
                } else {
                    warn!(method, code = %code, error = %e, "rpc failed");
                }
                RpcError::from(e).into_response()
            }
        }
    }
}

/// Build the router for `services`. Routes of services this process does
/// not run are absent and answer 404.
pub fn build_router(
    services: Services,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    request_timeout: Duration,
) -> Router {
    let mut router = Router::new()
        .route("/csi.v1.Identity/GetPluginInfo", post(get_plugin_info))
        .route("/csi.v1.Identity/GetPluginCapabilities", post(get_plugin_capabilities))
        .route("/csi.v1.Identity/Probe", post(probe))
        .with_state(Rpc::new(services.identity, &metrics, &shutdown, request_timeout));

    if let Some(controller) = services.controller {
        let controller_routes = Router::new()
            .route("/csi.v1.Controller/CreateVolume", post(create_volume))
            .route("/csi.v1.Controller/DeleteVolume", post(delete_volume))
            .route("/csi.v1.Controller/ControllerPublishVolume", post(controller_publish_volume))
            .route("/csi.v1.Controller/ControllerUnpublishVolume", post(controller_unpublish_volume))
            .route("/csi.v1.Controller/ControllerExpandVolume", post(controller_expand_volume))
            .route("/csi.v1.Controller/ListVolumes", post(list_volumes))
            .route("/csi.v1.Controller/ValidateVolumeCapabilities", post(validate_volume_capabilities))
            .route("/csi.v1.Controller/ControllerGetCapabilities", post(controller_get_capabilities))
            .with_state(Rpc::new(controller, &metrics, &shutdown, request_timeout));
        router = router.merge(controller_routes);
    }

    if let Some(node) = services.node {
        let node_routes = Router::new()
            .route("/csi.v1.Node/NodeStageVolume", post(node_stage_volume))
            .route("/csi.v1.Node/NodeUnstageVolume", post(node_unstage_volume))
            .route("/csi.v1.Node/NodePublishVolume", post(node_publish_volume))
            .route("/csi.v1.Node/NodeUnpublishVolume", post(node_unpublish_volume))
            .route("/csi.v1.Node/NodeExpandVolume", post(node_expand_volume))
            .route("/csi.v1.Node/NodeGetCapabilities", post(node_get_capabilities))
            .route("/csi.v1.Node/NodeGetInfo", post(node_get_info))
            .with_state(Rpc::new(node, &metrics, &shutdown, request_timeout));
        router = router.merge(node_routes);
    }

    // Handlers stop at their call deadline; the hard timeout only catches
    // one stuck in rollback
    router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(HandleErrorLayer::new(handle_layer_error))
            .layer(TimeoutLayer::new(request_timeout + CLEANUP_GRACE)),
    )
}

async fn handle_layer_error(err: BoxError) -> RpcError {
    if err.is::<Elapsed>() {
        warn!("request dropped after its deadline");
        RpcError {
            code: Code::DeadlineExceeded,
            message: "request timed out".to_string(),
        }
    } else {
        error!(error = %err, "request failed in middleware");
        RpcError {
            code: Code::Internal,
            message: err.to_string(),
        }
    }
}

/// Call context bound to the deadline header, the server's request timeout
/// and its shutdown
fn call_context(
    headers: &HeaderMap,
    shutdown: &CancellationToken,
    request_timeout: Duration,
) -> Result<CallContext> {
    let ctx = CallContext::with_timeout(request_timeout).with_cancel(shutdown.child_token());
    let raw = match headers.get(DEADLINE_HEADER) {
        Some(raw) => raw,
        None => return Ok(ctx),
    };
    let millis: u64 = raw
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| Error::InvalidArgument(format!("invalid {} header", DEADLINE_HEADER)))?;
    Ok(CallContext {
        deadline: Some(ctx.deadline_within(Duration::from_millis(millis))),
        ..ctx
    })
}

/// Decode a request body, reporting malformed JSON as InvalidArgument
fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(req)| req)
        .map_err(|e| Error::InvalidArgument(format!("malformed request: {}", e.body_text())))
}

// =============================================================================
// Identity
// =============================================================================

async fn get_plugin_info(State(rpc): State<Rpc<IdentityService>>, headers: HeaderMap) -> Response {
    rpc.call("GetPluginInfo", &headers, |svc, _ctx| async move {
        svc.get_plugin_info().await
    })
    .await
}

async fn get_plugin_capabilities(State(rpc): State<Rpc<IdentityService>>, headers: HeaderMap) -> Response {
    rpc.call("GetPluginCapabilities", &headers, |svc, _ctx| async move {
        svc.get_plugin_capabilities().await
    })
    .await
}

async fn probe(State(rpc): State<Rpc<IdentityService>>, headers: HeaderMap) -> Response {
    rpc.call("Probe", &headers, |svc, _ctx| async move { svc.probe().await })
        .await
}

// =============================================================================
// Controller
// =============================================================================

async fn create_volume(
    State(rpc): State<Rpc<ControllerService>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<CreateVolumeRequest>, JsonRejection>,
) -> Response {
    rpc.call("CreateVolume", &headers, |svc, ctx| async move {
        svc.create_volume(&ctx, body(payload)?).await
    })
    .await
}

async fn delete_volume(
    State(rpc): State<Rpc<ControllerService>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<DeleteVolumeRequest>, JsonRejection>,
) -> Response {
    rpc.call("DeleteVolume", &headers, |svc, ctx| async move {
        svc.delete_volume(&ctx, body(payload)?).await
    })
    .await
}

async fn controller_publish_volume(
    State(rpc): State<Rpc<ControllerService>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<ControllerPublishVolumeRequest>, JsonRejection>,
) -> Response {
    rpc.call("ControllerPublishVolume", &headers, |svc, ctx| async move {
        svc.controller_publish_volume(&ctx, body(payload)?).await
    })
    .await
}

async fn controller_unpublish_volume(
    State(rpc): State<Rpc<ControllerService>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<ControllerUnpublishVolumeRequest>, JsonRejection>,
) -> Response {
    rpc.call("ControllerUnpublishVolume", &headers, |svc, ctx| async move {
        svc.controller_unpublish_volume(&ctx, body(payload)?).await
    })
    .await
}

async fn controller_expand_volume(
    State(rpc): State<Rpc<ControllerService>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<ControllerExpandVolumeRequest>, JsonRejection>,
) -> Response {
    rpc.call("ControllerExpandVolume", &headers, |svc, ctx| async move {
        svc.controller_expand_volume(&ctx, body(payload)?).await
    })
    .await
}

async fn list_volumes(
    State(rpc): State<Rpc<ControllerService>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<ListVolumesRequest>, JsonRejection>,
) -> Response {
    rpc.call("ListVolumes", &headers, |svc, _ctx| async move {
        svc.list_volumes(body(payload)?).await
    })
    .await
}

async fn validate_volume_capabilities(
    State(rpc): State<Rpc<ControllerService>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<ValidateVolumeCapabilitiesRequest>, JsonRejection>,
) -> Response {
    rpc.call("ValidateVolumeCapabilities", &headers, |svc, _ctx| async move {
        svc.validate_volume_capabilities(body(payload)?).await
    })
    .await
}

async fn controller_get_capabilities(
    State(rpc): State<Rpc<ControllerService>>,
    headers: HeaderMap,
) -> Response {
    rpc.call("ControllerGetCapabilities", &headers, |svc, _ctx| async move {
        Ok(svc.controller_get_capabilities())
    })
    .await
}

// =============================================================================
// Node
// =============================================================================

async fn node_stage_volume(
    State(rpc): State<Rpc<NodeService>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<NodeStageVolumeRequest>, JsonRejection>,
) -> Response {
    rpc.call("NodeStageVolume", &headers, |svc, ctx| async move {
        svc.node_stage_volume(&ctx, body(payload)?).await
    })
    .await
}

async fn node_unstage_volume(
    State(rpc): State<Rpc<NodeService>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<NodeUnstageVolumeRequest>, JsonRejection>,
) -> Response {
    rpc.call("NodeUnstageVolume", &headers, |svc, ctx| async move {
        svc.node_unstage_volume(&ctx, body(payload)?).await
    })
    .await
}

async fn node_publish_volume(
    State(rpc): State<Rpc<NodeService>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<NodePublishVolumeRequest>, JsonRejection>,
) -> Response {
    rpc.call("NodePublishVolume", &headers, |svc, ctx| async move {
        svc.node_publish_volume(&ctx, body(payload)?).await
    })
    .await
}

async fn node_unpublish_volume(
    State(rpc): State<Rpc<NodeService>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<NodeUnpublishVolumeRequest>, JsonRejection>,
) -> Response {
    rpc.call("NodeUnpublishVolume", &headers, |svc, ctx| async move {
        svc.node_unpublish_volume(&ctx, body(payload)?).await
    })
    .await
}

async fn node_expand_volume(
    State(rpc): State<Rpc<NodeService>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<NodeExpandVolumeRequest>, JsonRejection>,
) -> Response {
    rpc.call("NodeExpandVolume", &headers, |svc, ctx| async move {
        svc.node_expand_volume(&ctx, body(payload)?).await
    })
    .await
}

async fn node_get_capabilities(State(rpc): State<Rpc<NodeService>>, headers: HeaderMap) -> Response {
    rpc.call("NodeGetCapabilities", &headers, |svc, _ctx| async move {
        Ok(svc.node_get_capabilities())
    })
    .await
}

async fn node_get_info(State(rpc): State<Rpc<NodeService>>, headers: HeaderMap) -> Response {
    rpc.call("NodeGetInfo", &headers, |svc, _ctx| async move {
        Ok(svc.node_get_info())
    })
    .await
}
