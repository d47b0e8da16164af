//! HTTP API Server
//!
//! REST API for pool management, the node directory and mesh lifecycle.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::allocator::{AddressAssignment, AddressPool, PoolStatus};
use crate::config::ApiConfig;
use crate::control::{ControlPlane, NodeRemoval, NodeView};
use crate::error::{Error, Result};
use crate::mesh::{InterfaceSpec, MeshView};
use crate::node::{NodeRegistration, NodeUpdate};
use crate::orchestrator::{
    ApplyReport, CreateMeshRequest, MeshStatusReport, RemovalReport, UpdateMembersRequest,
};

/// Shared application state
pub struct AppState {
    pub control: Arc<ControlPlane>,
    pub started_at: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, control: Arc<ControlPlane>) -> Self {
        let state = Arc::new(AppState {
            control,
            started_at: Instant::now(),
        });
        Self { config, state }
    }

    /// Build the router with tracing and optional CORS
    pub fn router(&self) -> Router {
        let router = create_router(Arc::clone(&self.state)).layer(TraceLayer::new_for_http());
        if self.config.cors_enabled {
            router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

/// Create the router
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        // Address pool
        .route(
            "/pool",
            post(handle_create_pool)
                .get(handle_get_pool)
                .delete(handle_delete_pool),
        )
        .route("/pool/status", get(handle_pool_status))
        .route("/pool/assignments", get(handle_list_assignments))
        .route(
            "/pool/assignments/:node_id",
            put(handle_assign).delete(handle_release),
        )
        // Node directory
        .route("/nodes", post(handle_register_node).get(handle_list_nodes))
        .route(
            "/nodes/:id",
            get(handle_get_node)
                .put(handle_update_node)
                .delete(handle_delete_node),
        )
        // Meshes
        .route("/meshes", post(handle_create_mesh).get(handle_list_meshes))
        .route("/meshes/:id", get(handle_get_mesh).delete(handle_delete_mesh))
        .route("/meshes/:id/apply", post(handle_apply))
        .route("/meshes/:id/status", get(handle_mesh_status))
        .route("/meshes/:id/rotate-keys", post(handle_rotate_keys))
        .route("/meshes/:id/members", put(handle_update_members))
        .route("/meshes/:id/config/:node_id", get(handle_render_config))
        .with_state(state)
}

// ============ Request/Response Types ============

/// Pool creation request
#[derive(Debug, Deserialize, Serialize)]
pub struct CreatePoolRequest {
    pub cidr: String,
    #[serde(default)]
    pub description: String,
}

/// Manual address assignment; an empty body allocates the next free address
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AssignRequest {
    #[serde(default)]
    pub address: Option<Ipv4Addr>,
}

/// Release response
#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub released: Option<AddressAssignment>,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
    pub uptime_seconds: u64,
    pub pool: Option<String>,
    pub nodes: usize,
    pub meshes: usize,
}

/// Rendered config query
#[derive(Debug, Default, Deserialize)]
pub struct ConfigQuery {
    /// `json` (default) or `text`
    #[serde(default)]
    pub format: Option<String>,
    /// Include the private key instead of redacting it
    #[serde(default)]
    pub reveal: bool,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    /// Per-node failures of a partial apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failures: Option<BTreeMap<String, String>>,
}

/// Apply that did not fully succeed
#[derive(Debug, Serialize, Deserialize)]
pub struct ApplyErrorResponse {
    #[serde(flatten)]
    pub error: ErrorResponse,
    pub report: ApplyReport,
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        e if e.is_agent_failure() => StatusCode::BAD_GATEWAY,
        Error::PartialApplyFailure { .. } => StatusCode::BAD_GATEWAY,
        Error::PoolNotFound | Error::NodeNotFound(_) | Error::MeshNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        Error::PoolConflict { .. }
        | Error::PoolExhausted(_)
        | Error::PoolInUse(_)
        | Error::AddressInUse { .. }
        | Error::NodeExists(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        let failures = match err {
            Error::PartialApplyFailure { failures } => Some(failures.clone()),
            _ => None,
        };
        Self {
            error: err.to_string(),
            code: err.code().to_string(),
            failures,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(ErrorResponse::from(&self))).into_response()
    }
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let control = &state.control;
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        pool: control.allocator().pool().await.map(|p| p.cidr.to_string()),
        nodes: control.nodes().list().await.len(),
        meshes: control.orchestrator().list().await.len(),
    })
}

async fn handle_create_pool(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreatePoolRequest>,
) -> Result<Json<AddressPool>> {
    let pool = state
        .control
        .allocator()
        .get_or_create_pool(&req.cidr, &req.description)
        .await?;
    Ok(Json(pool))
}

async fn handle_get_pool(State(state): State<Arc<AppState>>) -> Result<Json<AddressPool>> {
    Ok(Json(state.control.allocator().require_pool().await?))
}

async fn handle_delete_pool(State(state): State<Arc<AppState>>) -> Result<Json<AddressPool>> {
    Ok(Json(state.control.allocator().delete_pool().await?))
}

async fn handle_pool_status(State(state): State<Arc<AppState>>) -> Result<Json<PoolStatus>> {
    Ok(Json(state.control.allocator().status().await?))
}

async fn handle_list_assignments(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<AddressAssignment>> {
    Json(state.control.allocator().list().await)
}

async fn handle_assign(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    body: Bytes,
) -> Result<Json<AddressAssignment>> {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        AssignRequest::default()
    } else {
        serde_json::from_slice::<AssignRequest>(&body)
            .map_err(|e| Error::InvalidArgument(format!("invalid assignment request: {}", e)))?
    };
    Ok(Json(state.control.assign(&node_id, req.address).await?))
}

async fn handle_release(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> Result<Json<ReleaseResponse>> {
    let released = state.control.release(&node_id).await?;
    Ok(Json(ReleaseResponse { released }))
}

async fn handle_register_node(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NodeRegistration>,
) -> Result<(StatusCode, Json<NodeView>)> {
    let view = state.control.register_node(req).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn handle_list_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<NodeView>> {
    Json(state.control.list_nodes().await)
}

async fn handle_get_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<NodeView>> {
    Ok(Json(state.control.node(&id).await?))
}

async fn handle_update_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<NodeUpdate>,
) -> Result<Json<NodeView>> {
    Ok(Json(state.control.update_node(&id, update).await?))
}

async fn handle_delete_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<NodeRemoval>> {
    Ok(Json(state.control.delete_node(&id).await?))
}

async fn handle_create_mesh(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateMeshRequest>,
) -> Result<(StatusCode, Json<MeshView>)> {
    let mesh = state.control.orchestrator().create(req).await?;
    Ok((StatusCode::CREATED, Json(mesh.view())))
}

async fn handle_list_meshes(State(state): State<Arc<AppState>>) -> Json<Vec<MeshView>> {
    Json(state.control.orchestrator().views().await)
}

async fn handle_get_mesh(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<MeshView>> {
    Ok(Json(state.control.orchestrator().get(id).await?.view()))
}

async fn handle_delete_mesh(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RemovalReport>> {
    Ok(Json(state.control.orchestrator().delete(id).await?))
}

async fn handle_apply(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response> {
    let report = state.control.orchestrator().apply(id).await?;

    if report.discarded {
        let error = ErrorResponse {
            error: format!("Mesh {} changed while the apply was in flight", id),
            code: "APPLY_SUPERSEDED".to_string(),
            failures: None,
        };
        return Ok((StatusCode::CONFLICT, Json(ApplyErrorResponse { error, report })).into_response());
    }

    match report.failure() {
        Some(err) => {
            let error = ErrorResponse::from(&err);
            Ok((StatusCode::BAD_GATEWAY, Json(ApplyErrorResponse { error, report })).into_response())
        }
        None => Ok(Json(report).into_response()),
    }
}

async fn handle_mesh_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<MeshStatusReport>> {
    Ok(Json(state.control.orchestrator().status(id).await?))
}

async fn handle_rotate_keys(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<MeshView>> {
    Ok(Json(state.control.orchestrator().rotate_keys(id).await?.view()))
}

async fn handle_update_members(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateMembersRequest>,
) -> Result<Json<MeshView>> {
    Ok(Json(state.control.orchestrator().update_members(id, req).await?.view()))
}

async fn handle_render_config(
    State(state): State<Arc<AppState>>,
    Path((id, node_id)): Path<(Uuid, String)>,
    Query(query): Query<ConfigQuery>,
) -> Result<Response> {
    let spec = state.control.orchestrator().render_config(id, &node_id).await?;
    let spec: InterfaceSpec = if query.reveal { spec } else { spec.redacted() };

    match query.format.as_deref() {
        None | Some("json") => Ok(Json(spec).into_response()),
        Some("text") => Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            spec.to_config_string(),
        )
            .into_response()),
        Some(other) => Err(Error::InvalidArgument(format!(
            "unknown config format '{}' (expected json or text)",
            other
        ))),
    }
}
