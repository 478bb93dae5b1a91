//! HTTP surface: the `/api/v1` router and its handlers.
//!
//! Everything except `/health` sits behind the bearer-token middleware.
//! Handlers stay thin; the orchestration service does the work and the
//! crate error type renders the standard `{"error": {...}}` envelope.

pub mod auth;
pub mod ws;

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router, middleware};
use bytes::Bytes;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::service::{
    AuthContext, CreateSandboxRequest, CreateWarmPoolRequest, ExecuteRequestBody,
    InstallPackagesRequest, SandboxService, UpdateWarmPoolRequest,
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SandboxService>,
    pub metrics: Arc<Metrics>,
}

pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/sandboxes",
            axum::routing::post(create_sandbox).get(list_sandboxes),
        )
        .route(
            "/sandboxes/:id",
            get(get_sandbox).delete(terminate_sandbox),
        )
        .route("/sandboxes/:id/status", get(sandbox_status))
        .route("/sandboxes/:id/execute", axum::routing::post(execute))
        .route("/sandboxes/:id/stream", get(ws::stream))
        .route(
            "/sandboxes/:id/files",
            get(list_files).put(upload_file).delete(delete_file),
        )
        .route("/sandboxes/:id/files/content", get(download_file))
        .route(
            "/sandboxes/:id/packages",
            axum::routing::post(install_packages),
        )
        .route(
            "/warmpools",
            axum::routing::post(create_warm_pool).get(list_warm_pools),
        )
        .route(
            "/warmpools/:name",
            get(get_warm_pool)
                .patch(update_warm_pool)
                .delete(delete_warm_pool),
        )
        .route("/warmpools/:name/status", get(warm_pool_status))
        .route("/user", get(user_info))
        .route("/user/sandboxes", get(list_sandboxes))
        .route("/user/warmpools", get(list_warm_pools))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::authenticate,
        ));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", protected)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Deserialize)]
struct PathParam {
    path: String,
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

// ---- sandboxes ----

async fn create_sandbox(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateSandboxRequest>,
) -> Result<Response> {
    let view = state.service.create_sandbox(&auth, body).await?;
    Ok((StatusCode::CREATED, Json(view)).into_response())
}

async fn list_sandboxes(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(page): Query<Pagination>,
) -> Result<Response> {
    let view = state
        .service
        .list_sandboxes(&auth, page.limit, page.offset)
        .await?;
    Ok(Json(view).into_response())
}

async fn get_sandbox(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Response> {
    let view = state.service.get_sandbox(&auth, &id).await?;
    Ok(Json(view).into_response())
}

async fn terminate_sandbox(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Response> {
    state.service.terminate_sandbox(&auth, &id).await?;
    Ok(Json(serde_json::json!({"terminated": id})).into_response())
}

async fn sandbox_status(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Response> {
    let view = state.service.sandbox_status(&auth, &id).await?;
    Ok(Json(view).into_response())
}

async fn execute(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<ExecuteRequestBody>,
) -> Result<Response> {
    let view = state.service.execute(&auth, &id, body).await?;
    Ok(Json(view).into_response())
}

async fn install_packages(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<InstallPackagesRequest>,
) -> Result<Response> {
    let view = state.service.install_packages(&auth, &id, body).await?;
    Ok(Json(view).into_response())
}

// ---- files ----

async fn list_files(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(param): Query<PathParam>,
) -> Result<Response> {
    let files = state.service.list_files(&auth, &id, &param.path).await?;
    Ok(Json(serde_json::json!({"files": files})).into_response())
}

async fn download_file(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(param): Query<PathParam>,
) -> Result<Response> {
    let bytes = state.service.download_file(&auth, &id, &param.path).await?;
    Ok((
        [(
            axum::http::header::CONTENT_TYPE,
            "application/octet-stream",
        )],
        bytes,
    )
        .into_response())
}

async fn upload_file(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(param): Query<PathParam>,
    body: Bytes,
) -> Result<Response> {
    let info = state
        .service
        .upload_file(&auth, &id, &param.path, &body)
        .await?;
    Ok(Json(info).into_response())
}

async fn delete_file(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(param): Query<PathParam>,
) -> Result<Response> {
    state.service.delete_file(&auth, &id, &param.path).await?;
    Ok(Json(serde_json::json!({"deleted": param.path})).into_response())
}

// ---- warm pools ----

async fn create_warm_pool(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateWarmPoolRequest>,
) -> Result<Response> {
    let view = state.service.create_warm_pool(&auth, body).await?;
    Ok((StatusCode::CREATED, Json(view)).into_response())
}

async fn list_warm_pools(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(page): Query<Pagination>,
) -> Result<Response> {
    let view = state
        .service
        .list_warm_pools(&auth, page.limit, page.offset)
        .await?;
    Ok(Json(view).into_response())
}

async fn get_warm_pool(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<Response> {
    let view = state.service.get_warm_pool(&auth, &name).await?;
    Ok(Json(view).into_response())
}

async fn update_warm_pool(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
    Json(body): Json<UpdateWarmPoolRequest>,
) -> Result<Response> {
    let view = state.service.update_warm_pool(&auth, &name, body).await?;
    Ok(Json(view).into_response())
}

async fn delete_warm_pool(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<Response> {
    state.service.delete_warm_pool(&auth, &name).await?;
    Ok(Json(serde_json::json!({"deleted": name})).into_response())
}

async fn warm_pool_status(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<Response> {
    let view = state.service.get_warm_pool(&auth, &name).await?;
    Ok(Json(serde_json::json!({
        "name": view.name,
        "availablePods": view.available_pods,
        "assignedPods": view.assigned_pods,
        "pendingPods": view.pending_pods,
    }))
    .into_response())
}

// ---- user ----

async fn user_info(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response> {
    let user = state
        .service
        .store()
        .get_user(&auth.user_id)
        .await?
        .ok_or_else(|| Error::not_found("user", &auth.user_id))?;
    Ok(Json(serde_json::json!({
        "id": user.id,
        "username": user.username,
        "permissions": auth.key.permissions,
    }))
    .into_response())
}
