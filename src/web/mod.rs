//! Management HTTP API (§6): the controller's user-facing surface, plus the
//! catch-all lazy-start proxy fallback. Grounded on the teacher's
//! `router/mod.rs` layering — versioned route groups, a shared `AppState`,
//! CORS/trace middleware, a bearer-auth layer over the authenticated
//! surface — generalized from "panel + client API" to this spec's single
//! Management API plus the lazy-start fallback.

pub mod applications;
pub mod auth;
pub mod database;
pub mod functions;
pub mod health;
pub mod logs;
pub mod scheduler;
pub mod settings;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::blob::BlobStore;
use crate::config::Configuration;
use crate::db::{Db, DynamicDb};
use crate::orchestrator::Orchestrator;
use crate::proxy::LazyStartProxy;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Db>,
    pub dynamic_db: Arc<DynamicDb>,
    pub blob: Arc<BlobStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Arc<Scheduler>,
    pub lazy_proxy: Arc<LazyStartProxy>,
    pub config: Arc<Configuration>,
    pub http_client: reqwest::Client,
}

pub fn build_router(state: AppState) -> Router {
    let management = Router::new()
        .route("/applications/create", post(applications::create))
        .route("/applications/start", post(applications::start))
        .route("/applications/stop", post(applications::stop))
        .route("/applications/restart", post(applications::restart))
        .route("/applications/delete", post(applications::delete))
        .route("/applications/data", post(applications::data))
        .route(
            "/applications/update_description",
            post(applications::update_description),
        )
        .route(
            "/applications/update_dependencies",
            post(applications::update_dependencies),
        )
        .route("/function/create", post(functions::create))
        .route("/function/update_code", post(functions::update_code))
        .route("/function/delete", post(functions::delete))
        .route("/function/proxy_test", post(functions::proxy_test))
        .route("/settings/env_add", post(settings::env_add))
        .route("/settings/env_remove", post(settings::env_remove))
        .route("/settings/cors_update", post(settings::cors_update))
        .route("/settings/notification_update", post(settings::notification_update))
        .route("/settings/ai_config_update", post(settings::ai_config_update))
        .route("/scheduler/get", post(scheduler::get))
        .route("/scheduler/upsert", post(scheduler::upsert))
        .route("/scheduler/delete", post(scheduler::delete))
        .route("/scheduler/trigger", post(scheduler::trigger))
        .route("/database/collections", post(database::collections))
        .route("/database/create_collection", post(database::create_collection))
        .route("/database/documents", post(database::documents))
        .route("/database/insert_document", post(database::insert_document))
        .route("/database/clear_collection", post(database::clear_collection))
        .route("/database/delete_collection", post(database::delete_collection))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_bearer));

    // Unauthenticated by bearer: the liveness probe, and the WS log stream
    // which uses its own short-lived JWT (§6, §4.5).
    let public = Router::new()
        .route("/__server_health__", get(health::server_health))
        .route("/logs/websocket_logs/:app_id", get(logs::websocket_logs));

    Router::new()
        .merge(management)
        .merge(public)
        .fallback(catch_all)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `ANY /{path:path}` (§4.3, §6): the lazy-start proxy fallback. Only ever
/// reached for hosts the reverse proxy doesn't yet have a direct route for
/// — steady-state traffic resolves at the proxy layer and never lands here.
async fn catch_all(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    state
        .lazy_proxy
        .handle(&host, method, &path_and_query, headers, body)
        .await
}
