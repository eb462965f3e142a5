pub mod aggregate;
pub mod api;
pub mod config;
pub mod error;
pub mod hub;
pub mod profile;
pub mod registry;
pub mod supervisor;
pub mod upstream;
pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope};
use crate::registry::SessionRegistry;
use crate::upstream::UpstreamSource;

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// State shared by the HTTP and WebSocket surfaces.
pub struct AppState<S: UpstreamSource> {
    pub registry: Arc<SessionRegistry<S>>,
    pub admin_secret: Arc<str>,
    pub started_at: DateTime<Utc>,
}

impl<S: UpstreamSource> AppState<S> {
    pub fn new(registry: Arc<SessionRegistry<S>>, admin_secret: impl AsRef<str>) -> Self {
        Self { registry, admin_secret: Arc::from(admin_secret.as_ref()), started_at: Utc::now() }
    }
}

impl<S: UpstreamSource> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            admin_secret: Arc::clone(&self.admin_secret),
            started_at: self.started_at,
        }
    }
}

pub fn build_router<S: UpstreamSource>(state: AppState<S>) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(ws::router(state.clone()))
            .merge(api::router(state)),
    )
}

pub fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
