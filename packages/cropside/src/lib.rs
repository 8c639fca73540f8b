//! cropside server library: router assembly and shared application state.
//!
//! The binary in `main.rs` is a thin clap wrapper around [`build_router`];
//! integration tests drive the same router over a real listener.

use axum::{Router, routing::get};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use uuid::Uuid;

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod ws;

use cropside_core::{SessionRegistry, SignalingCoordinator, WorkspaceBroadcaster};
use metrics::ServerMetrics;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub broadcaster: Arc<WorkspaceBroadcaster>,
    pub coordinator: Arc<SignalingCoordinator>,
    pub metrics: Arc<ServerMetrics>,
}

impl AppState {
    /// Wire the coordination core together from resolved configuration.
    /// Background tasks (idle sweep, signaling maintenance) start here.
    pub fn new(config: &config::AppConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.registry.clone()));
        registry.spawn_idle_sweep();
        let broadcaster = Arc::new(WorkspaceBroadcaster::new(registry.clone()));
        let coordinator = Arc::new(SignalingCoordinator::new(
            registry.clone(),
            config.signaling.clone(),
        ));
        coordinator.spawn_maintenance();
        Self {
            registry,
            broadcaster,
            coordinator,
            metrics: Arc::new(ServerMetrics::new()),
        }
    }

    /// Stop background tasks and every per-session timer.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
        self.registry.shutdown();
    }
}

/// Custom span maker that adds a unique request ID to each incoming request.
#[derive(Clone)]
pub struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(handlers::health_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
