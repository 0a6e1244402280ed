// HTTP API: scenario routes

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::scenario::ScenarioService;

pub mod auth;
pub mod scenario;

pub use auth::{Requester, Role};

#[derive(Clone)]
pub struct AppState {
    pub scenarios: Arc<ScenarioService>,
}

/// Build the router, nesting every route under `base_path` when one is set
pub fn router(state: AppState, base_path: &str) -> Router {
    let routes = Router::new()
        .route(
            "/scenario",
            get(scenario::list_scenarios).post(scenario::create_scenario),
        )
        .route(
            "/scenario/:id",
            get(scenario::get_scenario).delete(scenario::delete_scenario),
        )
        .route("/scenario/:id/start", post(scenario::start_scenario))
        .route("/scenario/:id/result", get(scenario::download_result))
        .with_state(state);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let base_path = base_path.trim_end_matches('/');
    let app = if base_path.is_empty() {
        routes
    } else {
        Router::new().nest(base_path, routes)
    };

    app.layer(cors).layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` fires, then drain in-flight requests
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "HTTP API listening");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
