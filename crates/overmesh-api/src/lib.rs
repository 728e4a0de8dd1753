pub mod handlers;

use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// The full `/api` router with CORS applied.
pub fn app(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/handlers", get(handlers::handle_handlers))
        .route("/rendezvous", get(handlers::handle_rendezvous))
        .route("/rendezvous/connect", post(handlers::handle_connect))
        .route(
            "/rendezvous/{peer}/challenge",
            post(handlers::handle_challenge),
        )
        .route(
            "/rendezvous/{peer}",
            delete(handlers::handle_disconnect),
        )
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    serve_on(listener, state).await
}

/// Serve on an already-bound listener.
pub async fn serve_on(listener: TcpListener, state: ApiState) -> anyhow::Result<()> {
    axum::serve(listener, app(state)).await?;
    Ok(())
}
