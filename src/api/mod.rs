//! HTTP API
//!
//! Routes under `/api/v1`, Swagger UI at `/docs`. The server stops accepting
//! connections when the shutdown signal flips and drains in-flight requests.

pub mod handlers;
pub mod openapi;
pub mod state;
pub mod types;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::ApiConfig;
pub use state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/orders", post(handlers::create_order))
        .route("/orders/{order_ref}", get(handlers::get_order))
        .route("/orders/{order_ref}/cancel", post(handlers::cancel_order))
        .route("/orders/{order_ref}/refund", post(handlers::refund_order))
        .route("/deposits", post(handlers::create_deposit))
        .route("/deposits/{deposit_ref}", get(handlers::get_deposit))
        .route(
            "/products/{id}/stock",
            get(handlers::get_stock).post(handlers::import_stock),
        )
        .route("/callbacks/payment", post(handlers::payment_callback));

    Router::new()
        .nest("/api/v1", api)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()))
}

/// Bind and serve until `shutdown` flips to true
pub async fn serve(
    config: &ApiConfig,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!(%addr, "API listening");
    info!("API docs: http://{}/docs", addr);
    if state.admin_token.is_none() {
        info!("No admin token configured, admin endpoints disabled");
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("API shutting down");
        })
        .await
}
