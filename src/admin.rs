// Minimal status surface shared by both binaries: a health check and a
// Prometheus scrape endpoint. Ambient observability, not part of the
// arena's external interfaces; serving it is optional (port 0 skips it).

use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::metrics;

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "arena" }))
}

async fn metrics_handler() -> impl IntoResponse {
    let body = metrics::gather_metrics();
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

fn router() -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
}

/// Serve the admin router in the background. No-op if `port` is 0.
pub async fn serve(port: u16) {
    if port == 0 {
        info!("admin port disabled, skipping status server");
        return;
    }

    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr, error = %e, "failed to bind admin status server");
            return;
        }
    };
    info!(addr, "admin status server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router()).await {
            tracing::error!(error = %e, "admin status server exited");
        }
    });
}
