// dpmp-proxy — dual-pool Stratum v1 mining proxy.
//
// Core: upstream sessions, downstream sessions, scheduler, router.
// Surface: Stratum listener, /metrics exporter, read-only status API.

use std::sync::Arc;

use axum::{extract::State, http::{header, StatusCode}, response::IntoResponse, routing::get, Json};
use dpmp_proxy::config::Config;
use dpmp_proxy::metrics::prometheus as metrics;
use dpmp_proxy::supervisor::Supervisor;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct ApiState {
    supervisor: Arc<Supervisor>,
}

async fn api_health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn api_status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let snapshot = state.supervisor.status().await;
    Json(serde_json::to_value(snapshot).unwrap_or_else(|e| json!({"error": e.to_string()})))
}

async fn api_metrics() -> impl IntoResponse {
    let body = metrics::render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DPMP_CONFIG").ok())
        .unwrap_or_else(|| "dpmp.json".to_string());

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("config rejected: {:#}", e);
            std::process::exit(2);
        }
    };

    info!(
        "dpmp-proxy {} starting (pool A {}:{}, pool B {}:{})",
        env!("CARGO_PKG_VERSION"),
        config.pool_a.host,
        config.pool_a.port,
        config.pool_b.host,
        config.pool_b.port,
    );

    let metrics_bind = config.metrics.bind.clone();
    let status_bind = config.status.bind.clone();

    let supervisor = Supervisor::new(config);
    supervisor.start().await?;

    // Metrics exporter.
    {
        let app = axum::Router::new().route("/metrics", get(api_metrics));
        let listener = tokio::net::TcpListener::bind(&metrics_bind).await?;
        info!("metrics on http://{}/metrics", listener.local_addr()?);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("metrics server failed: {}", e);
            }
        });
    }

    // Read-only status API for the dashboard.
    {
        let state = ApiState { supervisor: supervisor.clone() };
        let app = axum::Router::new()
            .route("/healthz", get(api_health))
            .route("/api/v1/status", get(api_status))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind(&status_bind).await?;
        info!("status API on http://{}/api/v1/status", listener.local_addr()?);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("status server failed: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    supervisor.shutdown();
    // Give sessions a moment to finish in-flight writes and drain.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    info!("bye");
    Ok(())
}
