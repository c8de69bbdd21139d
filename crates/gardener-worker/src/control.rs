// SPDX-License-Identifier: Apache-2.0

//! Worker control HTTP surface: `/status` (HTML status page), `/alive`,
//! `/ready`, and an optional `/v2/worker?filename=...` debug hook. Served
//! on its own listen address, separate from the `/metrics` exposition the
//! `gardener-metrics` crate owns.

use std::net::SocketAddr;

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    routing::get,
};
use serde::Deserialize;

#[derive(Clone)]
pub struct StatusPage {
    pub version: &'static str,
    pub git_revision: &'static str,
    pub output_destination: String,
}

async fn status(State(page): State<StatusPage>) -> (StatusCode, axum::response::Html<String>) {
    let body = format!(
        "<html><body><h1>gardener-worker</h1>\
         <p>version: {}</p><p>git revision: {}</p>\
         <p>output destination: {}</p></body></html>",
        page.version, page.git_revision, page.output_destination,
    );
    (StatusCode::OK, axum::response::Html(body))
}

async fn alive() -> &'static str {
    "ok"
}

async fn ready() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct DebugQuery {
    filename: String,
}

async fn debug_worker(Query(query): Query<DebugQuery>) -> (StatusCode, String) {
    (
        StatusCode::NOT_IMPLEMENTED,
        format!("single-file debug run for {} is not wired up in this deployment", query.filename),
    )
}

/// Spawns the control surface on `addr`. The returned handle stays alive
/// for the process lifetime; shutdown happens via process exit, matching
/// `gardener-metrics::start_prometheus_server`'s own fire-and-forget
/// spawn.
pub fn spawn(addr: SocketAddr, page: StatusPage) {
    let app = Router::new()
        .route("/status", get(status))
        .route("/alive", get(alive))
        .route("/ready", get(ready))
        .route("/v2/worker", get(debug_worker))
        .with_state(page);

    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(%addr, error = %err, "control surface failed to bind");
                return;
            }
        };
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            tracing::error!(error = %err, "control surface server exited");
        }
    });
}
