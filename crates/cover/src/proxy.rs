//! A minimal JSON-RPC 2.0 endpoint fronting the intercepting provider.
//!
//! The test runner is pointed at this endpoint instead of the real node, so
//! its traffic flows through [`CoverInterceptor`] and every transaction it
//! produces gets traced.

use axum::{extract::State, routing::post, Json, Router};
use eyre::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use solcov_coverage::{CoverInterceptor, RpcProvider};
use std::{net::SocketAddr, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Binds the proxy on `127.0.0.1:port` (0 picks a free port) and serves it
/// in the background.
pub async fn serve(
    provider: Arc<CoverInterceptor>,
    port: u16,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let app = Router::new().route("/", post(handle)).with_state(provider);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(%err, "proxy server stopped");
        }
    });
    Ok((addr, server))
}

async fn handle(
    State(provider): State<Arc<CoverInterceptor>>,
    Json(request): Json<Value>,
) -> Json<Value> {
    let request: RpcRequest = match serde_json::from_value(request) {
        Ok(request) => request,
        Err(err) => {
            return Json(json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": { "code": -32600, "message": format!("invalid request: {err}") },
            }));
        }
    };

    debug!(method = %request.method, "proxying request");
    match provider.request(&request.method, request.params).await {
        Ok(result) => Json(json!({ "jsonrpc": "2.0", "id": request.id, "result": result })),
        Err(err) => Json(json!({
            "jsonrpc": "2.0",
            "id": request.id,
            "error": { "code": -32603, "message": err.to_string() },
        })),
    }
}
