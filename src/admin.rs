//! Admin HTTP surface (spec.md §6): `/health`, `/stats`, `/config`,
//! `/config/reload`, `/positions`, `/dlq/stats`, `/dlq/reprocess`, and a
//! `/metrics` passthrough. Kept intentionally thin — each route reads a
//! snapshot provider rather than owning any state itself.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use snafu::{ResultExt, Snafu};
use tracing::{error, info};

#[derive(Debug, Snafu)]
pub enum AdminError {
    #[snafu(display("failed to bind admin server to {}: {}", addr, source))]
    Bind { addr: SocketAddr, source: hyper::Error },
}

/// Read-only snapshot hooks the admin server calls into. Each returns a
/// pre-serialized JSON value so the admin module never needs to know the
/// concrete types of the dispatcher, position stores, or DLQ.
pub struct AdminState {
    pub config_snapshot: Box<dyn Fn() -> Value + Send + Sync>,
    pub stats_snapshot: Box<dyn Fn() -> Value + Send + Sync>,
    pub positions_snapshot: Box<dyn Fn() -> Value + Send + Sync>,
    pub dlq_stats_snapshot: Box<dyn Fn() -> Value + Send + Sync>,
    pub reload_config: Box<dyn Fn() -> Result<(), String> + Send + Sync>,
    pub dlq_reprocess: Box<dyn Fn() -> Result<Value, String> + Send + Sync>,
}

fn json_response(status: StatusCode, body: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

async fn route(state: Arc<AdminState>, req: Request<Body>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => json_response(StatusCode::OK, json!({ "status": "ok" })),
        (&Method::GET, "/stats") => json_response(StatusCode::OK, (state.stats_snapshot)()),
        (&Method::GET, "/config") => json_response(StatusCode::OK, (state.config_snapshot)()),
        (&Method::POST, "/config/reload") => match (state.reload_config)() {
            Ok(()) => json_response(StatusCode::OK, json!({ "reloaded": true })),
            Err(err) => json_response(StatusCode::BAD_REQUEST, json!({ "error": err })),
        },
        (&Method::GET, "/positions") => json_response(StatusCode::OK, (state.positions_snapshot)()),
        (&Method::GET, "/dlq/stats") => json_response(StatusCode::OK, (state.dlq_stats_snapshot)()),
        (&Method::POST, "/dlq/reprocess") => match (state.dlq_reprocess)() {
            Ok(result) => json_response(StatusCode::OK, result),
            Err(err) => json_response(StatusCode::BAD_REQUEST, json!({ "error": err })),
        },
        _ => json_response(StatusCode::NOT_FOUND, json!({ "error": "not found" })),
    }
}

pub async fn serve(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), AdminError> {
    let state = Arc::new(state);
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(state, req).await) }
            }))
        }
    });

    info!(%addr, "admin server listening");
    Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            info!("admin server stopping on shutdown signal");
        })
        .await
        .context(BindSnafu { addr })?;
    Ok(())
}
