//! HTTP surface.
//!
//! # Responsibilities
//! - Build the axum Router: `/healthz` plus a fallback into the dispatcher
//! - Log method, path, and User-Agent for every request
//! - Bind the listener and serve
//! - Graceful shutdown on SIGINT/SIGTERM with a bounded drain
//!
//! Dynamic routes are not registered with axum individually: the compiled
//! route table owns matching (including `{param}` captures), which is what
//! lets forwards re-enter the dispatcher without another network hop.

use axum::body::Body;
use axum::extract::State;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http::{Request, StatusCode};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::pipeline::{Dispatcher, InboundRequest};

/// How long in-flight requests get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

/// Build the axum router with all middleware layers.
pub fn build_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .fallback(proxy_handler)
        .with_state(AppState { dispatcher })
        .layer(middleware::from_fn(log_request))
        .layer(TraceLayer::new_for_http())
}

/// Bind the port and serve until a shutdown signal arrives.
pub async fn run(dispatcher: Arc<Dispatcher>, port: u16) -> io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    serve(listener, dispatcher).await
}

/// Serve on an already-bound listener.
pub async fn serve(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> io::Result<()> {
    let addr = listener.local_addr()?;

    tracing::info!(
        address = %addr,
        routes = dispatcher.routes().routes().len(),
        "http server starting"
    );

    let app = build_router(dispatcher);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    tokio::select! {
        result = &mut server => {
            return result.unwrap_or_else(|e| Err(io::Error::other(e)));
        }
        _ = shutdown_signal() => {}
    }

    tracing::info!("shutdown signal received, draining in-flight requests");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
        Ok(result) => result.unwrap_or_else(|e| Err(io::Error::other(e)))?,
        Err(_) => {
            tracing::warn!(
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "graceful shutdown timed out, aborting remaining requests"
            );
            server.abort();
        }
    }

    tracing::info!("http server stopped");
    Ok(())
}

async fn healthz() -> &'static str {
    "OK"
}

/// Every non-health request lands here and goes through the dispatcher.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "failed to read request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    let req = InboundRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body,
    };

    state.dispatcher.dispatch(req, 0).await
}

/// Record method, path, and User-Agent for every request.
async fn log_request(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let user_agent = request
        .headers()
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    tracing::info!(%method, %path, %user_agent, "request");

    next.run(request).await
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
