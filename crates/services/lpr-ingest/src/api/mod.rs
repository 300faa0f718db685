//! HTTP surface of the push listener
//!
//! Every request on a bound address lands in [`push::push_handler`]; there
//! are no fixed routes because cameras are free to POST to any path under a
//! configured prefix.

pub mod push;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::config::{ListenPrefix, ServerConfig};
use crate::handler::PlateEventHandler;
use crate::metrics::Metrics;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Validated listener configuration
    pub config: Arc<ServerConfig>,
    /// Application hook for accepted detections
    pub handler: Arc<dyn PlateEventHandler>,
    /// Listener metrics
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(
        config: Arc<ServerConfig>,
        handler: Arc<dyn PlateEventHandler>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            handler,
            metrics,
        }
    }
}

/// Per-connection facts the accept loop attaches to each request
#[derive(Debug, Clone, Copy)]
pub struct ConnectionMeta {
    pub remote_addr: SocketAddr,
    /// Connection was accepted over TLS
    pub secure: bool,
}

/// State of the router serving one bound address
#[derive(Clone)]
pub struct PushRoute {
    pub state: AppState,
    /// Prefixes served on this address
    pub prefixes: Arc<[ListenPrefix]>,
}

/// Build the router for one bound address
pub fn build_router(state: AppState, prefixes: Vec<ListenPrefix>) -> Router {
    let route = PushRoute {
        state,
        prefixes: prefixes.into(),
    };

    Router::new()
        .fallback(push::push_handler)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(route)
}

/// Last-resort response when request handling panics
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "Request handling panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
        "Internal server error",
    )
        .into_response()
}
