//! Push endpoint
//!
//! Handles `POST <prefix>...` from camera firmware:
//! transport checks, bounded body read, decoding, shared-secret check,
//! handler invocation and the configured success response.

use axum::{
    body::Body,
    extract::{Extension, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{ConnectionMeta, PushRoute};
use crate::auth::AuthError;
use crate::config::{encode_text, ServerConfig};
use crate::event::PlateNotification;
use crate::handler::deliver;
use crate::metrics::Metrics;
use crate::resolver::decode_event;

/// Reasons a push is refused
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PushRejection {
    #[error("Not found")]
    NotFound,

    #[error("HTTPS required")]
    HttpsRequired,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Payload too large")]
    PayloadTooLarge { limit: u64 },

    #[error("Failed to read request body")]
    BodyRead(String),

    #[error("Empty request body")]
    EmptyBody,

    #[error("No license plate found")]
    NoPlate,

    #[error("Unauthorized")]
    Unauthorized(AuthError),
}

impl PushRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            PushRejection::NotFound => StatusCode::NOT_FOUND,
            PushRejection::HttpsRequired => StatusCode::FORBIDDEN,
            PushRejection::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            PushRejection::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            PushRejection::BodyRead(_) | PushRejection::EmptyBody | PushRejection::NoPlate => {
                StatusCode::BAD_REQUEST
            }
            PushRejection::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }

    /// Plain-text response in the configured encoding
    pub fn render(&self, config: &ServerConfig) -> Response {
        let encoding = config.response_encoding();
        let content_type = HeaderValue::from_str(&format!(
            "text/plain; charset={}",
            encoding.name().to_ascii_lowercase()
        ))
        .unwrap_or_else(|_| HeaderValue::from_static("text/plain"));

        let mut response = (
            self.status(),
            [(header::CONTENT_TYPE, content_type)],
            encode_text(encoding, &self.to_string()),
        )
            .into_response();

        if matches!(self, PushRejection::MethodNotAllowed) {
            let allow = config
                .allowed_methods()
                .iter()
                .map(|m| m.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            if let Ok(value) = HeaderValue::from_str(&allow) {
                response.headers_mut().insert(header::ALLOW, value);
            }
        }
        response
    }
}

/// Fallback handler for every request on a bound address
pub async fn push_handler(
    State(route): State<PushRoute>,
    Extension(conn): Extension<ConnectionMeta>,
    request: Request,
) -> Response {
    let request_id = Uuid::new_v4();
    let span = info_span!(
        "plate_push",
        request_id = %request_id,
        remote_addr = %conn.remote_addr
    );

    async move {
        let received_at = Utc::now();
        let config = &route.state.config;
        let metrics = &route.state.metrics;
        metrics.request_received();

        match accept_push(&route, conn, request_id, received_at, request).await {
            Ok(()) => {
                let success = config.response();
                (
                    success.status,
                    [(header::CONTENT_TYPE, success.content_type.clone())],
                    success.body.clone(),
                )
                    .into_response()
            }
            Err(rejection) => {
                let status = rejection.status();
                metrics.request_rejected(status);
                match &rejection {
                    PushRejection::Unauthorized(reason) => {
                        warn!(status = status.as_u16(), reason = %reason, "Push rejected")
                    }
                    PushRejection::BodyRead(reason) => {
                        warn!(status = status.as_u16(), reason = %reason, "Push rejected")
                    }
                    other => info!(status = status.as_u16(), reason = %other, "Push rejected"),
                }
                rejection.render(config)
            }
        }
    }
    .instrument(span)
    .await
}

async fn accept_push(
    route: &PushRoute,
    conn: ConnectionMeta,
    request_id: Uuid,
    received_at: DateTime<Utc>,
    request: Request,
) -> Result<(), PushRejection> {
    let config = &route.state.config;
    let (parts, body) = request.into_parts();

    if !route.prefixes.iter().any(|p| p.matches(parts.uri.path())) {
        return Err(PushRejection::NotFound);
    }
    if config.require_https() && !conn.secure {
        return Err(PushRejection::HttpsRequired);
    }
    if !config.is_method_allowed(&parts.method) {
        return Err(PushRejection::MethodNotAllowed);
    }

    let limit = config.max_body_bytes();
    if let (Some(limit), Some(declared)) = (limit, content_length(&parts.headers)) {
        if declared > limit {
            return Err(PushRejection::PayloadTooLarge { limit });
        }
    }

    let body = read_body(body, limit, &route.state.metrics).await?;
    if body.is_empty() && !config.allow_empty_body() {
        return Err(PushRejection::EmptyBody);
    }

    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let event = decode_event(config.aliases(), parts.uri.query(), content_type, body)
        .ok_or(PushRejection::NoPlate)?;

    if let Some(secret) = config.shared_secret() {
        secret
            .verify(event.token())
            .map_err(PushRejection::Unauthorized)?;
    }

    info!(
        plate = %event.plate(),
        source = %event.plate_source(),
        camera_id = event.camera_id().unwrap_or_default(),
        "Plate received"
    );

    let notification = PlateNotification {
        request_id,
        event,
        remote_addr: conn.remote_addr,
        headers: capture_headers(&parts.headers),
        method: parts.method.to_string(),
        uri: parts.uri.to_string(),
        received_at,
    };

    if deliver(route.state.handler.as_ref(), notification).await.is_delivered() {
        route.state.metrics.event_delivered();
    } else {
        route.state.metrics.handler_failed();
    }
    Ok(())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Read the body chunk by chunk, stopping as soon as the limit is exceeded
async fn read_body(
    body: Body,
    limit: Option<u64>,
    metrics: &Metrics,
) -> Result<Bytes, PushRejection> {
    let mut stream = body.into_data_stream();
    let mut buffer = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| PushRejection::BodyRead(e.to_string()))?;
        metrics.bytes_received(chunk.len() as u64);

        if let Some(limit) = limit {
            if (buffer.len() + chunk.len()) as u64 > limit {
                debug!(
                    limit,
                    read = buffer.len() + chunk.len(),
                    "Body exceeds limit"
                );
                return Err(PushRejection::PayloadTooLarge { limit });
            }
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

fn capture_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}
