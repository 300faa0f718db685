//! Decoded detection events and the notification delivered to the application

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::net::SocketAddr;
use uuid::Uuid;

use crate::fields::{FieldMap, FieldOrigin};

/// Event construction errors
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EventError {
    #[error("Plate must not be empty")]
    EmptyPlate,
}

/// A normalized license-plate detection decoded from one push payload
///
/// The plate is always present; every optional value travels together with
/// its source tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedEvent {
    plate: String,
    plate_source: FieldOrigin,

    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp_source: Option<FieldOrigin>,

    #[serde(skip_serializing_if = "Option::is_none")]
    confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence_source: Option<FieldOrigin>,

    #[serde(skip_serializing_if = "Option::is_none")]
    camera_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    camera_name: Option<String>,

    #[serde(skip)]
    token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_source: Option<FieldOrigin>,

    #[serde(serialize_with = "serialize_lossy")]
    raw_body: Bytes,
    fields: FieldMap<String>,
    field_sources: FieldMap<FieldOrigin>,
}

fn serialize_lossy<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

impl DecodedEvent {
    /// Create an event; fails when `plate` is blank
    pub fn new(
        plate: impl Into<String>,
        plate_source: FieldOrigin,
        raw_body: impl Into<Bytes>,
    ) -> Result<Self, EventError> {
        let plate = plate.into();
        if plate.trim().is_empty() {
            return Err(EventError::EmptyPlate);
        }

        Ok(Self {
            plate,
            plate_source,
            timestamp: None,
            timestamp_source: None,
            confidence: None,
            confidence_source: None,
            camera_id: None,
            camera_name: None,
            token: None,
            token_source: None,
            raw_body: raw_body.into(),
            fields: FieldMap::new(),
            field_sources: FieldMap::new(),
        })
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>, source: FieldOrigin) -> Self {
        self.timestamp = Some(timestamp);
        self.timestamp_source = Some(source);
        self
    }

    pub fn with_confidence(mut self, confidence: f64, source: FieldOrigin) -> Self {
        self.confidence = Some(confidence);
        self.confidence_source = Some(source);
        self
    }

    pub fn with_camera_id(mut self, camera_id: String) -> Self {
        self.camera_id = Some(camera_id);
        self
    }

    pub fn with_camera_name(mut self, camera_name: String) -> Self {
        self.camera_name = Some(camera_name);
        self
    }

    pub fn with_token(mut self, token: String, source: FieldOrigin) -> Self {
        self.token = Some(token);
        self.token_source = Some(source);
        self
    }

    /// Attach every discovered field and where it came from
    pub fn with_fields(
        mut self,
        fields: FieldMap<String>,
        field_sources: FieldMap<FieldOrigin>,
    ) -> Self {
        self.fields = fields;
        self.field_sources = field_sources;
        self
    }

    pub fn plate(&self) -> &str {
        &self.plate
    }

    pub fn plate_source(&self) -> FieldOrigin {
        self.plate_source
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn timestamp_source(&self) -> Option<FieldOrigin> {
        self.timestamp_source
    }

    pub fn confidence(&self) -> Option<f64> {
        self.confidence
    }

    pub fn confidence_source(&self) -> Option<FieldOrigin> {
        self.confidence_source
    }

    pub fn camera_id(&self) -> Option<&str> {
        self.camera_id.as_deref()
    }

    pub fn camera_name(&self) -> Option<&str> {
        self.camera_name.as_deref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn token_source(&self) -> Option<FieldOrigin> {
        self.token_source
    }

    /// The body bytes exactly as received, kept for audit
    pub fn raw_body(&self) -> &Bytes {
        &self.raw_body
    }

    /// The body as text, invalid UTF-8 replaced
    pub fn raw_body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw_body)
    }

    pub fn fields(&self) -> &FieldMap<String> {
        &self.fields
    }

    pub fn field_sources(&self) -> &FieldMap<FieldOrigin> {
        &self.field_sources
    }
}

/// What the application receives for every accepted push
#[derive(Debug, Clone, Serialize)]
pub struct PlateNotification {
    /// Per-request identifier, also attached to the request's log span
    pub request_id: Uuid,

    pub event: DecodedEvent,

    pub remote_addr: SocketAddr,

    /// Request headers, one entry per value
    pub headers: Vec<(String, String)>,

    pub method: String,

    pub uri: String,

    /// When the listener accepted the request
    pub received_at: DateTime<Utc>,
}
