//! Payload decoding
//!
//! Turns the query string and the request body into accumulated fields.
//! The body shape is detected from the content type and the body itself:
//! JSON first, then form data, then loose `key=value` / `key: value` text.

use serde_json::Value;
use tracing::{debug, warn};

use crate::fields::{FieldAccumulator, FieldOrigin};

/// Body shape selected by [`detect_body_kind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Json,
    Form,
    Text,
}

impl BodyKind {
    pub fn origin(&self) -> FieldOrigin {
        match self {
            BodyKind::Json => FieldOrigin::Json,
            BodyKind::Form => FieldOrigin::Form,
            BodyKind::Text => FieldOrigin::Text,
        }
    }
}

/// Pick the decoder for a body
pub fn detect_body_kind(content_type: Option<&str>, body: &str) -> BodyKind {
    let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
    let trimmed = body.trim_start();

    if content_type.contains("json") || trimmed.starts_with('{') || trimmed.starts_with('[') {
        BodyKind::Json
    } else if content_type.contains("application/x-www-form-urlencoded")
        || (body.contains('=') && body.contains('&'))
    {
        BodyKind::Form
    } else {
        BodyKind::Text
    }
}

/// Decode query-string parameters with origin `query`
pub fn decode_query(query: Option<&str>, fields: &mut FieldAccumulator) {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return;
    };
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        fields.set(&key, Some(&value), FieldOrigin::Query);
    }
}

/// Decode a request body into `fields`, returning the shape that was used
///
/// Malformed JSON is logged and leaves `fields` untouched; the caller still
/// has the query parameters and the raw body for the pattern fallback.
pub fn decode_body(
    content_type: Option<&str>,
    body: &str,
    fields: &mut FieldAccumulator,
) -> BodyKind {
    let kind = detect_body_kind(content_type, body);
    if body.trim().is_empty() {
        return kind;
    }

    match kind {
        BodyKind::Json => match serde_json::from_str::<Value>(body) {
            Ok(value) => flatten_json(&value, "", fields),
            Err(e) => {
                warn!(error = %e, "Failed to parse JSON payload, continuing without body fields");
            }
        },
        BodyKind::Form => {
            for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
                fields.set(&key, Some(&value), FieldOrigin::Form);
            }
        }
        BodyKind::Text => decode_loose_text(body, fields),
    }

    debug!(kind = ?kind, fields = fields.len(), "Decoded payload body");
    kind
}

/// Flatten a JSON tree into dotted / indexed keys
///
/// `{"results":[{"plate":"AB1"}]}` yields `results[0].plate = AB1`.
/// Null leaves are skipped, numbers keep their JSON spelling.
pub fn flatten_json(value: &Value, path: &str, fields: &mut FieldAccumulator) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                flatten_json(child, &child_path, fields);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten_json(child, &format!("{}[{}]", path, i), fields);
            }
        }
        Value::Null => fields.set(path, None, FieldOrigin::Json),
        Value::String(s) => fields.set(path, Some(s), FieldOrigin::Json),
        Value::Bool(b) => {
            let text = if *b { "true" } else { "false" };
            fields.set(path, Some(text), FieldOrigin::Json)
        }
        Value::Number(n) => fields.set(path, Some(&n.to_string()), FieldOrigin::Json),
    }
}

/// Decode loose text such as `plate=AB1234;cam: gate-2`
fn decode_loose_text(body: &str, fields: &mut FieldAccumulator) {
    let tokens = body
        .split(|c| matches!(c, '\n' | '\r' | '&' | ';'))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    for token in tokens {
        let Some(sep) = token.find(|c| c == '=' || c == ':') else {
            continue;
        };
        // Separator glued to either end carries no key or no value
        if sep == 0 || sep == token.len() - 1 {
            continue;
        }

        let key = percent_decode(token[..sep].trim());
        let value = percent_decode(token[sep + 1..].trim());
        if key.is_empty() || value.is_empty() {
            continue;
        }
        fields.set(&key, Some(&value), FieldOrigin::Text);
    }
}

fn percent_decode(raw: &str) -> String {
    percent_encoding::percent_decode_str(raw)
        .decode_utf8_lossy()
        .into_owned()
}
