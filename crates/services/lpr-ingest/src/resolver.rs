//! Field resolution
//!
//! Maps accumulated fields onto the semantic fields of a [`DecodedEvent`]
//! through the configured alias sets. The plate is mandatory: when no alias
//! yields a usable plate, field values and then the raw body are scanned for
//! anything plate-shaped.

use bytes::Bytes;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::config::AliasConfig;
use crate::event::DecodedEvent;
use crate::fields::{FieldAccumulator, FieldOrigin};
use crate::normalize::{normalize_plate, parse_confidence, parse_timestamp, trimmed};
use crate::payload::{decode_body, decode_query};

/// Key the pattern fallback records its match under
const FALLBACK_PLATE_KEY: &str = "plate";

/// 2-3 alphanumerics, optional separator, 3-4 alphanumerics, bounded by
/// non-alphanumerics (or the ends of the text)
fn plate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?:^|[^A-Za-z0-9])([A-Za-z0-9]{2,3}[-\s]?[A-Za-z0-9]{3,4})(?:$|[^A-Za-z0-9])",
        )
        .expect("plate pattern is valid")
    })
}

/// Decode a full push payload into an event
///
/// Query parameters are decoded first and body fields second, so a body
/// field overrides a query parameter with the same key. Non-UTF-8 bytes are
/// decoded lossily; the event keeps the original bytes. Returns `None` when
/// no plate can be resolved.
pub fn decode_event(
    aliases: &AliasConfig,
    query: Option<&str>,
    content_type: Option<&str>,
    body: Bytes,
) -> Option<DecodedEvent> {
    let mut fields = FieldAccumulator::new();
    decode_query(query, &mut fields);
    decode_body(content_type, &String::from_utf8_lossy(&body), &mut fields);

    resolve(aliases, &mut fields, body)
}

/// Resolve accumulated fields into an event
pub fn resolve(
    aliases: &AliasConfig,
    fields: &mut FieldAccumulator,
    raw_body: Bytes,
) -> Option<DecodedEvent> {
    let (plate, plate_source) = match resolve_plate(aliases, fields) {
        Some(found) => found,
        None => {
            let plate = find_plate_pattern(fields, &String::from_utf8_lossy(&raw_body))?;
            fields.set(FALLBACK_PLATE_KEY, Some(&plate), FieldOrigin::Regex);
            (plate, FieldOrigin::Regex)
        }
    };

    let mut event = match DecodedEvent::new(plate, plate_source, raw_body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Resolved plate rejected");
            return None;
        }
    };

    if let Some((raw, source)) = fields.find(&aliases.timestamp) {
        match parse_timestamp(raw) {
            Ok(timestamp) => event = event.with_timestamp(timestamp, source),
            Err(e) => warn!(error = %e, source = %source, "Discarding timestamp"),
        }
    }

    if let Some((raw, source)) = fields.find(&aliases.confidence) {
        match parse_confidence(raw) {
            Ok(confidence) => event = event.with_confidence(confidence, source),
            Err(e) => warn!(error = %e, source = %source, "Discarding confidence"),
        }
    }

    if let Some(camera_id) = fields
        .find(&aliases.camera_id)
        .and_then(|(v, _)| trimmed(v))
    {
        event = event.with_camera_id(camera_id);
    }
    if let Some(camera_name) = fields
        .find(&aliases.camera_name)
        .and_then(|(v, _)| trimmed(v))
    {
        event = event.with_camera_name(camera_name);
    }
    if let Some((raw, source)) = fields.find(&aliases.token) {
        if let Some(token) = trimmed(raw) {
            event = event.with_token(token, source);
        }
    }

    Some(event.with_fields(
        fields.to_value_map(),
        fields.to_source_map(),
    ))
}

fn resolve_plate(
    aliases: &AliasConfig,
    fields: &FieldAccumulator,
) -> Option<(String, FieldOrigin)> {
    let (raw, source) = fields.find(&aliases.plate)?;
    match normalize_plate(raw) {
        Some(plate) => Some((plate, source)),
        None => {
            debug!(raw = %raw, source = %source, "Plate alias matched but value is not a plate");
            None
        }
    }
}

/// Scan field values, then the raw body, for a plate-shaped token
fn find_plate_pattern(fields: &FieldAccumulator, raw_body: &str) -> Option<String> {
    let found = fields
        .iter()
        .find_map(|f| scan_for_plate(&f.value))
        .or_else(|| scan_for_plate(raw_body));

    if let Some(plate) = &found {
        debug!(plate = %plate, "Plate recovered by pattern scan");
    }
    found
}

/// First plate-shaped candidate in `text`
///
/// Candidates without a digit are skipped so ordinary words such as
/// `entry` do not pass for plates.
pub fn scan_for_plate(text: &str) -> Option<String> {
    let pattern = plate_pattern();
    let mut start = 0;

    while start < text.len() {
        let captures = pattern.captures_at(text, start)?;
        let candidate = captures.get(1)?;

        if candidate.as_str().chars().any(|c| c.is_ascii_digit()) {
            if let Some(plate) = normalize_plate(candidate.as_str()) {
                return Some(plate);
            }
        }
        // The trailing boundary may be the leading boundary of the next candidate
        start = candidate.end();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(
        query: Option<&str>,
        content_type: Option<&str>,
        body: &str,
    ) -> Option<DecodedEvent> {
        decode_event(
            &AliasConfig::default(),
            query,
            content_type,
            Bytes::copy_from_slice(body.as_bytes()),
        )
    }

    #[test]
    fn test_json_plate_any_alias() {
        for alias in ["plate", "licensePlate", "license_plate", "PLATE_NUMBER", "vrm"] {
            let body = format!(r#"{{"{}": "ab-12 34"}}"#, alias);
            let event = decode(None, Some("application/json"), &body).unwrap();
            assert_eq!(event.plate(), "AB1234", "alias {}", alias);
            assert_eq!(event.plate_source(), FieldOrigin::Json);
        }
    }

    #[test]
    fn test_body_overrides_query() {
        let event = decode(
            Some("plate=AB1234"),
            Some("application/json"),
            r#"{"plate":"cd5678"}"#,
        )
        .unwrap();
        assert_eq!(event.plate(), "CD5678");
        assert_eq!(event.plate_source(), FieldOrigin::Json);
    }

    #[test]
    fn test_query_used_when_body_silent() {
        let event = decode(
            Some("plate=AB1234&camId=gate-1"),
            Some("application/json"),
            r#"{"speed":40}"#,
        )
        .unwrap();
        assert_eq!(event.plate(), "AB1234");
        assert_eq!(event.plate_source(), FieldOrigin::Query);
        assert_eq!(event.camera_id(), Some("gate-1"));
        assert_eq!(event.field_sources().get("speed"), Some(&FieldOrigin::Json));
    }

    #[test]
    fn test_pattern_fallback_on_raw_body() {
        let event = decode(None, Some("text/plain"), "entry event XY-1234 detected").unwrap();
        assert_eq!(event.plate(), "XY1234");
        assert_eq!(event.plate_source(), FieldOrigin::Regex);
        assert_eq!(
            event.field_sources().get("plate"),
            Some(&FieldOrigin::Regex)
        );
    }

    #[test]
    fn test_pattern_fallback_on_field_values() {
        let event = decode(
            None,
            None,
            r#"{"event":"entry","message":"vehicle KL 4471 at gate"}"#,
        )
        .unwrap();
        assert_eq!(event.plate(), "KL4471");
        assert_eq!(event.plate_source(), FieldOrigin::Regex);
    }

    #[test]
    fn test_unusable_alias_value_falls_back() {
        let event = decode(None, None, r#"{"plate":"?", "ocr":"MN-5521"}"#).unwrap();
        assert_eq!(event.plate(), "MN5521");
        assert_eq!(event.plate_source(), FieldOrigin::Regex);
    }

    #[test]
    fn test_empty_object_yields_nothing() {
        assert!(decode(None, Some("application/json"), "{}").is_none());
        assert!(decode(Some(""), None, "").is_none());
    }

    #[test]
    fn test_full_event_resolution() {
        let body = r#"{
            "Plate": {"Text": "ab1234"},
            "licensePlate": "ab 1234",
            "eventTime": "1700000000000",
            "score": "87",
            "device": {"cameraId": "  CAM-7 ", "cameraName": "North Gate"},
            "auth": {"token": " s3cret "}
        }"#;
        let event = decode(None, Some("application/json"), body).unwrap();

        assert_eq!(event.plate(), "AB1234");
        assert_eq!(event.timestamp().unwrap().timestamp(), 1_700_000_000);
        assert_eq!(event.timestamp_source(), Some(FieldOrigin::Json));
        assert_eq!(event.confidence(), Some(0.87));
        assert_eq!(event.camera_id(), Some("CAM-7"));
        assert_eq!(event.camera_name(), Some("North Gate"));
        assert_eq!(event.token(), Some("s3cret"));
        assert_eq!(event.token_source(), Some(FieldOrigin::Json));
        assert_eq!(event.raw_body().as_ref(), body.as_bytes());
    }

    #[test]
    fn test_bad_timestamp_and_confidence_are_dropped() {
        let event = decode(
            None,
            Some("application/x-www-form-urlencoded"),
            "plate=AB1234&timestamp=999999999999&confidence=high",
        )
        .unwrap();

        assert_eq!(event.plate(), "AB1234");
        assert_eq!(event.plate_source(), FieldOrigin::Form);
        assert_eq!(event.timestamp(), None);
        assert_eq!(event.timestamp_source(), None);
        assert_eq!(event.confidence(), None);
        assert_eq!(event.confidence_source(), None);
    }

    #[test]
    fn test_blank_camera_fields_are_absent() {
        let event = decode(None, None, "plate=AB1234&cameraName=%20%20&cameraId=").unwrap();
        assert_eq!(event.camera_name(), None);
        assert_eq!(event.camera_id(), None);
    }

    #[test]
    fn test_custom_aliases() {
        let mut aliases = AliasConfig::default();
        aliases.plate = vec!["kennzeichen".to_string()];

        let body = Bytes::from_static(br#"{"kennzeichen":"B-XY 123"}"#);
        let event = decode_event(&aliases, None, None, body).unwrap();
        assert_eq!(event.plate(), "BXY123");
    }

    #[test]
    fn test_json_last_key_in_document_wins() {
        let event = decode(
            None,
            Some("application/json"),
            r#"{"vehicle":{"plate":"BBB222"},"plate":"AAA111"}"#,
        )
        .unwrap();
        assert_eq!(event.plate(), "AAA111");

        let event = decode(
            None,
            Some("application/json"),
            r#"{"plate":"AAA111","vehicle":{"plate":"BBB222"}}"#,
        )
        .unwrap();
        assert_eq!(event.plate(), "BBB222");
    }

    #[test]
    fn test_pattern_scan_follows_document_order() {
        let event = decode(
            None,
            Some("application/json"),
            r#"{"zmsg":"car AB-1234","amsg":"car CD-5678"}"#,
        )
        .unwrap();
        assert_eq!(event.plate(), "AB1234");
        assert_eq!(event.plate_source(), FieldOrigin::Regex);
    }

    #[test]
    fn test_exported_fields_in_document_order() {
        let event = decode(
            Some("camId=gate-1"),
            Some("application/json"),
            r#"{"zone":"north","plate":"AB1234","area":"lot-b"}"#,
        )
        .unwrap();

        let keys: Vec<&str> = event.fields().keys().collect();
        assert_eq!(keys, vec!["camId", "zone", "plate", "area"]);
        assert_eq!(
            event.field_sources().get("CAMID"),
            Some(&FieldOrigin::Query)
        );
    }

    #[test]
    fn test_invalid_utf8_body_is_decoded_lossily() {
        let body = Bytes::from_static(b"plate=AB1234&note=caf\xe9");
        let event = decode_event(&AliasConfig::default(), None, None, body.clone()).unwrap();

        assert_eq!(event.plate(), "AB1234");
        assert_eq!(event.raw_body(), &body);
    }

    #[test]
    fn test_scan_for_plate() {
        assert_eq!(scan_for_plate("entry XY-1234"), Some("XY1234".to_string()));
        assert_eq!(scan_for_plate("ab 1234"), Some("AB1234".to_string()));
        assert_eq!(scan_for_plate("ABCDEFGH12"), None);
        assert_eq!(scan_for_plate("2023-11-14"), None);
        assert_eq!(scan_for_plate("no plate here"), None);
        assert_eq!(scan_for_plate(""), None);
    }
}
