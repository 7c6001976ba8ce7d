// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stable identifiers for forwarded events.
//!
//! The identifier doubles as the `Idempotency-Key` header, so two payloads that carry the
//! same `packetId` (or `id`) must always map to the same value, whatever else they contain.
//! Resolution order:
//! 1. the `packetId` field, when it is a usable string or number;
//! 2. the `id` field, under the same rules;
//! 3. a SHA-256 digest of the payload serialized as JSON with sorted keys.

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

const ID_FIELDS: [&str; 2] = ["packetId", "id"];

/// Derives the identifier of an arbitrary payload. Never fails.
#[must_use]
pub fn identify(payload: &Value) -> String {
    match payload {
        Value::Object(map) => identify_object(map),
        other => digest(other),
    }
}

/// Same as [`identify`] for a payload that is already known to be a JSON object.
#[must_use]
pub fn identify_object(map: &Map<String, Value>) -> String {
    for field in ID_FIELDS {
        if let Some(id) = map.get(field).and_then(id_from_value) {
            return id;
        }
    }
    digest(&Value::Object(map.clone()))
}

fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::Number(number) => Some(id_from_number(number)),
        Value::String(text) => id_from_str(text),
        _ => None,
    }
}

fn id_from_number(number: &Number) -> String {
    match number.as_u64() {
        Some(unsigned) => format!("{unsigned:x}"),
        None => hex::encode(number.to_string()),
    }
}

fn id_from_str(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_lowercase();
    if lowered.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(lowered)
    } else {
        Some(hex::encode(trimmed))
    }
}

fn digest(payload: &Value) -> String {
    let sorted = canonical(payload);
    let bytes =
        serde_json::to_vec(&sorted).unwrap_or_else(|_| format!("{sorted:?}").into_bytes());
    hex::encode(Sha256::digest(&bytes))
}

/// Copy of `value` with object keys sorted at every level, so the digest does not
/// depend on key order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Value::Object(
                keys.into_iter()
                    .map(|key| (key.clone(), canonical(&map[key])))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_integer_packet_id_is_rendered_as_hex() {
        assert_eq!(identify(&json!({"packetId": 42, "lat": 1.0, "lon": 2.0})), "2a");
        assert_eq!(identify(&json!({"packetId": 0})), "0");
        assert_eq!(identify(&json!({"packetId": 3_735_928_559u64})), "deadbeef");
    }

    #[test]
    fn test_negative_and_fractional_ids_are_hex_encoded_text() {
        assert_eq!(identify(&json!({"packetId": -1})), hex::encode("-1"));
        assert_eq!(identify(&json!({"packetId": 1.5})), hex::encode("1.5"));
    }

    #[test]
    fn test_hex_like_string_is_normalized() {
        assert_eq!(identify(&json!({"packetId": "  DEADbeef "})), "deadbeef");
        assert_eq!(identify(&json!({"packetId": "42"})), "42");
    }

    #[test]
    fn test_non_hex_string_is_hex_encoded() {
        assert_eq!(
            identify(&json!({"packetId": "!a1b2c3d4"})),
            hex::encode("!a1b2c3d4")
        );
        assert_eq!(identify(&json!({"id": " node one "})), hex::encode("node one"));
    }

    #[test]
    fn test_packet_id_takes_precedence_over_id() {
        assert_eq!(identify(&json!({"packetId": 16, "id": 17})), "10");
    }

    #[test]
    fn test_unusable_packet_id_falls_back_to_id() {
        assert_eq!(identify(&json!({"packetId": null, "id": 255})), "ff");
        assert_eq!(identify(&json!({"packetId": "   ", "id": 255})), "ff");
        assert_eq!(identify(&json!({"packetId": true, "id": "abc"})), "abc");
    }

    #[test]
    fn test_missing_ids_fall_back_to_sha256() {
        let id = identify(&json!({"lat": 1.0, "lon": 2.0}));
        assert_eq!(id.len(), 64);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_identify_object_matches_identify() {
        let payload = json!({"lat": 1.0, "lon": 2.0});
        assert_eq!(
            identify_object(payload.as_object().unwrap()),
            identify(&payload)
        );
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"lat": 1.0, "lon": 2.0, "alt": 3}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"alt": 3, "lon": 2.0, "lat": 1.0}"#).unwrap();
        assert_eq!(identify(&a), identify(&b));
    }

    #[test]
    fn test_hash_ignores_nested_key_order() {
        let a = json!({"position": {"lat": 1.0, "lon": 2.0}, "rx": [{"snr": 1, "rssi": 2}]});
        let b = json!({"rx": [{"rssi": 2, "snr": 1}], "position": {"lon": 2.0, "lat": 1.0}});
        assert_eq!(identify(&a), identify(&b));
    }

    #[test]
    fn test_non_object_payloads_are_hashed() {
        assert_eq!(identify(&json!([1, 2, 3])), identify(&json!([1, 2, 3])));
        assert_ne!(identify(&json!([1, 2, 3])), identify(&json!([3, 2, 1])));
        assert_eq!(identify(&Value::Null).len(), 64);
    }

    proptest! {
        #[test]
        fn prop_same_packet_id_same_identifier(
            packet_id in any::<u32>(),
            a in any::<i64>(),
            b in "[a-z]{0,12}",
        ) {
            let left = json!({"packetId": packet_id, "extra": a});
            let right = json!({"packetId": packet_id, "other": b, "lat": 1.0});
            prop_assert_eq!(identify(&left), identify(&right));
        }

        #[test]
        fn prop_same_id_same_identifier(id in "[a-zA-Z0-9!]{1,24}", a in any::<bool>()) {
            let left = json!({"id": id.clone(), "flag": a});
            let right = json!({"id": id});
            prop_assert_eq!(identify(&left), identify(&right));
        }

        #[test]
        fn prop_hash_fallback_is_deterministic(lat in -90.0f64..90.0, lon in -180.0f64..180.0) {
            let payload = json!({"lat": lat, "lon": lon});
            prop_assert_eq!(identify(&payload), identify(&payload.clone()));
        }
    }
}
