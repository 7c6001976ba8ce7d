// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Recovery of position events from the `packet={...}` debug dumps the Meshtastic CLI
//! writes to stderr.
//!
//! The dump is a Python dict rendering, not JSON, so each field is scanned for
//! independently and absent fields are simply left out.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Number, Value};

/// Marker identifying a packet dump line
pub const PACKET_MARKER: &str = "packet={";

lazy_static! {
    /// `'latitude': <number>`; the trailing quote keeps `latitudeI` out
    static ref LATITUDE_REGEX: Regex = numeric_field("latitude");

    static ref LONGITUDE_REGEX: Regex = numeric_field("longitude");

    /// Quoted node id, e.g. `'fromId': '!a1b2c3d4'`
    static ref FROM_ID_REGEX: Regex = pattern(r#"['"]fromId['"]\s*:\s*['"]([^'"]+)['"]"#);

    /// Numeric node number, e.g. `'from': 2882400001`
    static ref FROM_REGEX: Regex = numeric_field("from");

    /// Integer packet id only, `'id': 7.5` is left out
    static ref PACKET_ID_REGEX: Regex = pattern(r#"['"]id['"]\s*:\s*(\d+)\s*[,}]"#);

    static ref TIME_REGEX: Regex = numeric_field("time");

    static ref RX_TIME_REGEX: Regex = numeric_field("rxTime");
}

#[allow(clippy::expect_used)]
fn pattern(regex: &str) -> Regex {
    Regex::new(regex).expect("failed creating regex")
}

fn numeric_field(key: &str) -> Regex {
    pattern(&format!(
        r#"['"]{key}['"]\s*:\s*(-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)"#
    ))
}

fn capture<'a>(regex: &Regex, line: &'a str) -> Option<&'a str> {
    regex
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn finite(regex: &Regex, line: &str) -> Option<f64> {
    capture(regex, line)
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

#[allow(clippy::cast_possible_truncation)]
fn truncated(regex: &Regex, line: &str) -> Option<i64> {
    finite(regex, line).map(|value| value.trunc() as i64)
}

/// Extracts a position event from a packet dump line.
///
/// Returns `None` unless the line carries the packet marker and both a finite latitude
/// and longitude. The result holds `lat`, `lon` and, when present, `nodeId` (preferring
/// the quoted `fromId` over the numeric `from`), `packetId` and `timestamp` (preferring
/// `time` over `rxTime`).
pub fn extract_packet(line: &str) -> Option<Map<String, Value>> {
    if !line.contains(PACKET_MARKER) {
        return None;
    }
    let lat = Number::from_f64(finite(&LATITUDE_REGEX, line)?)?;
    let lon = Number::from_f64(finite(&LONGITUDE_REGEX, line)?)?;

    let mut event = Map::new();
    event.insert("lat".to_string(), Value::Number(lat));
    event.insert("lon".to_string(), Value::Number(lon));

    let node_id = capture(&FROM_ID_REGEX, line)
        .map(str::to_string)
        .or_else(|| truncated(&FROM_REGEX, line).map(|from| from.to_string()));
    if let Some(node_id) = node_id {
        event.insert("nodeId".to_string(), Value::String(node_id));
    }

    if let Some(packet_id) = capture(&PACKET_ID_REGEX, line).and_then(|raw| raw.parse::<u64>().ok()) {
        event.insert("packetId".to_string(), Value::from(packet_id));
    }

    let timestamp = truncated(&TIME_REGEX, line).or_else(|| truncated(&RX_TIME_REGEX, line));
    if let Some(timestamp) = timestamp {
        event.insert("timestamp".to_string(), Value::from(timestamp));
    }

    Some(event)
}
