// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingestion sources.
//!
//! A source turns some local stream into JSON objects and hands each one to an
//! [`EventHandler`]. Two sources exist:
//! - [`stdin::StdinSource`] reads newline-delimited JSON, e.g. from the Meshtastic JSON
//!   bridge script;
//! - [`cli_listen::CliListenSource`] supervises `meshtastic --listen` and recovers events
//!   from both of its output streams.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::queue::DeliveryQueue;

pub mod cli_listen;
pub mod packet_dump;
pub mod stdin;

#[cfg(test)]
pub(crate) mod test_support;

/// Log one line out of this many for high-volume discard paths
pub(crate) const LOG_SAMPLE_EVERY: u64 = 50;

/// Receives every JSON object recovered by a source.
///
/// Sources await the handler before reading the next line.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: Map<String, Value>);
}

#[async_trait]
impl EventHandler for DeliveryQueue {
    async fn on_event(&self, event: Map<String, Value>) {
        self.enqueue(event);
    }
}

/// Strict JSON parse of one line, keeping only objects.
pub(crate) fn parse_object(line: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Line content without surrounding whitespace, `None` when the bytes are not UTF-8.
pub(crate) fn decode_line(raw: &[u8]) -> Option<&str> {
    std::str::from_utf8(raw).ok().map(str::trim)
}

/// True for the first occurrence and then for every [`LOG_SAMPLE_EVERY`]th one.
pub(crate) fn should_sample(count: u64) -> bool {
    count == 1 || count % LOG_SAMPLE_EVERY == 0
}
