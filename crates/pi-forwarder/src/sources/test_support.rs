// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Mutex;

use super::EventHandler;

/// Handler that keeps every event it receives.
#[derive(Debug, Default)]
pub(crate) struct RecordingHandler {
    events: Mutex<Vec<Map<String, Value>>>,
}

impl RecordingHandler {
    #[allow(clippy::unwrap_used)]
    pub(crate) fn events(&self) -> Vec<Map<String, Value>> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    #[allow(clippy::unwrap_used)]
    async fn on_event(&self, event: Map<String, Value>) {
        self.events.lock().unwrap().push(event);
    }
}
