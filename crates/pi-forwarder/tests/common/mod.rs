// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use async_trait::async_trait;
use pi_forwarder::sources::EventHandler;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Handler forwarding every event into a channel.
pub struct ChannelHandler {
    sender: mpsc::UnboundedSender<Map<String, Value>>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Map<String, Value>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ChannelHandler { sender }, receiver)
    }
}

#[async_trait]
impl EventHandler for ChannelHandler {
    async fn on_event(&self, event: Map<String, Value>) {
        let _ = self.sender.send(event);
    }
}

/// Waits for the next event, failing the test after `secs` seconds.
pub async fn next_event(
    receiver: &mut mpsc::UnboundedReceiver<Map<String, Value>>,
    secs: u64,
) -> Map<String, Value> {
    timeout(Duration::from_secs(secs), receiver.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("handler dropped")
}

/// Polls `condition` every 10 ms until it holds, failing the test after `secs` seconds.
pub async fn wait_until(secs: u64, mut condition: impl FnMut() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(secs), poll)
        .await
        .expect("condition not met in time");
}
