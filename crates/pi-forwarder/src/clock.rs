// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time source used by the delivery queue.
//!
//! Scheduling uses [`tokio::time::Instant`] so that paused Tokio time drives retries in
//! tests. Wall-clock time is only used to stamp the `receivedAt` field of forwarded events.

use chrono::{DateTime, Utc};
use std::fmt::Debug;
use tokio::time::Instant;

pub trait Clock: Send + Sync + Debug {
    /// Monotonic instant used to schedule delivery attempts.
    fn now(&self) -> Instant;

    /// Wall-clock time recorded on received events and successful deliveries.
    fn wall_time(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Renders a timestamp the way it is sent on the wire, e.g. `2024-05-01T12:00:00.000Z`.
#[must_use]
pub fn iso8601(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
