// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory delivery queue with retries.
//!
//! Events are delivered strictly in enqueue order by a single background task. When the
//! head event fails with a transient error it is rescheduled with capped exponential
//! backoff and jitter, and every event behind it waits: ordering is preserved at the
//! cost of throughput while the endpoint is unhealthy.
//!
//! ```text
//!   enqueue ──> [ e1 | e2 | e3 ... ] ──> delivery task ──> Transport::post
//!                  ^                                            │
//!                  └──────── retry: attempts += 1, backoff ─────┘
//! ```
//!
//! The queue is bounded. Once it holds more than `max_queue` events the oldest ones are
//! evicted without a delivery attempt, favouring fresh telemetry over stale telemetry.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{iso8601, Clock};
use crate::errors::TransportError;
use crate::identity::identify_object;
use crate::transport::{DeliveryRequest, Transport, TransportResponse};

/// Maximum number of response body characters written to the logs
const MAX_LOGGED_BODY_CHARS: usize = 512;
const JITTER_MIN: f64 = 0.8;
const JITTER_MAX: f64 = 1.2;

pub const DEVICE_HINT_FIELD: &str = "deviceHint";
pub const RECEIVED_AT_FIELD: &str = "receivedAt";
pub const EVENT_ID_FIELD: &str = "eventId";

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Events beyond this count are evicted oldest first
    pub max_queue: usize,
    /// Delay before the first retry, before jitter
    pub base_delay: Duration,
    /// Upper bound on the retry delay, before jitter
    pub max_delay: Duration,
    /// Bound on a single delivery attempt
    pub attempt_timeout: Duration,
    /// Merged into every payload as `deviceHint` when set
    pub device_hint: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue: 5_000,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(10),
            device_hint: None,
        }
    }
}

/// A pending event.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub id: String,
    pub payload: Map<String, Value>,
    pub attempts: u32,
    pub next_attempt_at: Instant,
    seq: u64,
}

/// How a single delivery attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Accepted by the endpoint, the event is removed
    Success,
    /// Transient failure, the event stays at the head and is rescheduled
    Retry,
    /// Permanent rejection, the event is discarded
    Drop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    pub queue_len: usize,
    pub success_count: u64,
    /// HTTP failures (terminal or retried), timeouts, network errors and evictions
    pub failure_count: u64,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<QueuedEvent>,
    next_seq: u64,
    success_count: u64,
    failure_count: u64,
    last_success_at: Option<DateTime<Utc>>,
}

enum Step {
    Idle,
    WaitUntil(Instant),
    Deliver(QueuedEvent),
}

struct Inner {
    config: QueueConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    wake: Notify,
    started: AtomicBool,
    cancel: CancellationToken,
}

/// Handle to the delivery queue. Cheap to clone, all clones share the same queue.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<Inner>,
}

impl Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("config", &self.inner.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl DeliveryQueue {
    /// Creates a stopped queue. The delivery task is spawned by [`DeliveryQueue::start`]
    /// or by the first [`DeliveryQueue::enqueue`], and stops when `cancel` fires.
    #[must_use]
    pub fn new(
        config: QueueConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        DeliveryQueue {
            inner: Arc::new(Inner {
                config,
                transport,
                clock,
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                started: AtomicBool::new(false),
                cancel,
            }),
        }
    }

    /// Spawns the delivery task. Calling it again has no effect.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("QUEUE | Starting delivery task");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run().await });
        self.inner.wake.notify_one();
    }

    /// Appends an event and wakes the delivery task. Never fails and never blocks: when the
    /// queue is full the oldest events are dropped instead.
    pub fn enqueue(&self, raw: Map<String, Value>) {
        self.start();

        let id = identify_object(&raw);
        let payload = self.inner.wrap(raw, &id);
        let now = self.inner.clock.now();

        {
            let mut state = self.inner.lock_state();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.events.push_back(QueuedEvent {
                id,
                payload,
                attempts: 0,
                next_attempt_at: now,
                seq,
            });

            while state.events.len() > self.inner.config.max_queue {
                if let Some(evicted) = state.events.pop_front() {
                    state.failure_count += 1;
                    warn!(
                        "QUEUE | Queue full ({} events), dropping oldest event {}",
                        self.inner.config.max_queue, evicted.id
                    );
                }
            }
        }

        self.inner.wake.notify_one();
    }

    #[must_use]
    pub fn metrics(&self) -> QueueMetrics {
        let state = self.inner.lock_state();
        QueueMetrics {
            queue_len: state.events.len(),
            success_count: state.success_count,
            failure_count: state.failure_count,
            last_success_at: state.last_success_at,
        }
    }

    /// Copy of the pending events, head first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueuedEvent> {
        self.inner.lock_state().events.iter().cloned().collect()
    }
}

impl Inner {
    #[allow(clippy::expect_used)]
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("lock poisoned")
    }

    fn wrap(&self, mut payload: Map<String, Value>, id: &str) -> Map<String, Value> {
        if let Some(device_hint) = &self.config.device_hint {
            payload.insert(
                DEVICE_HINT_FIELD.to_string(),
                Value::String(device_hint.clone()),
            );
        }
        payload.insert(
            RECEIVED_AT_FIELD.to_string(),
            Value::String(iso8601(&self.clock.wall_time())),
        );
        payload.insert(EVENT_ID_FIELD.to_string(), Value::String(id.to_string()));
        payload
    }

    async fn run(self: Arc<Self>) {
        loop {
            match self.next_step() {
                Step::Idle => {
                    tokio::select! {
                        () = self.wake.notified() => {}
                        () = self.cancel.cancelled() => break,
                    }
                }
                Step::WaitUntil(deadline) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(deadline) => {}
                        () = self.wake.notified() => {}
                        () = self.cancel.cancelled() => break,
                    }
                }
                Step::Deliver(event) => {
                    let outcome = self.attempt(&event).await;
                    self.settle(&event, outcome);
                }
            }
        }
        debug!("QUEUE | Delivery task stopped");
    }

    fn next_step(&self) -> Step {
        let state = self.lock_state();
        match state.events.front() {
            None => Step::Idle,
            Some(head) if self.clock.now() < head.next_attempt_at => {
                Step::WaitUntil(head.next_attempt_at)
            }
            Some(head) => Step::Deliver(head.clone()),
        }
    }

    async fn attempt(&self, event: &QueuedEvent) -> DeliveryOutcome {
        let request = DeliveryRequest {
            event_id: &event.id,
            payload: &event.payload,
        };
        let timeout = self.config.attempt_timeout;
        let result = match tokio::time::timeout(timeout, self.transport.post(request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        let outcome = classify(&result);
        match (&result, outcome) {
            (Ok(response), DeliveryOutcome::Success) => {
                debug!("QUEUE | Delivered event {} ({})", event.id, response.status);
            }
            (Ok(response), DeliveryOutcome::Drop) => {
                error!(
                    "QUEUE | Event {} rejected with status {}, dropping: {}",
                    event.id,
                    response.status,
                    truncate(&response.body, MAX_LOGGED_BODY_CHARS)
                );
            }
            (Ok(response), DeliveryOutcome::Retry) => {
                warn!(
                    "QUEUE | Event {} failed with status {} (attempt {}): {}",
                    event.id,
                    response.status,
                    event.attempts + 1,
                    truncate(&response.body, MAX_LOGGED_BODY_CHARS)
                );
            }
            (Err(e), _) => {
                warn!(
                    "QUEUE | Event {} could not be sent (attempt {}): {e}",
                    event.id,
                    event.attempts + 1
                );
            }
        }
        outcome
    }

    fn settle(&self, event: &QueuedEvent, outcome: DeliveryOutcome) {
        let mut state = self.lock_state();
        match outcome {
            DeliveryOutcome::Success => {
                state.success_count += 1;
                state.last_success_at = Some(self.clock.wall_time());
            }
            DeliveryOutcome::Retry | DeliveryOutcome::Drop => state.failure_count += 1,
        }

        // the event may have been evicted while the request was in flight
        let still_head = state.events.front().map(|head| head.seq) == Some(event.seq);
        if !still_head {
            debug!("QUEUE | Event {} was evicted during delivery", event.id);
            return;
        }

        match outcome {
            DeliveryOutcome::Success | DeliveryOutcome::Drop => {
                state.events.pop_front();
            }
            DeliveryOutcome::Retry => {
                let now = self.clock.now();
                let queued = state.events.len();
                if let Some(head) = state.events.front_mut() {
                    head.attempts += 1;
                    let delay = retry_delay(
                        head.attempts,
                        self.config.base_delay,
                        self.config.max_delay,
                        jitter_factor(),
                    );
                    head.next_attempt_at = now + delay;
                    info!(
                        "QUEUE | Retrying event {} in {} ms ({} queued)",
                        head.id,
                        delay.as_millis(),
                        queued
                    );
                }
            }
        }
    }
}

/// Maps the result of one attempt to the queue's decision.
#[must_use]
pub fn classify(result: &Result<TransportResponse, TransportError>) -> DeliveryOutcome {
    match result {
        Ok(response) => match response.status {
            200..=299 => DeliveryOutcome::Success,
            400 | 401 | 403 => DeliveryOutcome::Drop,
            status if status >= 500 => DeliveryOutcome::Retry,
            _ => DeliveryOutcome::Drop,
        },
        Err(_) => DeliveryOutcome::Retry,
    }
}

/// `min(max_delay, base_delay * 2^(attempts - 1)) * jitter`, floored at one millisecond.
///
/// `attempts` is the number of failed attempts so far, so the first retry waits about
/// `base_delay`.
#[must_use]
pub fn retry_delay(attempts: u32, base_delay: Duration, max_delay: Duration, jitter: f64) -> Duration {
    let exponent = attempts.saturating_sub(1).min(63);
    let max_ms = max_delay.as_secs_f64() * 1000.0;
    let raw_ms = base_delay.as_secs_f64() * 1000.0 * 2f64.powi(exponent as i32);
    let capped_ms = if raw_ms.is_finite() { raw_ms.min(max_ms) } else { max_ms };
    let jittered_ms = (capped_ms * jitter).floor().max(1.0);
    Duration::from_millis(jittered_ms as u64)
}

fn jitter_factor() -> f64 {
    JITTER_MIN + fastrand::f64() * (JITTER_MAX - JITTER_MIN)
}

fn truncate(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let mut truncated: String = body.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}
