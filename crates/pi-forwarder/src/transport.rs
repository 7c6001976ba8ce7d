// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Outbound HTTP delivery of queued events.
//!
//! The delivery queue only depends on the [`Transport`] trait; [`HttpTransport`] is the
//! reqwest implementation used in production. Each call performs exactly one POST, retry
//! decisions belong to the queue.

use async_trait::async_trait;
use core::time::Duration;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::errors::TransportError;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Response bodies are only kept for logging, so reading stops after this many bytes
const MAX_BODY_BYTES: usize = 4096;

/// One delivery attempt for one event
#[derive(Debug, Clone, Copy)]
pub struct DeliveryRequest<'a> {
    pub event_id: &'a str,
    pub payload: &'a Map<String, Value>,
}

/// What the remote endpoint answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends the payload once. Any non-2xx status is returned as `Ok`, only failures to
    /// obtain a response at all are errors.
    async fn post(&self, request: DeliveryRequest<'_>) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Base URL of the ingestion service, e.g. `https://maps.example.org`
    pub endpoint: String,
    /// Path below `/api/`
    pub ingest_path: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub https_proxy: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &HttpTransportConfig) -> Result<Self, TransportError> {
        let client = build_client(config.https_proxy.as_deref(), config.timeout)?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = &config.api_key {
            let value = HeaderValue::from_str(api_key)
                .map_err(|e| TransportError::ClientBuild(format!("invalid API key header: {e}")))?;
            headers.insert(API_KEY_HEADER, value);
        }
        Ok(HttpTransport {
            client,
            url: ingest_url(&config.endpoint, &config.ingest_path),
            headers,
            timeout: config.timeout,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: DeliveryRequest<'_>) -> Result<TransportResponse, TransportError> {
        let mut headers = self.headers.clone();
        let idempotency_key = HeaderValue::from_str(request.event_id)
            .map_err(|e| TransportError::Request(format!("invalid event id header: {e}")))?;
        headers.insert(IDEMPOTENCY_KEY_HEADER, idempotency_key);

        let response = self
            .client
            .post(&self.url)
            .headers(headers)
            .json(request.payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(self.timeout)
                } else {
                    TransportError::Request(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = read_body(response, &self.url).await;
        debug!("QUEUE | {} answered {status} for event {}", self.url, request.event_id);
        Ok(TransportResponse { status, body })
    }
}

/// Reads at most [`MAX_BODY_BYTES`] of the body. A failed read keeps what was received.
async fn read_body(mut response: reqwest::Response, url: &str) -> String {
    let mut body = Vec::new();
    while body.len() < MAX_BODY_BYTES {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let room = MAX_BODY_BYTES - body.len();
                body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            }
            Ok(None) => break,
            Err(e) => {
                debug!("QUEUE | Failed to read response body from {url}: {e}");
                break;
            }
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Joins the endpoint base and the ingest path into `<base>/api/<path>`.
#[must_use]
pub fn ingest_url(endpoint: &str, ingest_path: &str) -> String {
    format!(
        "{}/api/{}",
        endpoint.trim_end_matches('/'),
        ingest_path.trim_matches('/')
    )
}

fn build_client(https_proxy: Option<&str>, timeout: Duration) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy) = https_proxy {
        match reqwest::Proxy::https(proxy) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(e) => error!("Unable to parse proxy configuration: {e}, no proxy will be used"),
        }
    }
    builder
        .build()
        .map_err(|e| TransportError::ClientBuild(e.to_string()))
}
