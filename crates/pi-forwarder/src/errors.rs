// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the forwarding pipeline.

/// Errors raised while loading or validating the forwarder configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(&'static str),

    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors returned by a [`crate::transport::Transport`] for a single delivery attempt.
///
/// Every variant is treated as transient by the delivery queue.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Unable to build HTTP client: {0}")]
    ClientBuild(String),
}

/// Errors that end an ingestion source
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to read from input: {0}")]
    Io(#[from] std::io::Error),
}
