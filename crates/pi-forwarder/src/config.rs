// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::queue::QueueConfig;
use crate::sources::cli_listen::{CliListenConfig, DEFAULT_EXECUTABLE};
use crate::transport::HttpTransportConfig;

const DEFAULT_INGEST_PATH: &str = "ingest";

/// Which source feeds the delivery queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    /// Newline-delimited JSON on standard input
    #[default]
    Stdin,
    /// Supervised `meshtastic --listen`
    Cli,
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stdin" => Ok(SourceKind::Stdin),
            "cli" => Ok(SourceKind::Cli),
            _ => Err(ConfigError::InvalidValue {
                name: "FORWARDER_SOURCE",
                value: s.to_string(),
            }),
        }
    }
}

/// Configuration of the forwarder process
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Base URL of the ingestion service
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Path below `/api/` events are posted to
    pub ingest_path: String,
    /// Merged into every payload as `deviceHint`
    pub device_hint: Option<String>,
    pub max_queue: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Per-attempt request timeout
    pub timeout: Duration,
    pub source: SourceKind,
    pub cli_path: String,
    /// Serial device passed to the CLI as `--port`
    pub cli_port: Option<String>,
    pub restart_base_delay: Duration,
    pub restart_max_delay: Duration,
    pub kill_grace: Duration,
    /// Return from the stdin source at end of input instead of waiting for a signal
    pub exit_on_eof: bool,
    pub metrics_interval: Duration,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        let queue = QueueConfig::default();
        let cli = CliListenConfig::default();
        Self {
            endpoint: String::new(),
            api_key: None,
            ingest_path: DEFAULT_INGEST_PATH.to_string(),
            device_hint: None,
            max_queue: queue.max_queue,
            retry_base_delay: queue.base_delay,
            retry_max_delay: queue.max_delay,
            timeout: queue.attempt_timeout,
            source: SourceKind::default(),
            cli_path: DEFAULT_EXECUTABLE.to_string(),
            cli_port: None,
            restart_base_delay: cli.base_restart_delay,
            restart_max_delay: cli.max_restart_delay,
            kill_grace: cli.kill_grace,
            exit_on_eof: false,
            metrics_interval: Duration::from_secs(60),
            https_proxy: None,
            log_level: "info".to_string(),
        }
    }
}

/// Reads a variable, treating an empty value as unset.
fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
    }
}

fn millis_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(parse_var::<u64>(name)?.map_or(default, Duration::from_millis))
}

fn bool_var(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { name, value: raw }),
        },
    }
}

impl ForwarderConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let endpoint = var("FORWARDER_ENDPOINT").ok_or(ConfigError::Missing("FORWARDER_ENDPOINT"))?;
        let ingest_path = var("FORWARDER_INGEST_PATH").unwrap_or(defaults.ingest_path);
        let source = match var("FORWARDER_SOURCE") {
            Some(raw) => raw.parse()?,
            None => defaults.source,
        };
        let https_proxy = var("FORWARDER_PROXY_HTTPS").or_else(|| var("HTTPS_PROXY"));
        let log_level = var("FORWARDER_LOG_LEVEL")
            .map(|val| val.trim().to_lowercase())
            .unwrap_or(defaults.log_level);

        let config = Self {
            endpoint: endpoint.trim().to_string(),
            api_key: var("FORWARDER_API_KEY"),
            ingest_path,
            device_hint: var("FORWARDER_DEVICE_HINT"),
            max_queue: parse_var("FORWARDER_MAX_QUEUE")?.unwrap_or(defaults.max_queue),
            retry_base_delay: millis_var("FORWARDER_RETRY_BASE_MS", defaults.retry_base_delay)?,
            retry_max_delay: millis_var("FORWARDER_RETRY_MAX_MS", defaults.retry_max_delay)?,
            timeout: millis_var("FORWARDER_TIMEOUT_MS", defaults.timeout)?,
            source,
            cli_path: var("FORWARDER_CLI_PATH").unwrap_or(defaults.cli_path),
            cli_port: var("FORWARDER_CLI_PORT"),
            restart_base_delay: millis_var("FORWARDER_RESTART_BASE_MS", defaults.restart_base_delay)?,
            restart_max_delay: millis_var("FORWARDER_RESTART_MAX_MS", defaults.restart_max_delay)?,
            kill_grace: millis_var("FORWARDER_KILL_GRACE_MS", defaults.kill_grace)?,
            exit_on_eof: bool_var("FORWARDER_EXIT_ON_EOF", defaults.exit_on_eof)?,
            metrics_interval: parse_var::<u64>("FORWARDER_METRICS_INTERVAL_SECS")?
                .map_or(defaults.metrics_interval, Duration::from_secs),
            https_proxy,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match url::Url::parse(&self.endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
            _ => {
                return Err(ConfigError::InvalidValue {
                    name: "FORWARDER_ENDPOINT",
                    value: self.endpoint.clone(),
                })
            }
        }

        if self.max_queue == 0 {
            return Err(ConfigError::Invalid(
                "FORWARDER_MAX_QUEUE must be greater than 0".to_string(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "FORWARDER_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.retry_base_delay.is_zero() || self.retry_base_delay > self.retry_max_delay {
            return Err(ConfigError::Invalid(format!(
                "Retry delays must satisfy 0 < base ({:?}) <= max ({:?})",
                self.retry_base_delay, self.retry_max_delay
            )));
        }

        if self.restart_base_delay.is_zero() || self.restart_base_delay > self.restart_max_delay {
            return Err(ConfigError::Invalid(format!(
                "Restart delays must satisfy 0 < base ({:?}) <= max ({:?})",
                self.restart_base_delay, self.restart_max_delay
            )));
        }

        if self.metrics_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "FORWARDER_METRICS_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_queue: self.max_queue,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            attempt_timeout: self.timeout,
            device_hint: self.device_hint.clone(),
        }
    }

    pub fn transport_config(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            endpoint: self.endpoint.clone(),
            ingest_path: self.ingest_path.clone(),
            api_key: self.api_key.clone(),
            timeout: self.timeout,
            https_proxy: self.https_proxy.clone(),
        }
    }

    pub fn cli_config(&self) -> CliListenConfig {
        CliListenConfig {
            base_restart_delay: self.restart_base_delay,
            max_restart_delay: self.restart_max_delay,
            kill_grace: self.kill_grace,
            ..CliListenConfig::new(self.cli_path.clone(), self.cli_port.as_deref())
        }
    }
}
