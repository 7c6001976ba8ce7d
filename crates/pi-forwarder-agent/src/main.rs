// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, process::ExitCode, sync::Arc};
use tokio::time::{interval, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pi_forwarder::{
    clock::{iso8601, SystemClock},
    config::{ForwarderConfig, SourceKind},
    queue::{DeliveryQueue, QueueMetrics},
    sources::{cli_listen::CliListenSource, stdin::StdinSource},
    transport::HttpTransport,
};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = ForwarderConfig::from_env();

    let log_level = match &config {
        Ok(config) => config.log_level.clone(),
        Err(_) => env::var("FORWARDER_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or("info".to_string()),
    };
    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }

    debug!("Logging subsystem enabled");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading forwarder configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let transport = match HttpTransport::new(&config.transport_config()) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("Error creating HTTP transport: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Forwarding {:?} events to {}",
        config.source,
        transport.url()
    );

    let cancel = CancellationToken::new();
    let queue = DeliveryQueue::new(
        config.queue_config(),
        transport,
        Arc::new(SystemClock),
        cancel.child_token(),
    );
    queue.start();

    tokio::spawn(wait_for_shutdown(cancel.clone()));
    tokio::spawn(report_metrics(
        queue.clone(),
        config.metrics_interval,
        cancel.clone(),
    ));

    let exit_code = match config.source {
        SourceKind::Stdin => {
            let mut source = StdinSource::stdin(config.exit_on_eof, cancel.clone());
            match source.run(&queue).await {
                Ok(stats) => {
                    info!(
                        "Stdin source finished: {} events, {} invalid lines",
                        stats.parsed_objects, stats.invalid_lines
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("Stdin source failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        SourceKind::Cli => {
            let source = CliListenSource::new(config.cli_config(), cancel.clone());
            let stats = source.run(&queue).await;
            info!(
                "CLI source finished: {} spawns, {} events",
                stats.spawns, stats.events
            );
            ExitCode::SUCCESS
        }
    };

    // Give pending deliveries one request timeout to go out when input simply ended.
    drain(&queue, config.timeout, &cancel).await;
    cancel.cancel();

    log_metrics("Final", &queue.metrics());
    exit_code
}

async fn drain(queue: &DeliveryQueue, budget: Duration, cancel: &CancellationToken) {
    let deadline = Instant::now() + budget;
    let mut poll = interval(DRAIN_POLL_INTERVAL);
    while queue.metrics().queue_len > 0 && Instant::now() < deadline {
        tokio::select! {
            _ = poll.tick() => {}
            () = cancel.cancelled() => return,
        }
    }
    let pending = queue.metrics().queue_len;
    if pending > 0 {
        warn!("Exiting with {pending} undelivered events");
    }
}

async fn report_metrics(queue: DeliveryQueue, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.tick().await; // discard first tick, which is instantaneous
    loop {
        tokio::select! {
            _ = ticker.tick() => log_metrics("Periodic", &queue.metrics()),
            () = cancel.cancelled() => return,
        }
    }
}

fn log_metrics(label: &str, metrics: &QueueMetrics) {
    info!(
        "{label} metrics: queue_len={} success={} failure={} last_success_at={}",
        metrics.queue_len,
        metrics.success_count,
        metrics.failure_count,
        metrics
            .last_success_at
            .as_ref()
            .map_or_else(|| "never".to_string(), iso8601)
    );
}

#[cfg(unix)]
async fn wait_for_shutdown(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        _ => {
            warn!("Unable to install unix signal handlers, falling back to ctrl-c");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Unable to listen for shutdown signal: {e}");
                return;
            }
            info!("Received ctrl-c, shutting down");
            cancel.cancel();
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        () = cancel.cancelled() => return,
    }
    cancel.cancel();
}

#[cfg(not(unix))]
async fn wait_for_shutdown(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Unable to listen for shutdown signal: {e}");
                return;
            }
            info!("Received ctrl-c, shutting down");
        }
        () = cancel.cancelled() => return,
    }
    cancel.cancel();
}
