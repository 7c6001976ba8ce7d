// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Supervision of the Meshtastic CLI running in `--listen` mode.
//!
//! The CLI prints JSON on stdout when it can and otherwise dumps received packets as
//! Python dicts on stderr, interleaved with its own logging. Both streams are consumed
//! concurrently. The child is restarted with a doubling delay whenever it exits while no
//! stop was requested.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::sources::packet_dump::{extract_packet, PACKET_MARKER};
use crate::sources::{decode_line, parse_object, should_sample, EventHandler};

/// Default executable for the CLI source
pub const DEFAULT_EXECUTABLE: &str = "meshtastic";

/// Case-insensitive substrings that make a stderr line worth a warning
const IMPORTANT_STDERR_MARKERS: [&str; 9] = [
    "error",
    "os error",
    "oserror",
    "permission denied",
    "resource busy",
    "could not exclusively lock",
    "port is already in use",
    "traceback",
    "exception",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliListenConfig {
    pub executable: String,
    /// Arguments passed to every spawned child
    pub args: Vec<String>,
    pub base_restart_delay: Duration,
    pub max_restart_delay: Duration,
    /// Time between SIGTERM and a forced kill when stopping
    pub kill_grace: Duration,
}

impl CliListenConfig {
    /// Configuration running `<executable> --listen [--port <port>]`.
    pub fn new(executable: impl Into<String>, port: Option<&str>) -> Self {
        let mut args = vec!["--listen".to_string()];
        if let Some(port) = port {
            args.push("--port".to_string());
            args.push(port.to_string());
        }
        Self {
            executable: executable.into(),
            args,
            ..Self::default()
        }
    }
}

impl Default for CliListenConfig {
    fn default() -> Self {
        Self {
            executable: DEFAULT_EXECUTABLE.to_string(),
            args: vec!["--listen".to_string()],
            base_restart_delay: Duration::from_secs(1),
            max_restart_delay: Duration::from_secs(30),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Per-stream counters for one child lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub parsed_objects: u64,
    pub recovered_packets: u64,
    pub non_json_lines: u64,
    pub important_lines: u64,
    pub noise_lines: u64,
}

impl StreamStats {
    pub fn events(&self) -> u64 {
        self.parsed_objects + self.recovered_packets
    }
}

/// Totals over a whole [`CliListenSource::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub spawns: u64,
    pub spawn_failures: u64,
    pub unexpected_exits: u64,
    pub events: u64,
}

enum ChildOutcome {
    SpawnFailed,
    Exited {
        status: io::Result<ExitStatus>,
        events: u64,
    },
}

pub struct CliListenSource {
    config: CliListenConfig,
    cancel: CancellationToken,
}

impl CliListenSource {
    pub fn new(config: CliListenConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.config.executable);
        command
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Keeps the CLI running until the cancellation token fires.
    pub async fn run(&self, handler: &dyn EventHandler) -> SupervisorStats {
        let mut stats = SupervisorStats::default();
        let mut restart_delay = self.config.base_restart_delay;

        while !self.cancel.is_cancelled() {
            let description = match self.run_child(handler).await {
                ChildOutcome::SpawnFailed => {
                    stats.spawn_failures += 1;
                    "failed to start".to_string()
                }
                ChildOutcome::Exited { status, events } => {
                    stats.spawns += 1;
                    stats.events += events;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    match status {
                        Ok(status) => format!("exited ({status}) after {events} events"),
                        Err(e) => format!("could not be waited on ({e}) after {events} events"),
                    }
                }
            };
            if self.cancel.is_cancelled() {
                break;
            }

            stats.unexpected_exits += 1;
            error!(
                "CLI | {} {}, restarting in {} ms",
                self.config.executable,
                description,
                restart_delay.as_millis()
            );
            tokio::select! {
                () = tokio::time::sleep(restart_delay) => {}
                () = self.cancel.cancelled() => break,
            }
            restart_delay = next_restart_delay(restart_delay, self.config.max_restart_delay);
        }

        info!(
            "CLI | Supervisor stopped after {} spawns, {} events forwarded",
            stats.spawns, stats.events
        );
        stats
    }

    async fn run_child(&self, handler: &dyn EventHandler) -> ChildOutcome {
        let mut child = match self.command().spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("CLI | Failed to spawn {}: {}", self.config.executable, e);
                return ChildOutcome::SpawnFailed;
            }
        };
        info!(
            "CLI | Started {} {} (pid {})",
            self.config.executable,
            self.config.args.join(" "),
            child.id().map_or_else(|| "unknown".to_string(), |pid| pid.to_string())
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let streams = async {
            tokio::join!(consume_stdout(stdout, handler), consume_stderr(stderr, handler))
        };
        let exit = async {
            tokio::select! {
                status = child.wait() => status,
                () = self.cancel.cancelled() => self.terminate(&mut child).await,
            }
        };
        let ((out, err), status) = tokio::join!(streams, exit);

        debug!("CLI | Child streams closed, stdout {:?}, stderr {:?}", out, err);
        ChildOutcome::Exited {
            status,
            events: out.events() + err.events(),
        }
    }

    /// SIGTERM, then a forced kill once the grace period has elapsed.
    async fn terminate(&self, child: &mut Child) -> io::Result<ExitStatus> {
        info!("CLI | Stop requested, terminating {}", self.config.executable);
        request_termination(child);
        match tokio::time::timeout(self.config.kill_grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    "CLI | {} still running after {} ms, killing it",
                    self.config.executable,
                    self.config.kill_grace.as_millis()
                );
                child.start_kill()?;
                child.wait().await
            }
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!("CLI | Failed to send SIGTERM to {}: {}", pid, e);
        if let Err(e) = child.start_kill() {
            warn!("CLI | Failed to kill {}: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!("CLI | Failed to kill child: {}", e);
    }
}

/// Doubles the delay, capped at `max`.
pub fn next_restart_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// True when a stderr line looks like a real problem rather than CLI chatter.
pub fn is_important(line: &str) -> bool {
    let lowered = line.to_lowercase();
    IMPORTANT_STDERR_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Forwards every JSON object printed on stdout.
pub async fn consume_stdout<R>(stream: Option<R>, handler: &dyn EventHandler) -> StreamStats
where
    R: AsyncRead + Unpin,
{
    let mut stats = StreamStats::default();
    let Some(stream) = stream else {
        return stats;
    };
    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                error!("CLI | Failed to read stdout: {}", e);
                break;
            }
        }
        let Some(line) = decode_line(&raw) else {
            stats.non_json_lines += 1;
            if should_sample(stats.non_json_lines) {
                debug!(
                    "CLI | Ignoring stdout line that is not valid UTF-8 ({} non-JSON so far)",
                    stats.non_json_lines
                );
            }
            continue;
        };
        if line.is_empty() {
            continue;
        }
        match parse_object(line) {
            Some(event) => {
                stats.parsed_objects += 1;
                handler.on_event(event).await;
            }
            None => {
                stats.non_json_lines += 1;
                if should_sample(stats.non_json_lines) {
                    debug!(
                        "CLI | Ignoring non-JSON stdout ({} so far): {}",
                        stats.non_json_lines, line
                    );
                }
            }
        }
    }
    stats
}

/// Recovers events from stderr and surfaces errors the CLI reports there.
pub async fn consume_stderr<R>(stream: Option<R>, handler: &dyn EventHandler) -> StreamStats
where
    R: AsyncRead + Unpin,
{
    let mut stats = StreamStats::default();
    let Some(stream) = stream else {
        return stats;
    };
    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                error!("CLI | Failed to read stderr: {}", e);
                break;
            }
        }
        let Some(line) = decode_line(&raw) else {
            stats.noise_lines += 1;
            if should_sample(stats.noise_lines) {
                debug!(
                    "CLI | Ignoring stderr line that is not valid UTF-8 ({} noise lines so far)",
                    stats.noise_lines
                );
            }
            continue;
        };
        if line.is_empty() {
            continue;
        }

        if let Some(event) = parse_object(line) {
            stats.parsed_objects += 1;
            handler.on_event(event).await;
            continue;
        }
        if line.contains(PACKET_MARKER) {
            if let Some(event) = extract_packet(line) {
                stats.recovered_packets += 1;
                handler.on_event(event).await;
                continue;
            }
        }
        if is_important(line) {
            stats.important_lines += 1;
            warn!("CLI | {}", line);
        } else {
            stats.noise_lines += 1;
            if should_sample(stats.noise_lines) {
                debug!("CLI | stderr ({} noise lines so far): {}", stats.noise_lines, line);
            }
        }
    }
    stats
}
