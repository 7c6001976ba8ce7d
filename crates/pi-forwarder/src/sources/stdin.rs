// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::SourceError;
use crate::sources::{decode_line, parse_object, should_sample, EventHandler};

/// Line counters reported when a [`StdinSource`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineStats {
    pub parsed_objects: u64,
    pub invalid_lines: u64,
}

/// Reads newline-delimited JSON objects and forwards each one.
pub struct StdinSource<R> {
    reader: R,
    exit_on_eof: bool,
    cancel: CancellationToken,
}

impl StdinSource<BufReader<Stdin>> {
    /// Source over the process standard input.
    pub fn stdin(exit_on_eof: bool, cancel: CancellationToken) -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), exit_on_eof, cancel)
    }
}

impl<R> StdinSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R, exit_on_eof: bool, cancel: CancellationToken) -> Self {
        Self {
            reader,
            exit_on_eof,
            cancel,
        }
    }

    /// Reads until end of input.
    ///
    /// With `exit_on_eof` unset the source keeps the process alive after end of input
    /// and only returns once the cancellation token fires.
    pub async fn run(&mut self, handler: &dyn EventHandler) -> Result<LineStats, SourceError> {
        let mut stats = LineStats::default();
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = tokio::select! {
                read = self.reader.read_until(b'\n', &mut line) => read?,
                () = self.cancel.cancelled() => {
                    info!("STDIN | Stop requested, {} events forwarded", stats.parsed_objects);
                    return Ok(stats);
                }
            };
            if read == 0 {
                break;
            }

            let Some(trimmed) = decode_line(&line) else {
                stats.invalid_lines += 1;
                if should_sample(stats.invalid_lines) {
                    debug!(
                        "STDIN | Skipping line that is not valid UTF-8 ({} invalid so far)",
                        stats.invalid_lines
                    );
                }
                continue;
            };
            if trimmed.is_empty() {
                continue;
            }

            match parse_object(trimmed) {
                Some(event) => {
                    stats.parsed_objects += 1;
                    handler.on_event(event).await;
                }
                None => {
                    stats.invalid_lines += 1;
                    if should_sample(stats.invalid_lines) {
                        debug!(
                            "STDIN | Skipping line that is not a JSON object ({} so far): {}",
                            stats.invalid_lines, trimmed
                        );
                    }
                }
            }
        }

        info!(
            "STDIN | End of input: {} events forwarded, {} invalid lines",
            stats.parsed_objects, stats.invalid_lines
        );
        if !self.exit_on_eof {
            debug!("STDIN | Waiting for stop signal");
            self.cancel.cancelled().await;
        }
        Ok(stats)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sources::test_support::RecordingHandler;
    use serde_json::json;
    use std::io::Cursor;
    use std::time::Duration;

    fn source(input: &str, exit_on_eof: bool, cancel: CancellationToken) -> StdinSource<Cursor<Vec<u8>>> {
        StdinSource::new(Cursor::new(input.as_bytes().to_vec()), exit_on_eof, cancel)
    }

    #[tokio::test]
    async fn test_invalid_line_then_object_then_eof() {
        let handler = RecordingHandler::default();
        let mut source = source("not json\n{\"a\":1}\n", true, CancellationToken::new());

        let stats = source.run(&handler).await.unwrap();

        assert_eq!(
            stats,
            LineStats {
                parsed_objects: 1,
                invalid_lines: 1
            }
        );
        let events = handler.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("a"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_blank_lines_are_not_counted() {
        let handler = RecordingHandler::default();
        let mut source = source("\n   \n{\"a\":1}\r\n\n{\"b\":2}", true, CancellationToken::new());

        let stats = source.run(&handler).await.unwrap();

        assert_eq!(stats.parsed_objects, 2);
        assert_eq!(stats.invalid_lines, 0);
        assert_eq!(handler.events()[1].get("b"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_non_object_values_are_invalid() {
        let handler = RecordingHandler::default();
        let mut source = source("[1,2]\n42\n\"s\"\nnull\n{\"ok\":true}\n", true, CancellationToken::new());

        let stats = source.run(&handler).await.unwrap();

        assert_eq!(stats.invalid_lines, 4);
        assert_eq!(handler.events().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_line_is_skipped() {
        let handler = RecordingHandler::default();
        let mut source = StdinSource::new(
            Cursor::new(b"\xff\xfe garbage\n{\"a\":1}\n".to_vec()),
            true,
            CancellationToken::new(),
        );

        let stats = source.run(&handler).await.unwrap();

        assert_eq!(
            stats,
            LineStats {
                parsed_objects: 1,
                invalid_lines: 1
            }
        );
        assert_eq!(handler.events()[0].get("a"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_events_are_forwarded_in_order() {
        let handler = RecordingHandler::default();
        let input: String = (0..5).map(|i| format!("{{\"n\":{i}}}\n")).collect();
        let mut source = source(&input, true, CancellationToken::new());

        source.run(&handler).await.unwrap();

        let order: Vec<_> = handler.events().iter().map(|e| e["n"].clone()).collect();
        assert_eq!(order, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eof_waits_for_cancellation_when_not_exiting() {
        let handler = RecordingHandler::default();
        let cancel = CancellationToken::new();
        let mut source = source("{\"a\":1}\n", false, cancel.clone());

        let still_running = tokio::time::timeout(Duration::from_secs(3600), source.run(&handler)).await;
        assert!(still_running.is_err());
        assert_eq!(handler.events().len(), 1);

        cancel.cancel();
        let stats = source.run(&handler).await.unwrap();
        assert_eq!(stats.parsed_objects, 0);
    }

    #[tokio::test]
    async fn test_cancelled_source_returns_without_reading() {
        let handler = RecordingHandler::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (reader, _writer) = tokio::io::duplex(64);
        let mut source = StdinSource::new(BufReader::new(reader), true, cancel);

        let stats = source.run(&handler).await.unwrap();

        assert_eq!(stats, LineStats::default());
        assert!(handler.events().is_empty());
    }
}
