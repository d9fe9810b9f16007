//! Watch stream consumer
//!
//! Holds one long-lived `GET /v1/tasks?watch=true` request open and feeds
//! every decoded event to an [`EventHandler`]. Bad lines and handler
//! errors are logged and skipped; only losing the connection ends a
//! session.

use std::fmt;
use std::time::Duration;

use futures_util::{pin_mut, Stream, StreamExt};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchOutcome, EventHandler};
use crate::error::{Error, Result};
use crate::types::Event;

/// Longest stream line echoed into a log message
const MAX_LOGGED_LINE: usize = 200;

/// Per-session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// Non-blank lines received
    pub lines: u64,
    /// Lines that were not valid JSON
    pub malformed: u64,
    /// Events the handler rejected
    pub errors: u64,
    /// Events that started an execution
    pub dispatched: u64,
    /// Events handled without dispatching
    pub skipped: u64,
}

// ─────────────────────────────────────────────────────────────────
// Watcher
// ─────────────────────────────────────────────────────────────────

/// Client for the task watch endpoint
#[derive(Debug, Clone)]
pub struct TaskWatcher {
    client: Client,
    url: String,
}

impl TaskWatcher {
    /// Create a watcher for the server at `base_url`
    ///
    /// The stream has no overall timeout; only connecting is bounded.
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/v1/tasks?watch=true", base_url.trim_end_matches('/')),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run one watch session
    ///
    /// Never returns `Ok`: the session ends with `ConnectionFailed` if the
    /// stream cannot be opened and `ConnectionLost` once it drops.
    pub async fn watch<H>(&self, handler: &H) -> Result<()>
    where
        H: EventHandler + ?Sized,
    {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::connection_failed(&self.url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::connection_failed(
                &self.url,
                format!("server returned {}", status),
            ));
        }

        info!(url = %self.url, "Watching for task events");

        let mut stats = WatchStats::default();
        let lost = consume_lines(response.bytes_stream(), handler, &mut stats).await;

        info!(
            lines = stats.lines,
            malformed = stats.malformed,
            errors = stats.errors,
            dispatched = stats.dispatched,
            skipped = stats.skipped,
            "Watch session ended"
        );
        Err(lost)
    }
}

// ─────────────────────────────────────────────────────────────────
// Line Framing
// ─────────────────────────────────────────────────────────────────

/// Feed every non-blank line of `stream` to `handler`
///
/// Chunks are re-framed on `\n`. Returns the `ConnectionLost` error that
/// ended the stream.
pub async fn consume_lines<S, B, E, H>(stream: S, handler: &H, stats: &mut WatchStats) -> Error
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
    H: EventHandler + ?Sized,
{
    pin_mut!(stream);
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                return Error::ConnectionLost {
                    message: format!("watch stream failed: {}", e),
                }
            }
        };

        buffer.extend_from_slice(chunk.as_ref());
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            process_line(&line[..pos], handler, stats);
        }
    }

    // Unterminated final line
    if !buffer.is_empty() {
        process_line(&buffer, handler, stats);
    }

    Error::ConnectionLost {
        message: "watch stream closed by server".to_string(),
    }
}

fn process_line<H>(raw: &[u8], handler: &H, stats: &mut WatchStats)
where
    H: EventHandler + ?Sized,
{
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    stats.lines += 1;

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            stats.malformed += 1;
            warn!(error = %e, line = %truncate(line), "Skipping malformed stream line");
            return;
        }
    };

    match Event::from_json(value).and_then(|event| handler.handle(&event)) {
        Ok(DispatchOutcome::Dispatched) => stats.dispatched += 1,
        Ok(outcome) => {
            stats.skipped += 1;
            debug!(outcome = %outcome, "Event not dispatched");
        }
        Err(e) => {
            stats.errors += 1;
            warn!(error = %e, "Failed to handle event");
        }
    }
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(MAX_LOGGED_LINE) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records every event it is given
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Event>>,
    }

    impl EventHandler for Recorder {
        fn handle(&self, event: &Event) -> Result<DispatchOutcome> {
            self.seen.lock().push(event.clone());
            if event.event_type.is_dispatchable() {
                Ok(DispatchOutcome::Dispatched)
            } else {
                Ok(DispatchOutcome::Ignored(event.event_type))
            }
        }
    }

    fn chunks(parts: &[&str]) -> impl Stream<Item = std::result::Result<Vec<u8>, std::io::Error>> {
        let owned: Vec<std::result::Result<Vec<u8>, std::io::Error>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        futures_util::stream::iter(owned)
    }

    fn created(id: &str) -> String {
        format!(
            r#"{{"type":"Created","data":{{"id":"{}","method_path":"math.add","args":[1,2]}}}}"#,
            id
        )
    }

    #[tokio::test]
    async fn test_malformed_line_then_valid_events() {
        let body = format!("{{not json\n{}\n{}\n{}\n", created("a"), created("b"), created("c"));
        let recorder = Recorder::default();
        let mut stats = WatchStats::default();

        let err = consume_lines(chunks(&[body.as_str()]), &recorder, &mut stats).await;

        assert!(matches!(err, Error::ConnectionLost { .. }));
        assert_eq!(recorder.seen.lock().len(), 3);
        assert_eq!(stats.lines, 4);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.dispatched, 3);
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let line = created("split");
        let (head, tail) = line.split_at(17);
        let recorder = Recorder::default();
        let mut stats = WatchStats::default();

        consume_lines(chunks(&[head, tail, "\r\n\n  \n"]), &recorder, &mut stats).await;

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].decode_task().unwrap().id, "split");
        assert_eq!(stats.lines, 1);
    }

    #[tokio::test]
    async fn test_final_unterminated_line_is_processed() {
        let body = format!("{}\n{}", created("a"), created("b"));
        let recorder = Recorder::default();
        let mut stats = WatchStats::default();

        consume_lines(chunks(&[body.as_str()]), &recorder, &mut stats).await;
        assert_eq!(recorder.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_handler_errors_do_not_stop_stream() {
        struct Failing;
        impl EventHandler for Failing {
            fn handle(&self, _event: &Event) -> Result<DispatchOutcome> {
                Err(Error::Internal("handler failed".into()))
            }
        }

        let body = format!("{}\n{}\n{{\"data\":{{}}}}\n", created("a"), created("b"));
        let mut stats = WatchStats::default();
        consume_lines(chunks(&[body.as_str()]), &Failing, &mut stats).await;

        assert_eq!(stats.lines, 3);
        assert_eq!(stats.errors, 3);
        assert_eq!(stats.dispatched, 0);
    }

    #[tokio::test]
    async fn test_transport_error_is_connection_lost() {
        let items: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(format!("{}\n", created("a")).into_bytes()),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(format!("{}\n", created("b")).into_bytes()),
        ];
        let recorder = Recorder::default();
        let mut stats = WatchStats::default();

        let err = consume_lines(futures_util::stream::iter(items), &recorder, &mut stats).await;

        assert!(err.to_string().contains("reset"));
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_unreachable_server() {
        let watcher = TaskWatcher::new("http://127.0.0.1:9/", Duration::from_secs(2)).unwrap();
        assert_eq!(watcher.url(), "http://127.0.0.1:9/v1/tasks?watch=true");

        let err = watcher.watch(&Recorder::default()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed { .. }));
    }
}
