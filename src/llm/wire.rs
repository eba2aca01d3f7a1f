// Shared HTTP plumbing for the provider implementations: error
// classification, stream buffers and the channel-backed event stream.

use super::streaming::{ChatStream, StreamEvent};
use crate::error::LlmError;
use futures_util::stream;
use tokio::sync::mpsc;

/// Map a transport-level reqwest failure onto the gateway taxonomy.
pub(crate) fn classify_send_error(provider: &str, err: &reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout {
            provider: provider.to_string(),
            elapsed_ms: 0,
        }
    } else if err.is_connect() || err.is_request() {
        LlmError::Network {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    } else {
        LlmError::Provider {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }
}

/// Map a non-success HTTP response onto the gateway taxonomy. Consumes the
/// body for the diagnostic snippet; raw provider text never travels past
/// this point un-truncated.
pub(crate) async fn error_for_response(provider: &str, response: reqwest::Response) -> LlmError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let snippet = truncate(&body, 300);

    match status.as_u16() {
        401 | 403 => LlmError::Auth {
            provider: provider.to_string(),
        },
        429 => LlmError::RateLimited {
            provider: provider.to_string(),
        },
        400 | 413 if looks_like_overflow(&body) => LlmError::ContextOverflow {
            provider: provider.to_string(),
            tokens: 0,
            window: 0,
        },
        _ => LlmError::Provider {
            provider: provider.to_string(),
            message: format!("HTTP {status}: {snippet}"),
        },
    }
}

fn looks_like_overflow(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("context_length")
        || lower.contains("maximum context")
        || lower.contains("too many tokens")
        || lower.contains("prompt is too long")
}

pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

/// Bounded channel bridged into a `ChatStream`. Dropping the stream drops
/// the receiver, which makes the producer task's next send fail and exit,
/// releasing the provider connection.
pub(crate) fn channel_stream(
    capacity: usize,
) -> (mpsc::Sender<Result<StreamEvent, LlmError>>, ChatStream) {
    let (tx, rx) = mpsc::channel(capacity);
    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    (tx, Box::pin(stream))
}

/// Incremental splitter for `text/event-stream` bodies: feeds raw chunks
/// in, yields complete `data:` payloads out. Comment lines and non-data
/// fields are skipped.
#[derive(Debug, Default)]
pub(crate) struct SseBuffer {
    buf: String,
}

impl SseBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}

/// Incremental splitter for newline-delimited JSON bodies.
#[derive(Debug, Default)]
pub(crate) struct NdjsonBuffer {
    buf: String,
}

impl NdjsonBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }
}

/// The reqwest client every provider builds: short connect timeout, pooled
/// keep-alive connections, no overall timeout (streams outlive any fixed
/// deadline; the gateway owns per-call deadlines).
pub(crate) fn http_client(connect_timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(connect_timeout_secs))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .tcp_keepalive(std::time::Duration::from_secs(60))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
