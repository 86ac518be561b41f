use std::time::Instant;

use http::{Method, Uri};
use tracing::info;

/// Per-request access-log record: request identity, traffic counters and
/// the start timestamp armed on the first byte of the request.
pub(crate) struct AccessLog {
    method: String,
    url: String,
    local: String,
    remote: String,
    pub(crate) received: u64,
    pub(crate) sent: u64,
    start: Option<Instant>,
}

impl AccessLog {
    pub fn new(local: String, remote: String) -> Self {
        Self { method: String::new(), url: String::new(), local, remote, received: 0, sent: 0, start: None }
    }

    /// Arms the request-start timestamp; called when the first byte of a
    /// request is observed.
    pub fn arm(&mut self) {
        self.start = Some(Instant::now());
    }

    pub fn record_request(&mut self, method: &Method, uri: &Uri) {
        self.method = method.to_string();
        self.url = uri.to_string();
    }

    pub fn reset(&mut self) {
        self.method.clear();
        self.url.clear();
        self.received = 0;
        self.sent = 0;
        self.start = None;
    }

    /// Writes the single access-log line for this request.
    pub fn emit(&self, status: u16) {
        let elapsed_us = self.start.map(|start| start.elapsed().as_micros() as u64).unwrap_or(0);
        info!(
            "access_log_entry: method: {}, url: {}, local: {}, remote: {}, status: {}, received: {}, sent: {}, time: {} us",
            if self.method.is_empty() { "-" } else { &self.method },
            if self.url.is_empty() { "-" } else { &self.url },
            self.local,
            self.remote,
            status,
            self.received,
            self.sent,
            elapsed_us,
        );
    }
}
