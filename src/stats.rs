use crate::config::Protocol;
use crate::sink::Sink;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Rendering used for unset timestamps in reports.
const UNSET_TIMESTAMP: &str = "0-00-00 00:00:00:000";

/// Formats a report timestamp as `YYYY-MM-DD HH:MM:SS:mmm`.
pub fn format_timestamp(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S:%3f").to_string(),
        None => UNSET_TIMESTAMP.to_string(),
    }
}

/// Counters for one logical transfer (a burst).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSession {
    pub protocol: Protocol,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub packet_count: u64,
    pub total_bytes: u64,
}

impl TransferSession {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            start: None,
            end: None,
            packet_count: 0,
            total_bytes: 0,
        }
    }

    fn record_at(&mut self, bytes: u64, now: DateTime<Utc>) {
        self.packet_count += 1;
        self.total_bytes += bytes;
        if self.start.is_none() {
            self.start = Some(now);
        }
        self.end = Some(now);
    }

    fn reset(&mut self) {
        self.start = None;
        self.end = None;
        self.packet_count = 0;
        self.total_bytes = 0;
    }

    /// Milliseconds between the first and last data event.
    pub fn elapsed_ms(&self) -> i64 {
        match (self.start, self.end) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            _ => 0,
        }
    }
}

/// Snapshot of a session taken when it is flushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub protocol: Protocol,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub packet_count: u64,
    pub total_bytes: u64,
    pub elapsed_ms: i64,
}

impl SessionReport {
    /// Report lines in display order.
    pub fn lines(&self) -> Vec<String> {
        vec![
            format!("Data received via {}", self.protocol),
            format!("Start time: {}", format_timestamp(self.start)),
            format!("End time: {}", format_timestamp(self.end)),
            format!("Packets received: {}", self.packet_count),
            format!("Total bytes: {}", self.total_bytes),
            format!("Total transfer time: {} ms", self.elapsed_ms),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.packet_count == 0 && self.total_bytes == 0
    }
}

impl From<&TransferSession> for SessionReport {
    fn from(session: &TransferSession) -> Self {
        Self {
            protocol: session.protocol,
            start: session.start,
            end: session.end,
            packet_count: session.packet_count,
            total_bytes: session.total_bytes,
            elapsed_ms: session.elapsed_ms(),
        }
    }
}

/// Thread-safe recorder for one protocol's current session.
///
/// Clones share the same session.
///
/// # Examples
///
/// ```
/// use protoprobe::{MemorySink, Protocol, StatsRecorder};
///
/// let recorder = StatsRecorder::new(Protocol::Tcp);
/// recorder.accumulate(50);
/// recorder.accumulate(50);
///
/// let sink = MemorySink::new();
/// let report = recorder.flush(&sink);
/// assert_eq!(report.packet_count, 2);
/// assert_eq!(report.total_bytes, 100);
/// assert_eq!(recorder.snapshot().packet_count, 0);
/// ```
#[derive(Debug, Clone)]
pub struct StatsRecorder {
    inner: Arc<Mutex<TransferSession>>,
}

impl StatsRecorder {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TransferSession::new(protocol))),
        }
    }

    /// Records one received packet of `bytes` bytes.
    pub fn accumulate(&self, bytes: usize) {
        self.inner.lock().record_at(bytes as u64, Utc::now());
    }

    /// Emits the session report to `sink` and resets the session.
    pub fn flush(&self, sink: &dyn Sink) -> SessionReport {
        let report = {
            let mut session = self.inner.lock();
            let report = SessionReport::from(&*session);
            session.reset();
            report
        };

        for line in report.lines() {
            sink.append_line(&line);
        }
        sink.end_block();

        report
    }

    pub fn snapshot(&self) -> TransferSession {
        self.inner.lock().clone()
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.lock().protocol
    }
}
