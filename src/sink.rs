//! Destinations for human-readable status and report lines.
//!
//! Engines never print directly. Every status line and every flushed report
//! goes through a [`Sink`], which the front end supplies. Diagnostics that are
//! only interesting to developers go through the `log` macros instead.

use crate::Result;
use log::warn;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Append-line destination for status and report text.
///
/// The trait is implemented for any closure taking `&str`, so a quick sink
/// can be a one-liner.
///
/// # Examples
///
/// ```
/// use protoprobe::Sink;
///
/// let sink = |line: &str| println!("{}", line);
/// sink.append_line("Server stopped");
/// ```
pub trait Sink: Send + Sync {
    /// Delivers one line of text.
    fn append_line(&self, text: &str);

    /// Marks the end of a report block.
    fn end_block(&self) {}
}

impl<F> Sink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn append_line(&self, text: &str) {
        self(text)
    }
}

pub type SinkRef = Arc<dyn Sink>;

/// Sink that prints to stdout and duplicates every line to a log file.
///
/// Log file lines end in CRLF; each report block is followed by a blank line.
pub struct ConsoleSink {
    log_file: Option<Mutex<File>>,
}

impl ConsoleSink {
    /// Creates a sink that only prints to stdout.
    pub fn new() -> Self {
        Self { log_file: None }
    }

    /// Creates a sink that prints to stdout and appends to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log file cannot be opened for appending.
    pub fn with_log_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            log_file: Some(Mutex::new(file)),
        })
    }

    fn write_log(&self, bytes: &[u8]) {
        if let Some(file) = &self.log_file {
            if let Err(e) = file.lock().write_all(bytes) {
                warn!("Unable to write to log file: {}", e);
            }
        }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for ConsoleSink {
    fn append_line(&self, text: &str) {
        println!("{}", text);
        self.write_log(format!("{}\r\n", text).as_bytes());
    }

    fn end_block(&self) {
        println!();
        self.write_log(b"\r\n");
    }
}

/// Sink that keeps every line in memory, grouped into report blocks.
///
/// Cloning shares the same storage, so one clone can be handed to an engine
/// while another is inspected.
///
/// # Examples
///
/// ```
/// use protoprobe::{MemorySink, Sink};
///
/// let sink = MemorySink::new();
/// sink.append_line("Data received via UDP");
/// sink.end_block();
///
/// assert_eq!(sink.lines(), vec!["Data received via UDP".to_string()]);
/// assert_eq!(sink.blocks().len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryLines>>,
}

#[derive(Default)]
struct MemoryLines {
    lines: Vec<String>,
    blocks: Vec<Vec<String>>,
    open_block: Vec<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every line received so far, in order.
    pub fn lines(&self) -> Vec<String> {
        self.inner.lock().lines.clone()
    }

    /// Lines grouped by `end_block` calls; lines after the last marker are not included.
    pub fn blocks(&self) -> Vec<Vec<String>> {
        self.inner.lock().blocks.clone()
    }

    /// Completed blocks containing a line equal to `header`, each cut to
    /// start at that line. Status lines emitted before a report share its
    /// block, so this is how a single report is picked out.
    pub fn reports(&self, header: &str) -> Vec<Vec<String>> {
        self.inner
            .lock()
            .blocks
            .iter()
            .filter_map(|b| b.iter().position(|l| l == header).map(|i| b[i..].to_vec()))
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.inner.lock().lines.iter().any(|l| l.contains(needle))
    }
}

impl Sink for MemorySink {
    fn append_line(&self, text: &str) {
        let mut inner = self.inner.lock();
        inner.lines.push(text.to_string());
        inner.open_block.push(text.to_string());
    }

    fn end_block(&self) {
        let mut inner = self.inner.lock();
        let block = std::mem::take(&mut inner.open_block);
        inner.blocks.push(block);
    }
}
