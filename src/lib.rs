//! protoprobe - a TCP/UDP throughput probe
//!
//! The crate has two halves:
//!
//! - a **client** that sends a fixed number of equally sized packets to a
//!   server over TCP or UDP, with payloads read from a file or generated
//!   randomly, and reports how long the transfer took;
//! - a **server** that listens on a TCP port and a UDP port at once, groups
//!   received data into sessions (closed connection for TCP, one second of
//!   silence for UDP), optionally saves the payload bytes to a file, and
//!   reports packet and byte counts for every session.
//!
//! All human-readable output goes through a [`Sink`]; diagnostics use the
//! `log` crate. Networking runs on tokio.

pub mod client;
pub mod config;
pub mod error;
pub mod server;
pub mod sink;
pub mod source;
pub mod stats;

pub use client::{send_stream, Client, TransferSummary, Transport};
pub use config::{ClientRequest, Protocol, ServerConfig, SourceKind};
pub use error::{Error, Result};
pub use server::{Server, ServerStatus};
pub use sink::{ConsoleSink, MemorySink, Sink, SinkRef};
pub use source::{open_source, DataSource, FileSource, RandomSource};
pub use stats::{SessionReport, StatsRecorder, TransferSession};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
