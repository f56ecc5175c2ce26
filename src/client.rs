use crate::config::{ClientRequest, Protocol};
use crate::sink::{ConsoleSink, Sink, SinkRef};
use crate::source::{open_source, payload_len, DataSource};
use crate::stats::format_timestamp;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream, UdpSocket};

/// Outcome of one client transfer.
///
/// `packets_attempted` always equals the requested repetition count;
/// `packets_sent` counts the attempts that did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    pub protocol: Protocol,
    pub packet_size: usize,
    pub packets_attempted: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TransferSummary {
    /// Summary lines in display order.
    pub fn lines(&self) -> Vec<String> {
        vec![
            format!("Data sent via {}", self.protocol),
            format!("Start time: {}", format_timestamp(Some(self.start))),
            format!("End time: {}", format_timestamp(Some(self.end))),
            format!(
                "{} {} byte {} transferred",
                self.packets_attempted,
                self.packet_size,
                self.protocol.unit_name()
            ),
            format!("Total bytes: {}", self.bytes_sent),
        ]
    }

    /// Pretty-printed JSON rendering of the summary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// One-shot packet transmitter used by the send loop.
///
/// Each call is a single send attempt; implementations must not retry or
/// loop over partial writes.
pub trait Transport {
    fn transmit(&mut self, payload: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

impl Transport for TcpStream {
    async fn transmit(&mut self, payload: &[u8]) -> io::Result<usize> {
        self.write(payload).await
    }
}

/// Unconnected UDP socket paired with the destination of every datagram.
pub struct UdpTarget {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpTarget {
    pub async fn bind_for(target: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self { socket, target })
    }
}

impl Transport for UdpTarget {
    async fn transmit(&mut self, payload: &[u8]) -> io::Result<usize> {
        self.socket.send_to(payload, self.target).await
    }
}

/// Runs the send loop: exactly `repetitions` chunk requests and send attempts.
///
/// Failed attempts are reported to `sink` and the loop moves on. The source is
/// not closed here.
pub async fn transmit_packets<T, S>(
    transport: &mut T,
    source: &mut S,
    protocol: Protocol,
    packet_size: usize,
    repetitions: u64,
    sink: &dyn Sink,
) -> TransferSummary
where
    T: Transport,
    S: DataSource + ?Sized,
{
    let mut chunk = Vec::with_capacity(packet_size + 1);
    let mut packets_sent = 0u64;
    let mut bytes_sent = 0u64;

    let start = Utc::now();
    for sequence in 0..repetitions {
        source.fill(&mut chunk, packet_size);
        let len = payload_len(&chunk, packet_size);

        match transport.transmit(&chunk[..len]).await {
            Ok(n) => {
                packets_sent += 1;
                bytes_sent += n as u64;
            }
            Err(e) => {
                warn!("Send attempt {} failed: {}", sequence, e);
                sink.append_line(&format!("Send failed: {}", e));
            }
        }
    }
    let end = Utc::now();

    TransferSummary {
        protocol,
        packet_size,
        packets_attempted: repetitions,
        packets_sent,
        bytes_sent,
        start,
        end,
    }
}

/// Packet-stream client.
///
/// Sends `repetitions` packets of `packet_size` bytes to the server over the
/// requested protocol, then reports a summary to its sink. The transfer runs
/// sequentially on the calling task and cannot be cancelled mid-loop.
///
/// # Examples
///
/// ```no_run
/// use protoprobe::{Client, ClientRequest, MemorySink, Protocol, RandomSource};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let request = ClientRequest::new("127.0.0.1", 7000)
///     .with_protocol(Protocol::Udp)
///     .with_packet_size(100)
///     .with_repetitions(10);
///
/// let sink = MemorySink::new();
/// let client = Client::new(request)?.with_sink(sink.clone());
///
/// let summary = client.run(&mut RandomSource::new()).await?;
/// assert_eq!(summary.packets_attempted, 10);
/// # Ok(())
/// # }
/// ```
pub struct Client {
    request: ClientRequest,
    sink: SinkRef,
}

impl Client {
    /// Creates a client for a validated request. Output goes to stdout until
    /// a sink is attached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the request is invalid.
    pub fn new(request: ClientRequest) -> Result<Self> {
        request.validate()?;
        Ok(Self {
            request,
            sink: Arc::new(ConsoleSink::new()),
        })
    }

    pub fn with_sink<K: Sink + 'static>(mut self, sink: K) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn with_sink_ref(mut self, sink: SinkRef) -> Self {
        self.sink = sink;
        self
    }

    pub fn request(&self) -> &ClientRequest {
        &self.request
    }

    /// Performs the transfer, pulling payloads from `source`.
    ///
    /// The source is closed when the transfer ends, whether or not it succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be resolved or, for TCP, the
    /// connection cannot be established. Individual send failures are not
    /// errors; they are reported to the sink and counted in the summary.
    pub async fn run<S>(&self, source: &mut S) -> Result<TransferSummary>
    where
        S: DataSource + ?Sized,
    {
        let result = self.run_inner(source).await;
        source.close();
        result
    }

    /// Opens the source named by the request and performs the transfer.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload file cannot be opened, after reporting
    /// it to the sink, and otherwise whatever [`Client::run`] returns.
    pub async fn run_source(&self) -> Result<TransferSummary> {
        let mut source = match open_source(&self.request.source) {
            Ok(source) => source,
            Err(e) => {
                error!("Unable to open payload source: {}", e);
                self.sink.append_line(&format!("Unable to open file: {}", e));
                return Err(e);
            }
        };
        self.run(source.as_mut()).await
    }

    async fn run_inner<S>(&self, source: &mut S) -> Result<TransferSummary>
    where
        S: DataSource + ?Sized,
    {
        let request = &self.request;
        self.sink.append_line(&format!(
            "Sending {} byte packets {} times to {} port {} using {}",
            request.packet_size, request.repetitions, request.host, request.port, request.protocol
        ));

        let server_addr = self.resolve().await?;
        info!("Sending to {} over {}", server_addr, request.protocol);

        let summary = match request.protocol {
            Protocol::Tcp => {
                let mut stream = match TcpStream::connect(server_addr).await {
                    Ok(stream) => stream,
                    Err(e) => return Err(self.setup_failure("Can't connect to server", e)),
                };
                let summary = self.send_all(&mut stream, source).await;
                if let Err(e) = stream.shutdown().await {
                    debug!("Shutdown after transfer failed: {}", e);
                }
                summary
            }
            Protocol::Udp => {
                let mut target = match UdpTarget::bind_for(server_addr).await {
                    Ok(target) => target,
                    Err(e) => return Err(self.setup_failure("Cannot create socket", e)),
                };
                self.send_all(&mut target, source).await
            }
        };

        for line in summary.lines() {
            self.sink.append_line(&line);
        }
        self.sink.end_block();

        info!(
            "Transfer finished: {}/{} packets sent, {} bytes",
            summary.packets_sent, summary.packets_attempted, summary.bytes_sent
        );

        Ok(summary)
    }

    async fn send_all<T, S>(&self, transport: &mut T, source: &mut S) -> TransferSummary
    where
        T: Transport,
        S: DataSource + ?Sized,
    {
        transmit_packets(
            transport,
            source,
            self.request.protocol,
            self.request.packet_size,
            self.request.repetitions,
            self.sink.as_ref(),
        )
        .await
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let target = (self.request.host.as_str(), self.request.port);
        let addrs: Vec<SocketAddr> = match lookup_host(target).await {
            Ok(addrs) => addrs.collect(),
            Err(e) => return Err(self.setup_failure("Can't get server's IP address", e)),
        };

        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| {
                self.setup_failure(
                    "Can't get server's IP address",
                    io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
                )
            })
    }

    fn setup_failure(&self, what: &str, e: io::Error) -> Error {
        self.sink.append_line(&format!("{}: {}", what, e));
        Error::Connection(format!("{}: {}", what, e))
    }
}

/// Sends one packet stream described by `request`, reporting to `sink`.
///
/// Shorthand for building a [`Client`] and calling [`Client::run`].
pub async fn send_stream<S>(
    request: &ClientRequest,
    source: &mut S,
    sink: SinkRef,
) -> Result<TransferSummary>
where
    S: DataSource + ?Sized,
{
    let client = match Client::new(request.clone()) {
        Ok(client) => client.with_sink_ref(sink),
        Err(e) => {
            sink.append_line(&e.to_string());
            source.close();
            return Err(e);
        }
    };
    client.run(source).await
}
