use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Largest packet a client may send, and the size of every server receive buffer.
pub const MAX_PACKET_SIZE: usize = 65_000;

/// Default UDP port for the server.
pub const DEFAULT_UDP_PORT: u16 = 7000;

/// Default TCP port for the server.
pub const DEFAULT_TCP_PORT: u16 = 8000;

/// Transport protocol used for a transfer.
///
/// # Examples
///
/// ```
/// use protoprobe::Protocol;
///
/// assert_eq!(Protocol::Udp.to_string(), "UDP");
/// assert_eq!(Protocol::Tcp.unit_name(), "packets");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Transmission Control Protocol - one connection, byte stream
    Tcp,
    /// User Datagram Protocol - connectionless, one datagram per packet
    Udp,
}

impl Protocol {
    /// What one transmitted unit is called in reports.
    pub fn unit_name(&self) -> &'static str {
        match self {
            Protocol::Tcp => "packets",
            Protocol::Udp => "datagrams",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Where the client's packet payloads come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// Printable pseudo-random bytes generated per packet
    Random,
    /// Sequential chunks read from a file
    File(PathBuf),
}

/// Parameters for one client transfer.
///
/// Use the builder methods to customize the request, then [`ClientRequest::validate`]
/// (the transmission engine validates before opening any socket).
///
/// # Examples
///
/// ```
/// use protoprobe::{ClientRequest, Protocol};
///
/// let request = ClientRequest::new("127.0.0.1", 7000)
///     .with_protocol(Protocol::Udp)
///     .with_packet_size(100)
///     .with_repetitions(10);
///
/// assert!(request.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Server host name or IPv4 address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Protocol to send with
    pub protocol: Protocol,

    /// Bytes per packet (1..=65000)
    pub packet_size: usize,

    /// Number of packets to send
    pub repetitions: u64,

    /// Payload source
    pub source: SourceKind,
}

impl ClientRequest {
    /// Creates a request for `host:port` with UDP, 1024-byte packets, 10 repetitions
    /// and random payloads.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: Protocol::Udp,
            packet_size: 1024,
            repetitions: 10,
            source: SourceKind::Random,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size;
        self
    }

    pub fn with_repetitions(mut self, repetitions: u64) -> Self {
        self.repetitions = repetitions;
        self
    }

    pub fn with_source(mut self, source: SourceKind) -> Self {
        self.source = source;
        self
    }

    /// Checks the request against the limits the engines rely on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the host is empty, the port is 0, or the
    /// packet size is outside `1..=65000`.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("Server host is required".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("Server port must be 1-65535".to_string()));
        }
        if self.packet_size == 0 || self.packet_size > MAX_PACKET_SIZE {
            return Err(Error::Config(format!(
                "Packet size {} outside 1-{} bytes",
                self.packet_size, MAX_PACKET_SIZE
            )));
        }
        Ok(())
    }
}

/// Configuration for the receiving server.
///
/// Port `0` asks the OS for an ephemeral port; the bound ports are reported by
/// [`crate::Server::tcp_local_addr`] and [`crate::Server::udp_local_addr`].
///
/// # Examples
///
/// ```
/// use protoprobe::ServerConfig;
///
/// let config = ServerConfig::new(7000, 8000).with_output_file("received.bin");
/// assert!(config.validate().is_ok());
///
/// assert!(ServerConfig::new(7000, 7000).validate().is_err());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// UDP port to bind
    pub udp_port: u16,

    /// TCP port to listen on
    pub tcp_port: u16,

    /// File receiving every payload byte, if set
    pub output_file: Option<PathBuf>,

    /// Bind address (all interfaces when unset)
    pub bind_addr: Option<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_UDP_PORT,
            tcp_port: DEFAULT_TCP_PORT,
            output_file: None,
            bind_addr: None,
        }
    }
}

impl ServerConfig {
    pub fn new(udp_port: u16, tcp_port: u16) -> Self {
        Self {
            udp_port,
            tcp_port,
            ..Default::default()
        }
    }

    pub fn with_output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Socket address for the given port on the configured bind address.
    pub(crate) fn bind_target(&self, port: u16) -> SocketAddr {
        let ip = self.bind_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, port)
    }

    /// # Errors
    ///
    /// Returns [`Error::Config`] when both ports are the same non-zero value.
    pub fn validate(&self) -> Result<()> {
        if self.udp_port != 0 && self.udp_port == self.tcp_port {
            return Err(Error::Config(
                "UDP and TCP ports cannot be the same".to_string(),
            ));
        }
        Ok(())
    }
}
