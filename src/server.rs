use crate::config::{Protocol, ServerConfig, MAX_PACKET_SIZE};
use crate::sink::{ConsoleSink, Sink, SinkRef};
use crate::stats::{StatsRecorder, TransferSession};
use crate::{Error, Result};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Size of the buffer each worker receives into.
pub const RECEIVE_BUFFER_SIZE: usize = MAX_PACKET_SIZE;

/// Quiet period that ends a UDP burst.
pub const SILENCE_WINDOW: Duration = Duration::from_secs(1);

/// Readiness timeout used while no UDP burst is in progress.
pub const IDLE_POLL_TIMEOUT: Duration = Duration::from_secs(36_000_000);

/// Lifecycle of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Result of one UDP receive, delivered to the UDP worker in arrival order.
#[derive(Debug)]
enum UdpCompletion {
    Datagram { payload: Vec<u8>, peer: SocketAddr },
    /// No datagram arrived within the silence window
    Silence,
}

/// Appends received payloads to the configured output file.
struct PayloadWriter {
    file: tokio::sync::Mutex<File>,
}

impl PayloadWriter {
    async fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
        })
    }

    async fn append(&self, payload: &[u8]) -> std::io::Result<()> {
        self.file.lock().await.write_all(payload).await
    }

    async fn flush(&self) -> std::io::Result<()> {
        self.file.lock().await.flush().await
    }
}

/// Everything one start/stop cycle shares between its tasks.
struct ServerState {
    running: AtomicBool,
    shutdown: CancellationToken,
    sink: SinkRef,
    tcp_stats: StatsRecorder,
    udp_stats: StatsRecorder,
    /// Most recently accepted connection not yet picked up by the TCP worker
    current_connection: Mutex<Option<(TcpStream, SocketAddr)>>,
    accept_signal: Notify,
    output: Option<PayloadWriter>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
}

impl ServerState {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn record(&self, stats: &StatsRecorder, payload: &[u8]) {
        stats.accumulate(payload.len());

        if let Some(output) = &self.output {
            if let Err(e) = output.append(payload).await {
                warn!("Saving incoming data failed: {}", e);
                self.sink
                    .append_line(&format!("Saving incoming data failed: {}", e));
            }
        }
    }
}

/// Dual-protocol receiving server.
///
/// Once started, the server listens on a TCP port and a UDP port at the same
/// time. Every burst of received data is counted as one session and reported
/// to the sink when it ends:
///
/// - **TCP**: a session ends when the peer closes its connection. Only one
///   connection is served at a time; a connection accepted while another is
///   being read waits in a single slot, and a newer accept replaces it.
/// - **UDP**: a session ends when no datagram arrives for [`SILENCE_WINDOW`].
///
/// # Examples
///
/// ```no_run
/// use protoprobe::{MemorySink, Server, ServerConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let sink = MemorySink::new();
/// let server = Server::new(ServerConfig::new(7000, 8000)).with_sink(sink.clone());
///
/// server.start().await?;
/// // ... clients transfer data ...
/// server.stop().await;
///
/// for block in sink.blocks() {
///     println!("{}", block.join("\n"));
/// }
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: ServerConfig,
    sink: SinkRef,
    status: Mutex<ServerStatus>,
    active: Mutex<Option<Arc<ServerState>>>,
    /// Serializes start and stop; holds the tasks of the active cycle
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Creates a stopped server. Output goes to stdout until a sink is attached.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            sink: Arc::new(ConsoleSink::new()),
            status: Mutex::new(ServerStatus::Stopped),
            active: Mutex::new(None),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_sink<K: Sink + 'static>(mut self, sink: K) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn with_sink_ref(mut self, sink: SinkRef) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.lock()
    }

    /// Bound TCP address while the server is running.
    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        self.active.lock().as_ref().map(|s| s.tcp_addr)
    }

    /// Bound UDP address while the server is running.
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.active.lock().as_ref().map(|s| s.udp_addr)
    }

    /// Current, not yet flushed, session for `protocol` while the server is running.
    pub fn session(&self, protocol: Protocol) -> Option<TransferSession> {
        self.active.lock().as_ref().map(|s| match protocol {
            Protocol::Tcp => s.tcp_stats.snapshot(),
            Protocol::Udp => s.udp_stats.snapshot(),
        })
    }

    /// Binds both ports and starts the receive loops.
    ///
    /// Returns once both protocol workers are waiting for data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] if the server is not stopped, [`Error::Config`]
    /// for an invalid configuration, and an I/O error if a port cannot be bound
    /// or the output file cannot be created. Every failure is also reported to
    /// the sink, and nothing is left running.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;

        {
            let mut status = self.status.lock();
            if *status != ServerStatus::Stopped {
                return Err(Error::State(format!("cannot start while {:?}", *status)));
            }
            *status = ServerStatus::Starting;
        }

        match self.launch().await {
            Ok((state, handles)) => {
                *tasks = handles;
                *self.active.lock() = Some(state);
                *self.status.lock() = ServerStatus::Running;
                Ok(())
            }
            Err(e) => {
                *self.status.lock() = ServerStatus::Stopped;
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<(Arc<ServerState>, Vec<JoinHandle<()>>)> {
        if let Err(e) = self.config.validate() {
            self.sink.append_line(&e.to_string());
            return Err(e);
        }

        let tcp_target = self.config.bind_target(self.config.tcp_port);
        let listener = TcpListener::bind(tcp_target)
            .await
            .map_err(|e| self.setup_failure("Can't bind TCP socket", &tcp_target.to_string(), e))?;
        let tcp_addr = listener.local_addr()?;

        let udp_target = self.config.bind_target(self.config.udp_port);
        let socket = UdpSocket::bind(udp_target)
            .await
            .map_err(|e| self.setup_failure("Can't bind UDP socket", &udp_target.to_string(), e))?;
        let udp_addr = socket.local_addr()?;

        let output = match &self.config.output_file {
            Some(path) => {
                let target = path.display().to_string();
                let writer = PayloadWriter::create(path)
                    .await
                    .map_err(|e| self.setup_failure("Unable to open output file", &target, e))?;
                Some(writer)
            }
            None => None,
        };

        self.sink
            .append_line(&format!("Starting UDP server using port {}", udp_addr.port()));
        self.sink
            .append_line(&format!("Starting TCP server using port {}", tcp_addr.port()));
        info!("Receiving on TCP {} and UDP {}", tcp_addr, udp_addr);

        let state = Arc::new(ServerState {
            running: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            sink: self.sink.clone(),
            tcp_stats: StatsRecorder::new(Protocol::Tcp),
            udp_stats: StatsRecorder::new(Protocol::Udp),
            current_connection: Mutex::new(None),
            accept_signal: Notify::new(),
            output,
            tcp_addr,
            udp_addr,
        });

        let (ready_tx, mut ready_rx) = mpsc::channel::<Protocol>(2);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let handles = vec![
            tokio::spawn(run_acceptor(listener, state.clone())),
            tokio::spawn(run_tcp_worker(state.clone(), ready_tx.clone())),
            tokio::spawn(run_udp_poller(socket, state.clone(), completion_tx)),
            tokio::spawn(run_udp_worker(state.clone(), completion_rx, ready_tx)),
        ];

        for _ in 0..2 {
            if ready_rx.recv().await.is_none() {
                state.running.store(false, Ordering::SeqCst);
                state.shutdown.cancel();
                for handle in handles {
                    let _ = handle.await;
                }
                return Err(Error::State("receive worker exited during startup".to_string()));
            }
        }

        Ok((state, handles))
    }

    fn setup_failure(&self, what: &str, target: &str, e: std::io::Error) -> Error {
        error!("{} {}: {}", what, target, e);
        self.sink.append_line(&format!("{} {}: {}", what, target, e));
        Error::Io(e)
    }

    /// Stops the loops, closes the sockets and releases the output file.
    ///
    /// Sessions still in progress are discarded without a report. Calling
    /// `stop` on a server that is not running does nothing.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;

        {
            let mut status = self.status.lock();
            match *status {
                ServerStatus::Stopped | ServerStatus::Stopping => return,
                _ => *status = ServerStatus::Stopping,
            }
        }

        let state = self.active.lock().take();
        if let Some(state) = state {
            state.running.store(false, Ordering::SeqCst);
            state.shutdown.cancel();

            for task in tasks.drain(..) {
                if let Err(e) = task.await {
                    error!("Server task failed: {}", e);
                }
            }

            state.current_connection.lock().take();
            if let Some(output) = &state.output {
                if let Err(e) = output.flush().await {
                    warn!("Flushing output file failed: {}", e);
                }
            }

            info!("Server on TCP {} / UDP {} stopped", state.tcp_addr, state.udp_addr);
            self.sink.append_line("Server stopped");
        }

        *self.status.lock() = ServerStatus::Stopped;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(state) = self.active.lock().take() {
            state.running.store(false, Ordering::SeqCst);
            state.shutdown.cancel();
        }
    }
}

/// Accepts connections and hands the newest one to the TCP worker.
async fn run_acceptor(listener: TcpListener, state: Arc<ServerState>) {
    while state.is_running() {
        let accepted = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let previous = state.current_connection.lock().replace((stream, addr));
                if let Some((_, previous_addr)) = previous {
                    debug!("Dropping unserved connection from {}", previous_addr);
                }
                state.accept_signal.notify_one();
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                state
                    .sink
                    .append_line(&format!("Error accepting connection: {}", e));
            }
        }
    }
    debug!("TCP acceptor exiting");
}

/// Reads the current connection until the peer closes it, then waits for the
/// next accept.
async fn run_tcp_worker(state: Arc<ServerState>, ready: mpsc::Sender<Protocol>) {
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
    let _ = ready.send(Protocol::Tcp).await;
    drop(ready);

    while state.is_running() {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = state.accept_signal.notified() => {}
        }

        let next = state.current_connection.lock().take();
        let Some((mut stream, addr)) = next else {
            continue;
        };

        loop {
            let completion = tokio::select! {
                _ = state.shutdown.cancelled() => return,
                read = stream.read(&mut buf) => read,
            };

            match completion {
                Ok(0) => {
                    debug!("Connection from {} closed", addr);
                    state.tcp_stats.flush(state.sink.as_ref());
                    break;
                }
                Ok(n) => {
                    debug!("Received {} bytes from {}", n, addr);
                    state.record(&state.tcp_stats, &buf[..n]).await;
                }
                Err(e) => {
                    warn!("Error receiving from {}: {}", addr, e);
                    state
                        .sink
                        .append_line(&format!("TCP receive error from {}: {}", addr, e));
                    state.tcp_stats.flush(state.sink.as_ref());
                    break;
                }
            }
        }
    }
    debug!("TCP worker exiting");
}

/// Waits for datagrams and detects the end of each burst.
///
/// While idle the readiness wait uses [`IDLE_POLL_TIMEOUT`]; after a datagram
/// it shrinks to [`SILENCE_WINDOW`], and a timeout then ends the burst.
async fn run_udp_poller(
    socket: UdpSocket,
    state: Arc<ServerState>,
    completions: mpsc::UnboundedSender<UdpCompletion>,
) {
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
    let mut wait = IDLE_POLL_TIMEOUT;

    while state.is_running() {
        let readiness = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            readiness = time::timeout(wait, socket.readable()) => readiness,
        };

        match readiness {
            Ok(Ok(())) => match socket.try_recv_from(&mut buf) {
                Ok((n, peer)) => {
                    if n == 0 {
                        continue;
                    }
                    let completion = UdpCompletion::Datagram {
                        payload: buf[..n].to_vec(),
                        peer,
                    };
                    if completions.send(completion).is_err() {
                        break;
                    }
                    wait = SILENCE_WINDOW;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!("Error receiving UDP datagram: {}", e);
                    state
                        .sink
                        .append_line(&format!("UDP receive error: {}", e));
                }
            },
            Ok(Err(e)) => {
                error!("Waiting for UDP data failed: {}", e);
                state
                    .sink
                    .append_line(&format!("Waiting for UDP data failed: {}", e));
                break;
            }
            Err(_) => {
                if wait == SILENCE_WINDOW {
                    if completions.send(UdpCompletion::Silence).is_err() {
                        break;
                    }
                    wait = IDLE_POLL_TIMEOUT;
                }
            }
        }
    }
    debug!("UDP poller exiting");
}

/// Applies UDP completions to the session in arrival order.
async fn run_udp_worker(
    state: Arc<ServerState>,
    mut completions: mpsc::UnboundedReceiver<UdpCompletion>,
    ready: mpsc::Sender<Protocol>,
) {
    let _ = ready.send(Protocol::Udp).await;
    drop(ready);

    while state.is_running() {
        let completion = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            completion = completions.recv() => completion,
        };

        match completion {
            Some(UdpCompletion::Datagram { payload, peer }) => {
                debug!("Received {} byte datagram from {}", payload.len(), peer);
                state.record(&state.udp_stats, &payload).await;
            }
            Some(UdpCompletion::Silence) => {
                state.udp_stats.flush(state.sink.as_ref());
            }
            None => break,
        }
    }
    debug!("UDP worker exiting");
}
