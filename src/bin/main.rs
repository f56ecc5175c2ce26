use clap::{Parser, Subcommand};
use protoprobe::config::{DEFAULT_TCP_PORT, DEFAULT_UDP_PORT};
use protoprobe::{
    Client, ClientRequest, ConsoleSink, Protocol, Server, ServerConfig, SourceKind,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "protoprobe")]
#[command(about = "TCP/UDP throughput probe - packet-stream client and receiving server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Receive TCP and UDP streams and report every session
    Server {
        /// UDP port to bind
        #[arg(short, long, default_value_t = DEFAULT_UDP_PORT)]
        udp_port: u16,

        /// TCP port to listen on
        #[arg(short, long, default_value_t = DEFAULT_TCP_PORT)]
        tcp_port: u16,

        /// Save every received payload byte to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Bind to specific address
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// Report log file
        #[arg(long, default_value = "ServerLog.txt")]
        log_file: PathBuf,
    },

    /// Send a stream of packets to a server
    Client {
        /// Server address to send to
        host: String,

        /// Server port
        #[arg(short, long, default_value_t = DEFAULT_UDP_PORT)]
        port: u16,

        /// Use TCP instead of UDP
        #[arg(long)]
        tcp: bool,

        /// Packet size in bytes (1-65000)
        #[arg(short = 's', long, default_value = "1024")]
        size: usize,

        /// Number of packets to send
        #[arg(short = 'n', long, default_value = "10")]
        count: u64,

        /// Read packet data from this file instead of generating it
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Report log file
        #[arg(long, default_value = "clientLog.txt")]
        log_file: PathBuf,

        /// Print the transfer summary as JSON
        #[arg(short = 'J', long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            udp_port,
            tcp_port,
            output,
            bind,
            log_file,
        } => {
            let mut config = ServerConfig::new(udp_port, tcp_port);
            if let Some(path) = output {
                config = config.with_output_file(path);
            }
            if let Some(addr) = bind {
                config = config.with_bind_addr(addr);
            }

            let sink = ConsoleSink::with_log_file(&log_file)?;
            let server = Server::new(config).with_sink(sink);

            server.start().await?;
            tokio::signal::ctrl_c().await?;
            server.stop().await;
        }

        Commands::Client {
            host,
            port,
            tcp,
            size,
            count,
            file,
            log_file,
            json,
        } => {
            let protocol = if tcp { Protocol::Tcp } else { Protocol::Udp };
            let source = match file {
                Some(path) => SourceKind::File(path),
                None => SourceKind::Random,
            };

            let request = ClientRequest::new(host, port)
                .with_protocol(protocol)
                .with_packet_size(size)
                .with_repetitions(count)
                .with_source(source);

            let sink = Arc::new(ConsoleSink::with_log_file(&log_file)?);
            let client = Client::new(request)?.with_sink_ref(sink);

            let summary = client.run_source().await?;

            if json {
                println!("{}", summary.to_json()?);
            }
        }
    }

    Ok(())
}
