use protoprobe::{
    send_stream, ClientRequest, FileSource, MemorySink, Protocol, RandomSource, Server,
    ServerConfig,
};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};

const UDP_HEADER: &str = "Data received via UDP";
const TCP_HEADER: &str = "Data received via TCP";

fn local_config() -> ServerConfig {
    ServerConfig::new(0, 0).with_bind_addr("127.0.0.1".parse().unwrap())
}

/// Polls until `count` report blocks with `header` exist or the deadline passes.
async fn wait_for_blocks(sink: &MemorySink, header: &str, count: usize) -> Vec<Vec<String>> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let blocks = sink.reports(header);
        if blocks.len() >= count || Instant::now() >= deadline {
            return blocks;
        }
        sleep(Duration::from_millis(50)).await;
    }
}

fn request_to(addr: SocketAddr, protocol: Protocol) -> ClientRequest {
    ClientRequest::new(addr.ip().to_string(), addr.port()).with_protocol(protocol)
}

#[tokio::test]
async fn test_udp_burst_reported_after_silence() {
    let server_sink = MemorySink::new();
    let server = Server::new(local_config()).with_sink(server_sink.clone());
    server.start().await.unwrap();
    let udp_addr = server.udp_local_addr().unwrap();

    let request = request_to(udp_addr, Protocol::Udp)
        .with_packet_size(100)
        .with_repetitions(10);
    let client_sink = MemorySink::new();
    let summary = send_stream(&request, &mut RandomSource::new(), Arc::new(client_sink.clone()))
        .await
        .unwrap();
    assert_eq!(summary.packets_attempted, 10);
    assert_eq!(summary.bytes_sent, 1000);

    let blocks = wait_for_blocks(&server_sink, UDP_HEADER, 1).await;
    assert_eq!(blocks.len(), 1, "expected one UDP report");
    let report = &blocks[0];
    assert_eq!(report[3], "Packets received: 10");
    assert_eq!(report[4], "Total bytes: 1000");
    assert!(report[5].starts_with("Total transfer time: "));

    // The long timeout is back in effect: no second flush follows
    sleep(Duration::from_millis(2500)).await;
    assert_eq!(server_sink.reports(UDP_HEADER).len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_udp_bursts_are_separate_sessions() {
    let server_sink = MemorySink::new();
    let server = Server::new(local_config()).with_sink(server_sink.clone());
    server.start().await.unwrap();
    let udp_addr = server.udp_local_addr().unwrap();

    let first = request_to(udp_addr, Protocol::Udp)
        .with_packet_size(40)
        .with_repetitions(4);
    send_stream(&first, &mut RandomSource::new(), Arc::new(MemorySink::new()))
        .await
        .unwrap();
    wait_for_blocks(&server_sink, UDP_HEADER, 1).await;

    let second = request_to(udp_addr, Protocol::Udp)
        .with_packet_size(10)
        .with_repetitions(2);
    send_stream(&second, &mut RandomSource::new(), Arc::new(MemorySink::new()))
        .await
        .unwrap();

    let blocks = wait_for_blocks(&server_sink, UDP_HEADER, 2).await;
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0][4], "Total bytes: 160");
    assert_eq!(blocks[1][3], "Packets received: 2");
    assert_eq!(blocks[1][4], "Total bytes: 20");

    server.stop().await;
}

#[tokio::test]
async fn test_tcp_session_flushed_on_close() {
    let server_sink = MemorySink::new();
    let server = Server::new(local_config()).with_sink(server_sink.clone());
    server.start().await.unwrap();
    let tcp_addr = server.tcp_local_addr().unwrap();

    let request = request_to(tcp_addr, Protocol::Tcp)
        .with_packet_size(50)
        .with_repetitions(5);
    let summary = send_stream(&request, &mut RandomSource::new(), Arc::new(MemorySink::new()))
        .await
        .unwrap();
    assert_eq!(summary.bytes_sent, 250);

    // Packets received counts reads, and the stream may merge the writes
    let blocks = wait_for_blocks(&server_sink, TCP_HEADER, 1).await;
    assert_eq!(blocks.len(), 1);
    assert!(blocks[0][3].starts_with("Packets received: "));
    assert_eq!(blocks[0][4], "Total bytes: 250");

    server.stop().await;
}

#[tokio::test]
async fn test_tcp_reconnect_starts_independent_session() {
    let server_sink = MemorySink::new();
    let server = Server::new(local_config()).with_sink(server_sink.clone());
    server.start().await.unwrap();
    let tcp_addr = server.tcp_local_addr().unwrap();

    // Paced writes so every packet lands in its own read
    let mut stream = TcpStream::connect(tcp_addr).await.unwrap();
    stream.set_nodelay(true).unwrap();
    for _ in 0..5 {
        stream.write_all(&[b'x'; 50]).await.unwrap();
        sleep(Duration::from_millis(50)).await;
    }
    stream.shutdown().await.unwrap();
    drop(stream);

    let blocks = wait_for_blocks(&server_sink, TCP_HEADER, 1).await;
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0][3], "Packets received: 5");
    assert_eq!(blocks[0][4], "Total bytes: 250");

    // The listener survives the flush
    let mut stream = TcpStream::connect(tcp_addr).await.unwrap();
    stream.write_all(&[b'y'; 30]).await.unwrap();
    stream.shutdown().await.unwrap();
    drop(stream);

    let blocks = wait_for_blocks(&server_sink, TCP_HEADER, 2).await;
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[1][3], "Packets received: 1");
    assert_eq!(blocks[1][4], "Total bytes: 30");

    server.stop().await;
}

#[tokio::test]
async fn test_newer_connection_replaces_waiting_one() {
    let server_sink = MemorySink::new();
    let server = Server::new(local_config()).with_sink(server_sink.clone());
    server.start().await.unwrap();
    let tcp_addr = server.tcp_local_addr().unwrap();

    // A is being read while B and C queue behind it
    let mut first = TcpStream::connect(tcp_addr).await.unwrap();
    first.write_all(&[b'a'; 5]).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    let mut second = TcpStream::connect(tcp_addr).await.unwrap();
    second.write_all(&[b'b'; 10]).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    let mut third = TcpStream::connect(tcp_addr).await.unwrap();
    third.write_all(&[b'c'; 20]).await.unwrap();
    third.shutdown().await.unwrap();
    drop(third);
    sleep(Duration::from_millis(200)).await;

    first.shutdown().await.unwrap();
    drop(first);

    let blocks = wait_for_blocks(&server_sink, TCP_HEADER, 2).await;
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0][3], "Packets received: 1");
    assert_eq!(blocks[0][4], "Total bytes: 5");
    assert_eq!(blocks[1][3], "Packets received: 1");
    assert_eq!(blocks[1][4], "Total bytes: 20");

    // B was dropped from the slot unread
    sleep(Duration::from_millis(500)).await;
    assert_eq!(server_sink.reports(TCP_HEADER).len(), 2);
    assert!(!server_sink.contains("Total bytes: 10"));
    drop(second);

    server.stop().await;
}

#[tokio::test]
async fn test_output_file_receives_payload() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("received.txt");
    let mut payload_file = tempfile::NamedTempFile::new().unwrap();
    let payload: Vec<u8> = (0..200u32).map(|i| b'a' + (i % 26) as u8).collect();
    payload_file.write_all(&payload).unwrap();

    let server_sink = MemorySink::new();
    let server = Server::new(local_config().with_output_file(&output)).with_sink(server_sink.clone());
    server.start().await.unwrap();
    let tcp_addr = server.tcp_local_addr().unwrap();

    let request = request_to(tcp_addr, Protocol::Tcp)
        .with_packet_size(50)
        .with_repetitions(4);
    let mut source = FileSource::open(payload_file.path()).unwrap();
    send_stream(&request, &mut source, Arc::new(MemorySink::new()))
        .await
        .unwrap();

    let blocks = wait_for_blocks(&server_sink, TCP_HEADER, 1).await;
    assert_eq!(blocks[0][4], "Total bytes: 200");

    server.stop().await;
    assert_eq!(std::fs::read(&output).unwrap(), payload);
}

#[tokio::test]
async fn test_file_source_exhaustion_truncates_payload() {
    let mut payload_file = tempfile::NamedTempFile::new().unwrap();
    payload_file.write_all(&[b'z'; 120]).unwrap();

    let server_sink = MemorySink::new();
    let server = Server::new(local_config()).with_sink(server_sink.clone());
    server.start().await.unwrap();
    let tcp_addr = server.tcp_local_addr().unwrap();

    // 3 x 50 requested, the file only holds 120 bytes
    let request = request_to(tcp_addr, Protocol::Tcp)
        .with_packet_size(50)
        .with_repetitions(3);
    let mut source = FileSource::open(payload_file.path()).unwrap();
    let summary = send_stream(&request, &mut source, Arc::new(MemorySink::new()))
        .await
        .unwrap();

    assert_eq!(summary.packets_attempted, 3);
    assert_eq!(summary.bytes_sent, 120);

    let blocks = wait_for_blocks(&server_sink, TCP_HEADER, 1).await;
    assert_eq!(blocks[0][4], "Total bytes: 120");

    server.stop().await;
}

#[tokio::test]
async fn test_client_summary_lines() {
    let server = Server::new(local_config()).with_sink(MemorySink::new());
    server.start().await.unwrap();
    let udp_addr = server.udp_local_addr().unwrap();

    let client_sink = MemorySink::new();
    let request = request_to(udp_addr, Protocol::Udp)
        .with_packet_size(64)
        .with_repetitions(3);
    send_stream(&request, &mut RandomSource::new(), Arc::new(client_sink.clone()))
        .await
        .unwrap();

    let lines = client_sink.lines();
    assert!(lines[0].starts_with("Sending 64 byte packets 3 times to 127.0.0.1 port"));
    assert_eq!(lines[1], "Data sent via UDP");
    let summary = client_sink.reports("Data sent via UDP");
    assert_eq!(summary.len(), 1);
    assert!(summary[0][1].starts_with("Start time: "));
    assert!(summary[0][2].starts_with("End time: "));
    assert_eq!(summary[0][3], "3 64 byte datagrams transferred");
    assert_eq!(summary[0][4], "Total bytes: 192");

    server.stop().await;
}
