mod common;
use common::*;

use razor_mesh::client::{ClientTransport, RpcClient};
use razor_mesh::proto::{RpcRequest, RpcResponse, encode_frame, read_frame, write_frame};
use razor_mesh::server::ServerStatus;
use razor_mesh::transport::tcp::{TcpClient, TcpServer};
use razor_mesh::{ClientConfig, Codec as _, RpcError, RpcIntErr, ServerConfig};
use rstest::*;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

type Client = RpcClient<TcpClient, Codec>;

async fn ping(stream: &mut TcpStream) -> RpcResponse {
    let codec = Codec::default();
    let frame = encode_frame(&codec, &RpcRequest::ping()).expect("encode");
    write_frame(stream, &frame).await.expect("write ping");
    let mut buf = Vec::new();
    let r = tokio::time::timeout(Duration::from_secs(1), read_frame(stream, &mut buf, 1024)).await;
    assert!(r.expect("pong in time").expect("read"));
    codec.decode(&buf).expect("decode pong")
}

#[logfn]
#[rstest]
fn test_server_idle_timeout(runner: TestRunner) {
    runner.block_on(async move {
        // idle timeout is 600ms
        let config = ServerConfig { heartbeat_interval: Duration::from_millis(200), ..Default::default() };
        let (server, _, addr) = init_server::<TcpServer>(config).await;
        let mut stream = TcpStream::connect(&addr).await.expect("connect");

        // one heartbeat missed, still open
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(ping(&mut stream).await.is_pong());
        // beyond 600ms since connected, but within 600ms since the last ping
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(ping(&mut stream).await.is_pong());

        // silent for three heartbeats, closed by the server
        let start = Instant::now();
        let mut buf = Vec::new();
        let r = tokio::time::timeout(Duration::from_secs(3), read_frame(&mut stream, &mut buf, 1024)).await;
        assert!(!r.expect("closed in time").expect("eof"));
        assert!(start.elapsed() >= Duration::from_millis(450));
        server.stop().await;
    });
}

#[logfn]
#[rstest]
fn test_client_heartbeat_keeps_alive(runner: TestRunner) {
    runner.block_on(async move {
        let heartbeat = Duration::from_millis(100);
        let server_config = ServerConfig { heartbeat_interval: heartbeat, ..Default::default() };
        let (server, _, addr) = init_server::<TcpServer>(server_config).await;
        let client = Client::new(ClientConfig { heartbeat_interval: heartbeat, ..Default::default() });
        let conn = client.connect(&addr).await.expect("connect");
        // far longer than the idle timeout of the server
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(conn.is_active());
        let r: String = client.call(&addr, ECHO, "echo", &"beat".to_string()).await.expect("call");
        assert_eq!(r, "beat");
        assert_eq!(client.connect(&addr).await.expect("connect").conn_id(), conn.conn_id());
        server.stop().await;
    });
}

#[logfn]
#[rstest]
fn test_client_detects_silent_peer(runner: TestRunner) {
    runner.block_on(async move {
        // A peer which never answers, not even pings
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                tokio::time::sleep(Duration::from_secs(5)).await;
                drop(stream);
            }
        });
        let config = ClientConfig { heartbeat_interval: Duration::from_millis(100), heartbeat_retry: 3, ..Default::default() };
        let client = Client::new(config);
        let req = client.new_request(ECHO, "echo", &"x".to_string()).expect("req");
        let start = Instant::now();
        let mut fut = client.call_future(&addr, req, Duration::from_secs(5)).await.expect("future");
        assert_eq!(fut.get().await, Err(RpcError::Rpc(RpcIntErr::ConnLost)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed < Duration::from_secs(2));
    });
}

#[logfn]
#[rstest]
fn test_stop_drains_in_flight(runner: TestRunner) {
    runner.block_on(async move {
        let (server, _, addr) = init_server::<TcpServer>(ServerConfig::default()).await;
        let mut status = server.subscribe();
        assert_eq!(*status.borrow_and_update(), ServerStatus::Running);
        let client = Client::new(ClientConfig::default());
        let req = client.new_request(ECHO, "sleep", &300u64).expect("req");
        let mut fut = client.call_future(&addr, req, Duration::from_secs(5)).await.expect("future");
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.stop().await;
        assert_eq!(server.status(), ServerStatus::Stopped);
        assert!(status.has_changed().expect("watch"));
        let r: u64 = fut.get_as(client.codec()).await.expect("drained");
        assert_eq!(r, 300);

        // no longer accepting
        tokio::time::sleep(Duration::from_millis(50)).await;
        let r = client.call::<String, String>(&addr, ECHO, "echo", &"x".to_string()).await;
        assert!(r.is_err());
        // idempotent
        server.stop().await;
    });
}

#[logfn]
#[rstest]
fn test_server_log_level(runner: TestRunner) {
    runner.block_on(async move {
        let (server, _, addr) = init_server::<TcpServer>(ServerConfig::default()).await;
        assert_eq!(server.ctx().logger.get_level(), log::Level::Trace as u8);
        // only the logs of this server are filtered
        server.set_log_level(log::Level::Error);
        assert_eq!(server.ctx().logger.get_level(), log::Level::Error as u8);
        let client = Client::new(ClientConfig::default());
        let r: String = client.call(&addr, ECHO, "echo", &"quiet".to_string()).await.expect("call");
        assert_eq!(r, "quiet");
        server.stop().await;
    });
}
