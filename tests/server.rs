//! End-to-end tests against a live server
//!
//! Browser-like traffic comes from tokio-tungstenite; wire-level
//! checks use a raw TCP socket.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use ws_broadcast::{
    BroadcastChat, BroadcastServer, ConnectionStrategy, Echo, RegistryHandle, ServerConfig,
    ServerError, Ticker,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(2);
const POLL: Duration = Duration::from_millis(5);

const UPGRADE: &[u8] = b"GET /test HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
    Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\r\n";

struct TestServer {
    addr: SocketAddr,
    registry: RegistryHandle,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<(), ServerError>>,
}

async fn spawn_server<S: ConnectionStrategy>(strategy: S) -> TestServer {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..ServerConfig::default()
    };
    let server = BroadcastServer::new(config, strategy);
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = server.registry();

    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server.serve(listener, async move {
        let _ = stopped.await;
    }));

    TestServer {
        addr,
        registry,
        stop,
        task,
    }
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, response) = connect_async(format!("ws://{}/test", addr)).await.unwrap();
    assert_eq!(response.status().as_u16(), 101);
    ws
}

/// Wait until `count` connections have finished their handshake
async fn wait_for_clients(registry: &RegistryHandle, count: usize) {
    for _ in 0..200 {
        if registry.clients().await.unwrap().len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} upgraded clients", count);
}

async fn next_text(ws: &mut Client) -> String {
    let msg = timeout(WAIT, ws.next())
        .await
        .expect("timed out waiting for a message")
        .expect("stream ended")
        .expect("websocket error");
    msg.into_text().unwrap()
}

/// Raw socket with the upgrade done and the 101 response consumed
async fn raw_connect(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(UPGRADE).await.unwrap();

    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await.unwrap());
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    stream
}

fn masked(first: u8, len_byte: u8, payload: &[u8]) -> Vec<u8> {
    let key: [u8; 4] = rand::random();
    let mut frame = vec![first, 0x80 | len_byte];
    frame.extend_from_slice(&key);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    frame
}

async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut buf))
        .await
        .expect("server did not close the connection")
        .unwrap();
    buf
}

#[tokio::test]
async fn test_echo_with_websocket_client() {
    let server = spawn_server(Echo { poll_interval: POLL }).await;
    let mut ws = connect(server.addr).await;

    ws.send(Message::Text("hello".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "hello");

    ws.send(Message::Text("wörld ✓".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "wörld ✓");
}

#[tokio::test]
async fn test_chat_fan_out_excludes_sender() {
    let server = spawn_server(BroadcastChat { poll_interval: POLL }).await;
    let mut a = connect(server.addr).await;
    let mut b = connect(server.addr).await;
    let mut c = connect(server.addr).await;
    wait_for_clients(&server.registry, 3).await;

    a.send(Message::Text("from a".into())).await.unwrap();
    assert_eq!(next_text(&mut b).await, "from a");
    assert_eq!(next_text(&mut c).await, "from a");

    // The sender never sees its own chat message
    assert!(timeout(Duration::from_millis(200), a.next()).await.is_err());

    b.send(Message::Text("from b".into())).await.unwrap();
    assert_eq!(next_text(&mut a).await, "from b");
    assert_eq!(next_text(&mut c).await, "from b");
}

#[tokio::test]
async fn test_tick_rebroadcast_includes_sender() {
    let server = spawn_server(Ticker {
        period: Duration::from_millis(20),
    })
    .await;
    let mut a = connect(server.addr).await;
    let mut b = connect(server.addr).await;
    wait_for_clients(&server.registry, 2).await;

    a.send(Message::Text("marco".into())).await.unwrap();

    for ws in [&mut a, &mut b] {
        loop {
            let text = next_text(ws).await;
            if text == "marco" {
                break;
            }
            assert!(text.parse::<u64>().is_ok(), "unexpected message {}", text);
        }
    }
}

#[tokio::test]
async fn test_ticks_count_up() {
    let server = spawn_server(Ticker {
        period: Duration::from_millis(10),
    })
    .await;
    let mut ws = connect(server.addr).await;

    for expected in 0..3 {
        assert_eq!(next_text(&mut ws).await, expected.to_string());
    }
}

#[tokio::test]
async fn test_raw_frames_on_the_wire() {
    let server = spawn_server(Echo { poll_interval: POLL }).await;
    let mut stream = raw_connect(server.addr).await;

    stream.write_all(&masked(0x81, 2, b"hi")).await.unwrap();
    let mut echoed = [0u8; 4];
    timeout(WAIT, stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, [0x81, 2, b'h', b'i']);
}

#[tokio::test]
async fn test_payload_of_126_bytes_is_accepted() {
    let server = spawn_server(Echo { poll_interval: POLL }).await;
    let mut stream = raw_connect(server.addr).await;
    let text = vec![b'a'; 126];

    stream.write_all(&masked(0x81, 126, &text)).await.unwrap();
    let mut echoed = vec![0u8; 128];
    timeout(WAIT, stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed[..2], [0x81, 126]);
    assert_eq!(echoed[2..], text[..]);
}

#[tokio::test]
async fn test_binary_frame_gets_protocol_error_close() {
    let server = spawn_server(Echo { poll_interval: POLL }).await;
    let mut stream = raw_connect(server.addr).await;

    stream.write_all(&masked(0x82, 3, &[1, 2, 3])).await.unwrap();
    assert_eq!(read_to_end(&mut stream).await, [0x88, 2, 0x03, 0xea]);
}

#[tokio::test]
async fn test_client_close_frame_is_answered() {
    let server = spawn_server(Echo { poll_interval: POLL }).await;
    let mut stream = raw_connect(server.addr).await;

    stream.write_all(&masked(0x88, 2, &[0x03, 0xe8])).await.unwrap();
    assert_eq!(read_to_end(&mut stream).await, [0x88, 2, 0x03, 0xe8]);
}

#[tokio::test]
async fn test_unmasked_frame_is_rejected() {
    let server = spawn_server(Echo { poll_interval: POLL }).await;
    let mut stream = raw_connect(server.addr).await;

    stream.write_all(&[0x81, 2, b'h', b'i']).await.unwrap();
    assert_eq!(read_to_end(&mut stream).await, [0x88, 2, 0x03, 0xea]);
}

#[tokio::test]
async fn test_extended_length_is_rejected() {
    let server = spawn_server(Echo { poll_interval: POLL }).await;
    let mut stream = raw_connect(server.addr).await;

    stream.write_all(&[0x81, 0x80 | 127]).await.unwrap();
    assert_eq!(read_to_end(&mut stream).await, [0x88, 2, 0x03, 0xf1]);
}

#[tokio::test]
async fn test_missing_key_gets_bad_request() {
    let server = spawn_server(Echo { poll_interval: POLL }).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\r\n")
        .await
        .unwrap();
    let response = read_to_end(&mut stream).await;
    assert!(response.starts_with(b"HTTP/1.1 400 Bad Request"));

    // A bad client does not take the server down
    let mut ws = connect(server.addr).await;
    ws.send(Message::Text("still up".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "still up");
}

#[tokio::test]
async fn test_disconnect_removes_client() {
    let server = spawn_server(Echo { poll_interval: POLL }).await;
    let a = connect(server.addr).await;
    let _b = connect(server.addr).await;
    wait_for_clients(&server.registry, 2).await;

    drop(a);
    wait_for_clients(&server.registry, 1).await;
}

#[tokio::test]
async fn test_shutdown_closes_every_connection() {
    let server = spawn_server(Echo { poll_interval: POLL }).await;
    let mut a = connect(server.addr).await;
    let mut b = connect(server.addr).await;
    wait_for_clients(&server.registry, 2).await;

    server.stop.send(()).unwrap();
    let result = timeout(WAIT, server.task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(server.registry.len().await.unwrap(), 0);

    for ws in [&mut a, &mut b] {
        let next = timeout(WAIT, ws.next()).await.unwrap();
        assert!(matches!(next, None | Some(Err(_))));
    }
}
