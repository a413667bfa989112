//! End-to-end tunnel tests
//!
//! Each test wires a proxy core and an agent core to the two ends of an
//! in-memory tunnel (or a real WebSocket) and drives real TCP clients
//! and origin servers on localhost.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use tnet::agent::{Agent, AgentOptions};
use tnet::obfuscation::{XorReader, XorWriter};
use tnet::protocol::Frame;
use tnet::proxy::{Proxy, ProxyOptions};
use tnet::tunnel::{self, TunnelConn, TunnelHandler};

const KEY: i64 = 816559;

/// An in-memory tunnel: proxy side is the transport listener.
fn tunnel_pair() -> (TunnelConn, TunnelConn) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let (proxy_read, proxy_write) = tokio::io::split(a);
    let (agent_read, agent_write) = tokio::io::split(b);
    (
        TunnelConn {
            tunnel_id: 1,
            is_listener: true,
            reader: Box::new(proxy_read),
            writer: Box::new(proxy_write),
        },
        TunnelConn {
            tunnel_id: 0,
            is_listener: false,
            reader: Box::new(agent_read),
            writer: Box::new(agent_write),
        },
    )
}

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

type SessionHandle = JoinHandle<tnet::Result<()>>;

async fn start_pair(listen: &str, connect: &str) -> (SessionHandle, SessionHandle) {
    start_pair_with(listen, connect, None).await
}

async fn start_pair_with(
    listen: &str,
    connect: &str,
    dump_dir: Option<std::path::PathBuf>,
) -> (SessionHandle, SessionHandle) {
    let (proxy_conn, agent_conn) = tunnel_pair();
    let proxy = Proxy::new(ProxyOptions {
        listen_addr: listen.to_string(),
        connect_addr: connect.to_string(),
        crypt_key: KEY,
        dump_dir,
    });
    let agent = Agent::new(AgentOptions { crypt_key: KEY });
    let proxy_task = tokio::spawn(async move { proxy.serve_tunnel(proxy_conn).await });
    let agent_task = tokio::spawn(async move { agent.serve_tunnel(agent_conn).await });
    (proxy_task, agent_task)
}

async fn connect_proxy(addr: &str) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("proxy listener at {} never came up", addr);
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) {
    w.write_all(&frame.to_bytes()).await.unwrap();
    w.flush().await.unwrap();
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Frame {
    Frame::read(r).await.unwrap()
}

#[tokio::test]
async fn happy_path_echo() {
    let origin = echo_server().await;
    let (_proxy, _agent) = start_pair("127.0.0.1:56080", &origin.to_string()).await;

    let mut client = connect_proxy("127.0.0.1:56080").await;
    client.write_all(b"hello\n").await.unwrap();

    let mut buf = [0u8; 6];
    timeout(Duration::from_secs(1), client.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&buf, b"hello\n");
}

#[tokio::test]
async fn agent_dial_failure_drops_the_client() {
    // Nothing listens on port 1.
    let (_proxy, _agent) = start_pair("127.0.0.1:56081", "127.0.0.1:1").await;

    let mut client = connect_proxy("127.0.0.1:56081").await;
    let mut buf = [0u8; 1];
    let res = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("client was not dropped");
    match res {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {} bytes from proxy", n),
    }
}

#[tokio::test]
async fn concurrent_streams_stay_separate() {
    let origin = echo_server().await;
    let (_proxy, _agent) = start_pair("127.0.0.1:56082", &origin.to_string()).await;

    let mut payload_a = vec![0u8; 1024 * 1024];
    let mut payload_b = vec![0u8; 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut payload_a);
    rand::thread_rng().fill_bytes(&mut payload_b);

    async fn pump(addr: &str, payload: Vec<u8>) -> Vec<u8> {
        let stream = connect_proxy(addr).await;
        let (mut read_half, mut write_half) = stream.into_split();
        let expected = payload.len();
        let writer = tokio::spawn(async move {
            for chunk in payload.chunks(32 * 1024) {
                write_half.write_all(chunk).await.unwrap();
            }
            // Keep the write half open until the echo has drained.
            write_half
        });
        let mut out = vec![0u8; expected];
        timeout(Duration::from_secs(30), read_half.read_exact(&mut out))
            .await
            .expect("echo timed out")
            .unwrap();
        drop(writer.await.unwrap());
        out
    }

    let (out_a, out_b) = tokio::join!(
        pump("127.0.0.1:56082", payload_a.clone()),
        pump("127.0.0.1:56082", payload_b.clone()),
    );
    assert_eq!(out_a, payload_a);
    assert_eq!(out_b, payload_b);
}

#[tokio::test]
async fn transport_loss_closes_streams_and_reconnect_works() {
    let origin = echo_server().await;
    let (proxy_task, agent_task) = start_pair("127.0.0.1:56084", &origin.to_string()).await;

    let mut client = connect_proxy("127.0.0.1:56084").await;
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(1), client.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();

    // Kill the transport out from under the session.
    agent_task.abort();

    let mut one = [0u8; 1];
    let res = timeout(Duration::from_secs(1), client.read(&mut one))
        .await
        .expect("stream did not close after transport loss");
    assert!(matches!(res, Ok(0) | Err(_)));

    let proxy_result = timeout(Duration::from_secs(5), proxy_task)
        .await
        .expect("proxy session did not end")
        .unwrap();
    assert!(proxy_result.is_err());

    // A fresh session serves new clients.
    let (_proxy2, _agent2) = start_pair("127.0.0.1:56085", &origin.to_string()).await;
    let mut client2 = connect_proxy("127.0.0.1:56085").await;
    client2.write_all(b"back").await.unwrap();
    timeout(Duration::from_secs(1), client2.read_exact(&mut buf))
        .await
        .expect("echo timed out after reconnect")
        .unwrap();
    assert_eq!(&buf, b"back");
}

#[tokio::test]
async fn mismatched_keys_fail_both_sessions() {
    let (proxy_conn, agent_conn) = tunnel_pair();
    let proxy = Proxy::new(ProxyOptions {
        listen_addr: "127.0.0.1:56086".to_string(),
        connect_addr: "127.0.0.1:9".to_string(),
        crypt_key: 1,
        dump_dir: None,
    });
    let agent = Agent::new(AgentOptions { crypt_key: 2 });
    let proxy_task = tokio::spawn(async move { proxy.serve_tunnel(proxy_conn).await });
    let agent_task = tokio::spawn(async move { agent.serve_tunnel(agent_conn).await });

    let agent_result = timeout(Duration::from_secs(5), agent_task)
        .await
        .expect("agent session hung")
        .unwrap();
    assert!(agent_result.is_err());

    let proxy_result = timeout(Duration::from_secs(5), proxy_task)
        .await
        .expect("proxy session hung")
        .unwrap();
    assert!(proxy_result.is_err());
}

#[tokio::test]
async fn unknown_stream_frames_are_ignored() {
    let origin = echo_server().await;

    let (peer_side, agent_side) = tokio::io::duplex(64 * 1024);
    let (peer_read, peer_write) = tokio::io::split(peer_side);
    let mut peer_w = XorWriter::new(peer_write, KEY);
    let mut peer_r = XorReader::new(peer_read, KEY);

    let (agent_read, agent_write) = tokio::io::split(agent_side);
    let agent = Agent::new(AgentOptions { crypt_key: KEY });
    let agent_task = tokio::spawn(async move {
        agent
            .serve_tunnel(TunnelConn {
                tunnel_id: 0,
                is_listener: false,
                reader: Box::new(agent_read),
                writer: Box::new(agent_write),
            })
            .await
    });

    // Handshake, acting as the proxy side.
    write_frame(&mut peer_w, &Frame::TunId { tunnel_id: 9 }).await;
    write_frame(
        &mut peer_w,
        &Frame::Config {
            connect_addr: origin.to_string(),
        },
    )
    .await;

    // Traffic for streams that never existed must be dropped silently.
    write_frame(
        &mut peer_w,
        &Frame::Send {
            stream_id: 99,
            data: Bytes::from_static(b"junk"),
        },
    )
    .await;
    write_frame(&mut peer_w, &Frame::Close { stream_id: 77 }).await;

    // The session is still alive: a real stream connects and echoes.
    write_frame(&mut peer_w, &Frame::Connect { stream_id: 1 }).await;
    match timeout(Duration::from_secs(5), read_frame(&mut peer_r))
        .await
        .expect("no ConnectResult")
    {
        Frame::ConnectResult {
            stream_id: 1,
            error: None,
        } => {}
        other => panic!("unexpected frame: {:?}", other),
    }

    write_frame(
        &mut peer_w,
        &Frame::Send {
            stream_id: 1,
            data: Bytes::from_static(b"echo?"),
        },
    )
    .await;
    let mut collected = Vec::new();
    while collected.len() < 5 {
        match timeout(Duration::from_secs(5), read_frame(&mut peer_r))
            .await
            .expect("echo never arrived")
        {
            Frame::Send { stream_id: 1, data } => collected.extend_from_slice(&data),
            other => panic!("unexpected frame: {:?}", other),
        }
    }
    assert_eq!(&collected, b"echo?");

    agent_task.abort();
}

#[tokio::test]
async fn half_close_reaches_the_origin() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = listener.local_addr().unwrap();
    let (received_tx, received_rx) = tokio::sync::oneshot::channel::<Vec<u8>>();
    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match conn.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    received.extend_from_slice(&buf[..n]);
                    conn.write_all(&buf[..n]).await.unwrap();
                }
            }
        }
        let _ = received_tx.send(received);
    });

    let (_proxy, _agent) = start_pair("127.0.0.1:56087", &origin_addr.to_string()).await;

    let mut client = connect_proxy("127.0.0.1:56087").await;
    let payload = b"ten--bytes";
    client.write_all(payload).await.unwrap();
    let mut echoed = [0u8; 10];
    timeout(Duration::from_secs(1), client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, payload);

    // Half-close the client's write side; the origin must observe the
    // payload followed by EOF.
    client.shutdown().await.unwrap();
    let received = timeout(Duration::from_secs(5), received_rx)
        .await
        .expect("origin never saw EOF")
        .unwrap();
    assert_eq!(received, payload);

    let mut one = [0u8; 1];
    let res = timeout(Duration::from_secs(5), client.read(&mut one))
        .await
        .expect("client never saw close");
    assert!(matches!(res, Ok(0) | Err(_)));
}

#[tokio::test]
async fn dump_files_capture_both_directions() {
    let origin = echo_server().await;
    let dump_dir = std::env::temp_dir().join(format!("tnet-dump-test-{}", std::process::id()));
    let _ = tokio::fs::remove_dir_all(&dump_dir).await;

    let (_proxy, _agent) =
        start_pair_with("127.0.0.1:56088", &origin.to_string(), Some(dump_dir.clone())).await;

    let mut client = connect_proxy("127.0.0.1:56088").await;
    client.write_all(b"hello\n").await.unwrap();
    let mut buf = [0u8; 6];
    timeout(Duration::from_secs(1), client.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    drop(client);

    // Wait for the stream to tear down and flush its dump files.
    let stream_dir = dump_dir.join("1").join("1");
    let mut read_dump = Vec::new();
    let mut write_dump = Vec::new();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let read_contents = tokio::fs::read(stream_dir.join("read.dmp")).await;
        let write_contents = tokio::fs::read(stream_dir.join("write.dmp")).await;
        if let (Ok(read_contents), Ok(write_contents)) = (read_contents, write_contents) {
            if read_contents.len() >= 6 && write_contents.len() >= 6 {
                read_dump = read_contents;
                write_dump = write_contents;
                break;
            }
        }
    }
    assert_eq!(&read_dump, b"hello\n");
    assert_eq!(&write_dump, b"hello\n");

    let _ = tokio::fs::remove_dir_all(&dump_dir).await;
}

#[tokio::test]
async fn websocket_end_to_end() {
    let origin = echo_server().await;

    let agent: Arc<dyn TunnelHandler> = Arc::new(Agent::new(AgentOptions { crypt_key: KEY }));
    let ws_listener = tunnel::listener_for("ws://127.0.0.1:56089/stream").unwrap();
    tokio::spawn(async move {
        let _ = ws_listener.listen_and_serve(agent).await;
    });

    let proxy: Arc<dyn TunnelHandler> = Arc::new(Proxy::new(ProxyOptions {
        listen_addr: "127.0.0.1:56090".to_string(),
        connect_addr: origin.to_string(),
        crypt_key: KEY,
        dump_dir: None,
    }));
    let dialer = tunnel::dialer_for("ws://127.0.0.1:56089/stream").unwrap();
    tokio::spawn(async move {
        for _ in 0..50 {
            match dialer.dial_and_serve(Arc::clone(&proxy)).await {
                Ok(()) => break,
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    });

    let mut client = connect_proxy("127.0.0.1:56090").await;
    client.write_all(b"over websockets").await.unwrap();
    let mut buf = [0u8; 15];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&buf, b"over websockets");
}
