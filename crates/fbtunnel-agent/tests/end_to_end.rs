//! End-to-end tests: real server, real agent, real sockets
//!
//! Everything runs on ephemeral loopback ports with the control channel in
//! plain-TCP mode, so no TLS material is needed.

use fbtunnel_agent::{Agent, AgentConfig};
use fbtunnel_proto::{FrameType, Handshake};
use fbtunnel_server::{ServerConfig, ServerHandle, TunnelServer};
use fbtunnel_transport::FrameStream;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "test-secret";

struct TestServer {
    handle: ServerHandle,
    public_addr: SocketAddr,
    control_addr: SocketAddr,
    root: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

async fn start_server(ready_timeout: Duration) -> TestServer {
    let config = ServerConfig {
        public_addr: "127.0.0.1:0".to_string(),
        control_addr: "127.0.0.1:0".to_string(),
        auth_token: TOKEN.to_string(),
        cert_path: None,
        key_path: None,
        insecure: true,
        max_tunnels: None,
        ready_timeout,
    };

    let server = TunnelServer::bind(config).await.unwrap();
    let handle = server.handle();
    let public_addr = server.public_addr().unwrap();
    let control_addr = server.control_addr().unwrap();

    let root = CancellationToken::new();
    tokio::spawn(server.serve(root.clone()));

    TestServer {
        handle,
        public_addr,
        control_addr,
        root,
    }
}

struct TestAgent {
    agent: Agent,
    root: CancellationToken,
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

async fn start_agent(control_addr: SocketAddr, backend_addr: String) -> TestAgent {
    let config = AgentConfig {
        server_addr: control_addr.to_string(),
        backend_addr,
        auth_token: TOKEN.to_string(),
        ca_cert: None,
        insecure: true,
        skip_verify: false,
    };

    let root = CancellationToken::new();
    let agent = Agent::new(config, root.clone()).unwrap();
    tokio::spawn(agent.clone().run());

    TestAgent { agent, root }
}

/// Backend that echoes every byte back
async fn spawn_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = socket.into_split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });

    addr
}

/// Loopback port with nothing listening on it
async fn dead_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Handshake as a raw agent would, returning the split stream on accept
async fn fake_agent_handshake(
    control_addr: SocketAddr,
    authorization: &str,
) -> (FrameStream, Handshake) {
    let tcp = TcpStream::connect(control_addr).await.unwrap();
    let mut stream = FrameStream::new(tcp);
    stream
        .send_handshake(&Handshake::Hello {
            authorization: authorization.to_string(),
        })
        .await
        .unwrap();
    let response = stream.recv_handshake().await.unwrap().unwrap();
    (stream, response)
}

#[tokio::test]
async fn test_echo_round_trip() {
    let server = start_server(Duration::from_secs(15)).await;
    let backend = spawn_echo_backend().await;
    let agent = start_agent(server.control_addr, backend.to_string()).await;

    wait_until(|| server.handle.agent_connected(), "agent to connect").await;

    let mut client = TcpStream::connect(server.public_addr).await.unwrap();
    client.write_all(b"ping\n").await.unwrap();

    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ping\n");

    let handle = server.handle.clone();
    wait_until(|| handle.active_tunnels() == 1, "tunnel to register").await;
    assert_eq!(agent.agent.active_tunnels(), 1);

    // Client close tears the tunnel down on both sides
    drop(client);
    let handle = server.handle.clone();
    wait_until(|| handle.active_tunnels() == 0, "server registry to empty").await;
    let agent_ref = agent.agent.clone();
    wait_until(|| agent_ref.active_tunnels() == 0, "agent registry to empty").await;
}

#[tokio::test]
async fn test_large_transfer_preserves_bytes() {
    let server = start_server(Duration::from_secs(15)).await;
    let backend = spawn_echo_backend().await;
    let _agent = start_agent(server.control_addr, backend.to_string()).await;

    wait_until(|| server.handle.agent_connected(), "agent to connect").await;

    // Several 32 KiB read-buffer chunks worth of patterned data
    let payload: Vec<u8> = (0..128 * 1024).map(|i| (i % 251) as u8).collect();

    let mut client = TcpStream::connect(server.public_addr).await.unwrap();
    client.write_all(&payload).await.unwrap();

    let mut reply = vec![0u8; payload.len()];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, payload);
}

#[tokio::test]
async fn test_backend_refused() {
    let server = start_server(Duration::from_secs(15)).await;
    let backend = dead_port().await;
    let agent = start_agent(server.control_addr, backend.to_string()).await;

    wait_until(|| server.handle.agent_connected(), "agent to connect").await;

    let mut client = TcpStream::connect(server.public_addr).await.unwrap();

    // Agent reports ERROR then CLOSE; the server closes the client socket
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("client socket should close promptly")
        .unwrap();
    assert_eq!(n, 0);

    let handle = server.handle.clone();
    wait_until(|| handle.active_tunnels() == 0, "server registry to empty").await;
    assert_eq!(agent.agent.active_tunnels(), 0);
}

#[tokio::test]
async fn test_ready_timeout() {
    let server = start_server(Duration::from_millis(300)).await;

    // A raw agent that authenticates but never answers START
    let (stream, response) = fake_agent_handshake(server.control_addr, TOKEN).await;
    assert_eq!(response, Handshake::Accept);
    let (mut receiver, _sender) = stream.into_split();

    wait_until(|| server.handle.agent_connected(), "agent to connect").await;

    let mut client = TcpStream::connect(server.public_addr).await.unwrap();

    let start = receiver.recv().await.unwrap().unwrap();
    assert_eq!(start.kind(), Some(FrameType::StartDataTunnel));

    // No TUNNEL_READY: at the deadline the server closes the client and
    // notifies the agent
    let close = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("server should notify within the ready timeout")
        .unwrap()
        .unwrap();
    assert_eq!(close.kind(), Some(FrameType::CloseTunnel));
    assert_eq!(close.connection_id, start.connection_id);
    assert_eq!(close.close_reason(), "Timeout waiting for ready");

    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
    assert_eq!(server.handle.active_tunnels(), 0);
}

#[tokio::test]
async fn test_agent_disconnect_mid_stream() {
    let server = start_server(Duration::from_secs(15)).await;
    let backend = spawn_echo_backend().await;
    let agent = start_agent(server.control_addr, backend.to_string()).await;

    wait_until(|| server.handle.agent_connected(), "agent to connect").await;

    // Two live tunnels carrying traffic
    let mut client1 = TcpStream::connect(server.public_addr).await.unwrap();
    let mut client2 = TcpStream::connect(server.public_addr).await.unwrap();
    for client in [&mut client1, &mut client2] {
        client.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"hello");
    }
    assert_eq!(server.handle.active_tunnels(), 2);

    // Kill the agent
    agent.root.cancel();

    let handle = server.handle.clone();
    wait_until(|| handle.active_tunnels() == 0, "server registry to empty").await;
    let handle = server.handle.clone();
    wait_until(|| !handle.agent_connected(), "session to clear").await;

    // Both client sockets observe EOF
    for client in [&mut client1, &mut client2] {
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("client socket should close")
            .unwrap();
        assert_eq!(n, 0);
    }

    // New clients are accepted then closed immediately until reconnect
    let mut late_client = TcpStream::connect(server.public_addr).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), late_client.read(&mut buf))
        .await
        .expect("client socket should close")
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(server.handle.active_tunnels(), 0);
}

#[tokio::test]
async fn test_bad_token_rejected() {
    let server = start_server(Duration::from_secs(15)).await;

    let (_stream, response) = fake_agent_handshake(server.control_addr, "Bearer wrong").await;
    match response {
        Handshake::Reject { reason } => {
            assert!(reason.starts_with("unauthenticated"), "reason: {}", reason)
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(!server.handle.agent_connected());
}

#[tokio::test]
async fn test_second_agent_rejected() {
    let server = start_server(Duration::from_secs(15)).await;
    let backend = spawn_echo_backend().await;
    let _agent = start_agent(server.control_addr, backend.to_string()).await;

    wait_until(|| server.handle.agent_connected(), "agent to connect").await;

    // Second agent with the correct token is still refused
    let (_stream, response) =
        fake_agent_handshake(server.control_addr, &format!("Bearer {}", TOKEN)).await;
    assert_eq!(
        response,
        Handshake::Reject {
            reason: "agent already connected".to_string()
        }
    );

    // The first agent keeps working
    let mut client = TcpStream::connect(server.public_addr).await.unwrap();
    client.write_all(b"still-alive").await.unwrap();
    let mut reply = [0u8; 11];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"still-alive");
}

#[tokio::test]
async fn test_no_agent_accepts_then_closes() {
    let server = start_server(Duration::from_secs(15)).await;

    let mut client = TcpStream::connect(server.public_addr).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("client socket should close immediately")
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(server.handle.active_tunnels(), 0);
}

#[tokio::test]
async fn test_agent_reconnects_after_server_restart() {
    let backend = spawn_echo_backend().await;

    let server = start_server(Duration::from_secs(15)).await;
    let control_addr = server.control_addr;
    let agent = start_agent(control_addr, backend.to_string()).await;

    wait_until(|| server.handle.agent_connected(), "agent to connect").await;

    // Stop the server; the agent enters its backoff loop
    server.root.cancel();
    drop(server);
    let agent_ref = agent.agent.clone();
    wait_until(|| !agent_ref.link_up(), "agent to notice the loss").await;

    // Restart on the same port and wait for the reconnect (1s backoff).
    // The old listener may take a moment to release the port.
    let config = ServerConfig {
        public_addr: "127.0.0.1:0".to_string(),
        control_addr: control_addr.to_string(),
        auth_token: TOKEN.to_string(),
        cert_path: None,
        key_path: None,
        insecure: true,
        max_tunnels: None,
        ready_timeout: Duration::from_secs(15),
    };
    let mut restarted = TunnelServer::bind(config.clone()).await;
    for _ in 0..40 {
        if restarted.is_ok() {
            break;
        }
        sleep(Duration::from_millis(50)).await;
        restarted = TunnelServer::bind(config.clone()).await;
    }
    let restarted = restarted.unwrap();
    let handle = restarted.handle();
    let public_addr = restarted.public_addr().unwrap();
    let root = CancellationToken::new();
    tokio::spawn(restarted.serve(root.clone()));

    let observed = handle.clone();
    wait_until(|| observed.agent_connected(), "agent to reconnect").await;

    let mut client = TcpStream::connect(public_addr).await.unwrap();
    client.write_all(b"back").await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"back");

    root.cancel();
}
