//! End-to-end tests: a real server and a real agent over loopback TLS.

use adslproxy_agent::{Agent, AgentConfig, Redialer};
use adslproxy_core::{codec, ForwardSpec, Frame, TimedStream, PROTOCOL_VERSION, READ_TIMEOUT, WRITE_TIMEOUT};
use adslproxy_server::{api, tls, Server};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

struct TestHarness {
    server: Arc<Server>,
    tunnel_addr: SocketAddr,
    http_addr: SocketAddr,
}

async fn start_server(token: &str) -> TestHarness {
    let dir = std::env::temp_dir().join(format!("adslproxy-e2e-{}", Uuid::new_v4()));
    let (cert, key) = tls::generate_self_signed(&dir).unwrap();
    let tls_config = tls::load_tls_config(&cert, &key).unwrap();

    let server = Server::new(token.to_string(), tls_config);

    let tunnel_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_addr = tunnel_listener.local_addr().unwrap();
    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http_listener.local_addr().unwrap();

    let run_server = server.clone();
    tokio::spawn(async move {
        let _ = run_server.run(tunnel_listener).await;
    });
    let registry = server.registry().clone();
    tokio::spawn(async move {
        let _ = api::serve(http_listener, registry).await;
    });

    TestHarness {
        server,
        tunnel_addr,
        http_addr,
    }
}

/// Echo service the agent forwards to.
async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = conn.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

fn test_agent(harness: &TestHarness, token: &str, forwards: &[ForwardSpec]) -> Arc<Agent> {
    let mut agent = Agent::new(AgentConfig {
        server_addr: harness.tunnel_addr.to_string(),
        user: "demo".into(),
        token: token.into(),
        accept_any_host_cert: true,
    });
    for forward in forwards {
        agent.add_forward(forward.clone());
    }
    Arc::new(agent)
}

async fn nodes_json(http_addr: SocketAddr) -> serde_json::Value {
    reqwest::get(format!("http://{http_addr}/api/nodes/"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

fn has_forward(nodes: &serde_json::Value) -> bool {
    nodes.as_array().is_some_and(|n| {
        !n.is_empty() && n[0]["forward_list"].as_array().is_some_and(|f| !f.is_empty())
    })
}

/// Poll the admin API until `predicate` accepts the node list.
async fn wait_for_nodes(
    http_addr: SocketAddr,
    timeout: Duration,
    predicate: impl Fn(&serde_json::Value) -> bool,
) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let nodes = nodes_json(http_addr).await;
        if predicate(&nodes) {
            return nodes;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for node state, last: {nodes}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Raw protocol client: TLS + handshake only, no session machinery.
async fn raw_handshake(
    tunnel_addr: SocketAddr,
    username: &str,
    token: &str,
) -> (
    tokio_rustls::client::TlsStream<TimedStream<TcpStream>>,
    Frame,
) {
    let tcp = TcpStream::connect(tunnel_addr).await.unwrap();
    let timed = TimedStream::new(tcp, READ_TIMEOUT, WRITE_TIMEOUT);
    let connector = tokio_rustls::TlsConnector::from(adslproxy_agent::tls::insecure_client_config());
    let server_name = rustls::pki_types::ServerName::try_from("127.0.0.1".to_string()).unwrap();
    let mut tls = connector.connect(server_name, timed).await.unwrap();

    codec::write_frame(
        &mut tls,
        &Frame::Hello {
            version: PROTOCOL_VERSION.to_string(),
            username: username.to_string(),
            token: token.to_string(),
        },
    )
    .await
    .unwrap();

    let reply = codec::read_frame(&mut tls).await.unwrap();
    (tls, reply)
}

#[tokio::test]
async fn forward_round_trip_echoes_bytes() {
    let harness = start_server("t").await;
    let echo = start_echo_backend().await;

    let agent = test_agent(
        &harness,
        "t",
        &[ForwardSpec::new("echo", "127.0.0.1:0", &echo.to_string())],
    );
    let run_agent = agent.clone();
    tokio::spawn(async move { run_agent.run().await });

    let nodes = wait_for_nodes(harness.http_addr, Duration::from_secs(5), has_forward).await;

    let node = &nodes[0];
    assert_eq!(node["name"], "demo");
    let left = node["forward_list"][0]["left"].as_str().unwrap();
    let bound: SocketAddr = left.parse().unwrap();
    assert_ne!(bound.port(), 0);

    let mut client = TcpStream::connect(("127.0.0.1", bound.port())).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    agent.stop();
    harness.server.stop();
}

#[tokio::test]
async fn wrong_token_is_refused_without_a_node() {
    let harness = start_server("t").await;
    let agent = test_agent(
        &harness,
        "wrong",
        &[ForwardSpec::new("echo", "127.0.0.1:0", "127.0.0.1:9")],
    );

    let err = agent.start().await.unwrap_err();
    assert!(matches!(err, adslproxy_core::TunnelError::Auth(_)));
    assert!(harness.server.registry().is_empty());

    harness.server.stop();
}

#[tokio::test]
async fn duplicate_node_id_is_refused_and_first_survives() {
    let harness = start_server("t").await;
    let id = Uuid::new_v4();
    let username = format!("demo@{id}");

    let (_first, reply) = raw_handshake(harness.tunnel_addr, &username, "t").await;
    assert_eq!(reply, Frame::AuthOk {});

    let (_second, reply) = raw_handshake(harness.tunnel_addr, &username, "t").await;
    let Frame::AuthFail { reason } = reply else {
        panic!("expected auth failure, got {reply:?}");
    };
    assert!(reason.contains("already exists"));

    // The first node stayed registered.
    assert_eq!(harness.server.registry().len(), 1);
    harness.server.stop();
}

#[tokio::test]
async fn malformed_username_is_refused() {
    let harness = start_server("t").await;

    let (_conn, reply) = raw_handshake(harness.tunnel_addr, "demo", "t").await;
    assert!(matches!(reply, Frame::AuthFail { .. }));
    assert!(harness.server.registry().is_empty());

    harness.server.stop();
}

#[tokio::test]
async fn unreachable_backend_resets_public_conn_but_keeps_session() {
    let harness = start_server("t").await;

    // Port 9 (discard) on loopback with nothing listening.
    let agent = test_agent(
        &harness,
        "t",
        &[ForwardSpec::new("dead", "127.0.0.1:0", "127.0.0.1:9")],
    );
    let run_agent = agent.clone();
    tokio::spawn(async move { run_agent.run().await });

    let nodes = wait_for_nodes(harness.http_addr, Duration::from_secs(5), has_forward).await;
    let left: SocketAddr = nodes[0]["forward_list"][0]["left"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    // The public connection is accepted, then closed when the local dial
    // fails; no bytes ever come back.
    let mut client = TcpStream::connect(("127.0.0.1", left.port())).await.unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(10), client.read_to_end(&mut buf)).await;
    assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));

    // The session itself stays registered.
    assert_eq!(harness.server.registry().len(), 1);

    agent.stop();
    harness.server.stop();
}

struct CountingRedialer(AtomicUsize);

impl Redialer for CountingRedialer {
    fn redial(&self) -> io::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn api_redial_replaces_the_node() {
    let harness = start_server("t").await;
    let echo = start_echo_backend().await;

    let mut agent = Agent::new(AgentConfig {
        server_addr: harness.tunnel_addr.to_string(),
        user: "demo".into(),
        token: "t".into(),
        accept_any_host_cert: true,
    });
    agent.add_forward(ForwardSpec::new("echo", "127.0.0.1:0", &echo.to_string()));
    let redialer = Arc::new(CountingRedialer(AtomicUsize::new(0)));
    agent.set_redialer(redialer.clone(), Duration::from_millis(100));

    let agent = Arc::new(agent);
    let run_agent = agent.clone();
    tokio::spawn(async move { run_agent.run().await });

    let nodes = wait_for_nodes(harness.http_addr, Duration::from_secs(5), |nodes| {
        nodes.as_array().is_some_and(|n| !n.is_empty())
    })
    .await;
    let old_id = nodes[0]["id"].as_str().unwrap().to_string();

    let status = reqwest::Client::new()
        .post(format!(
            "http://{}/api/nodes/{}/redial",
            harness.http_addr, old_id
        ))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::OK);

    // The old node disappears and a fresh one (new id) takes its place
    // after the redialer reports success.
    wait_for_nodes(harness.http_addr, Duration::from_secs(10), |nodes| {
        nodes
            .as_array()
            .is_some_and(|n| n.len() == 1 && n[0]["id"].as_str() != Some(old_id.as_str()))
    })
    .await;
    assert!(redialer.0.load(Ordering::SeqCst) >= 1);

    agent.stop();
    harness.server.stop();
}

#[tokio::test]
async fn unknown_node_redial_is_404() {
    let harness = start_server("t").await;

    let status = reqwest::Client::new()
        .post(format!(
            "http://{}/api/nodes/{}/redial",
            harness.http_addr,
            Uuid::new_v4()
        ))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);

    harness.server.stop();
}

#[tokio::test]
async fn silent_agent_is_reaped_by_heartbeat() {
    let harness = start_server("t").await;
    let id = Uuid::new_v4();

    // Authenticate, then go silent: never answer keepalives.
    let (_conn, reply) = raw_handshake(harness.tunnel_addr, &format!("demo@{id}"), "t").await;
    assert_eq!(reply, Frame::AuthOk {});
    assert_eq!(harness.server.registry().len(), 1);

    // Within two heartbeat intervals the transport deadline fires and the
    // node is gone.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !harness.server.registry().is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "node was never reaped"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    harness.server.stop();
}

#[tokio::test]
async fn server_stop_is_idempotent() {
    let harness = start_server("t").await;
    let echo = start_echo_backend().await;

    let agent = test_agent(
        &harness,
        "t",
        &[ForwardSpec::new("echo", "127.0.0.1:0", &echo.to_string())],
    );
    let run_agent = agent.clone();
    tokio::spawn(async move { run_agent.run().await });

    wait_for_nodes(harness.http_addr, Duration::from_secs(5), |nodes| {
        nodes.as_array().is_some_and(|n| !n.is_empty())
    })
    .await;

    agent.stop();
    harness.server.stop();
    harness.server.stop();

    // Clearing closed the session; its teardown drains the registry.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !harness.server.registry().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "registry never drained");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
