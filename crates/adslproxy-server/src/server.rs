//! Rendezvous server: session acceptor, handshake, forward registration.
//!
//! One accept loop on the agent-facing port. Each accepted transport is
//! wrapped in per-operation deadlines, TLS-terminated, authenticated, and
//! tracked as a [`Node`] until its session ends, at which point every
//! listener it owns is closed and it drops out of the registry.

use crate::node::{Forward, Node};
use crate::registry::Registry;
use adslproxy_core::session::{IncomingForward, SessionEvents};
use adslproxy_core::{
    codec, parse_user_id, splice, Frame, Role, Session, TimedStream, TunnelError, TunnelResult,
    KEEPALIVE, PROTOCOL_VERSION, READ_TIMEOUT, WRITE_TIMEOUT,
};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub struct Server {
    token: String,
    registry: Arc<Registry>,
    tls: TlsAcceptor,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Server {
    pub fn new(token: String, tls: Arc<rustls::ServerConfig>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            token,
            registry: Arc::new(Registry::new()),
            tls: TlsAcceptor::from(tls),
            stopped: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Accept agent sessions until [`Server::stop`] is called or the
    /// listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((conn, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(conn, peer).await {
                            debug!(peer = %peer, error = %e, "session ended with error");
                        }
                    });
                }
                Err(e) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(error = %e, "accept failed");
                }
            }
        }

        Ok(())
    }

    /// Close the acceptor and clear every node. Idempotent; the second call
    /// finds nothing left to close.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        self.registry.clear_nodes();
    }

    async fn handle_connection(&self, conn: TcpStream, peer: SocketAddr) -> TunnelResult<()> {
        let timed = TimedStream::new(conn, READ_TIMEOUT, WRITE_TIMEOUT);
        let mut tls = self
            .tls
            .accept(timed)
            .await
            .map_err(|e| TunnelError::Transport(format!("tls accept: {e}")))?;

        // Handshake: one Hello frame, answered with AuthOk or AuthFail.
        let (name, id) = match self.verify_hello(&mut tls).await {
            Ok(identity) => {
                codec::write_frame(&mut tls, &Frame::AuthOk {}).await?;
                identity
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "handshake refused");
                let reply = Frame::AuthFail {
                    reason: e.to_string(),
                };
                let _ = codec::write_frame(&mut tls, &reply).await;
                return Err(e);
            }
        };

        let (session, events) = Session::spawn(tls, Role::Server);
        let node = Arc::new(Node::new(id, name, peer.ip(), session.clone()));
        info!("connection from {}", node);

        self.registry.add(&node);
        let handler = tokio::spawn(handle_session_events(node.clone(), events));

        session.closed().await;
        info!("disconnection from {}", node);

        handler.abort();
        node.clear();
        self.registry.remove(&node);
        Ok(())
    }

    async fn verify_hello<S>(&self, tls: &mut S) -> TunnelResult<(String, uuid::Uuid)>
    where
        S: tokio::io::AsyncRead + Unpin,
    {
        let hello: Frame = codec::read_frame(tls).await?;
        let Frame::Hello {
            version,
            username,
            token,
        } = hello
        else {
            return Err(TunnelError::Protocol("expected hello".into()));
        };

        if version != PROTOCOL_VERSION {
            return Err(TunnelError::Auth(format!(
                "unsupported protocol version {version}"
            )));
        }
        if token != self.token {
            return Err(TunnelError::Auth("invalid token".into()));
        }

        let (name, id) = parse_user_id(&username)?;
        if self.registry.find_by_id(&id).is_some() {
            return Err(TunnelError::Auth(format!("node already exists {id}")));
        }

        Ok((name, id))
    }
}

/// Request dispatch for one session: forward registrations open listeners,
/// keepalives get `true`, everything else gets `false`.
async fn handle_session_events(node: Arc<Node>, mut events: SessionEvents) {
    loop {
        tokio::select! {
            forward = events.forwards.recv() => match forward {
                Some(forward) => register_forward(&node, forward).await,
                None => break,
            },
            request = events.requests.recv() => match request {
                Some(request) => {
                    if request.kind.contains(KEEPALIVE) {
                        request.reply(true);
                    } else {
                        info!(kind = %request.kind, "request ignored");
                        request.reply(false);
                    }
                }
                None => break,
            },
        }
    }
}

/// Bind the public listener for one named forward. A bind failure fails
/// only this registration; the session stays up.
async fn register_forward(node: &Arc<Node>, forward: IncomingForward) {
    let spec = forward.spec.clone();

    let listener = match TcpListener::bind(&spec.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("failed to bind {} for {}: {}", spec.bind_addr, node, e);
            forward.reject(&e.to_string());
            return;
        }
    };

    let bound = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            forward.reject(&e.to_string());
            return;
        }
    };

    let accept_task = tokio::spawn(forward_accept_loop(
        listener,
        node.session().clone(),
        spec.name.clone(),
    ));

    node.add_forward(Forward {
        name: spec.name,
        left: bound,
        right: spec.target,
        options: spec.options,
        accept_task,
    });
    forward.accept(&bound.to_string());
}

/// Accept public connections for a forward and splice each into a fresh
/// stream toward the owning agent.
async fn forward_accept_loop(listener: TcpListener, session: Session, forward_name: String) {
    loop {
        match listener.accept().await {
            Ok((conn, peer)) => {
                debug!(peer = %peer, forward = %forward_name, "public connection");
                let session = session.clone();
                let name = forward_name.clone();
                tokio::spawn(async move {
                    match session.open_stream(&name).await {
                        Ok(stream) => {
                            let _ = splice(conn, stream).await;
                        }
                        // Session gone: drop the connection, the client
                        // sees a reset.
                        Err(e) => debug!(error = %e, "stream open failed"),
                    }
                });
            }
            Err(e) => {
                warn!(forward = %forward_name, error = %e, "accept failed");
                break;
            }
        }
    }
}
