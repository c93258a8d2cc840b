//! Agent session manager.
//!
//! Per boot the agent dials the server, authenticates, registers its
//! forwards, then serves: a keepalive emitter, one worker per accepted
//! stream splicing to the configured local backend, and a control consumer
//! that reacts to the force-reconnect request. When the session dies for any
//! reason the caller runs the redialer and dials again.

use crate::redial::Redialer;
use crate::tls::{cert_fingerprint, insecure_client_config};
use adslproxy_core::session::IncomingStream;
use adslproxy_core::{
    codec, splice, ForwardSpec, Frame, Role, Session, SessionEvents, TimedStream, TunnelError,
    TunnelResult, CONNECT_TIMEOUT, HEARTBEAT_INTERVAL, KEEPALIVE, PROTOCOL_VERSION, READ_TIMEOUT,
    RECONNECT, WRITE_TIMEOUT,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Connection settings for one agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// `host:port` of the rendezvous server.
    pub server_addr: String,
    /// Username part of the advertised identity; a fresh uuid is appended
    /// per connection attempt.
    pub user: String,
    /// Shared secret presented at the handshake.
    pub token: String,
    /// The agent does not verify the server's host certificate; the shared
    /// token over the encrypted channel is the security guarantee, and an
    /// unpinned key can rotate without redeploying agents. Deployments must
    /// opt in here; `connect` refuses to run with this set to `false`.
    pub accept_any_host_cert: bool,
}

pub struct Agent {
    config: AgentConfig,
    forwards: Vec<ForwardSpec>,
    redialer: Option<Arc<dyn Redialer>>,
    redial_interval: Duration,
    stop: watch::Sender<bool>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            forwards: Vec::new(),
            redialer: None,
            redial_interval: Duration::from_secs(1),
            stop,
        }
    }

    pub fn add_forward(&mut self, spec: ForwardSpec) {
        self.forwards.push(spec);
    }

    pub fn set_redialer(&mut self, redialer: Arc<dyn Redialer>, interval: Duration) {
        self.redialer = Some(redialer);
        self.redial_interval = interval;
    }

    pub fn forwards(&self) -> &[ForwardSpec] {
        &self.forwards
    }

    /// Broadcast stop: ends the current session and the outer run loop.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Dial, register and serve until the session ends. One session only;
    /// [`Agent::run`] loops this with redialing in between.
    pub async fn start(&self) -> TunnelResult<()> {
        let (session, events) = self.connect().await?;

        // Register every forward in request order. Any refusal drops the
        // whole session and the caller retries from scratch.
        for spec in &self.forwards {
            match session.register_forward(spec).await {
                Ok(bound) => info!("tunnel created {} at {}", spec, bound),
                Err(e) => {
                    error!("failed to register {}: {}", spec, e);
                    session.close();
                    session.closed().await;
                    return Err(e);
                }
            }
        }

        self.serve(session, events).await;
        Ok(())
    }

    /// Keep the agent connected forever: dial, serve, redial, repeat.
    pub async fn run(&self) {
        loop {
            if self.stopped() {
                return;
            }
            if let Err(e) = self.start().await {
                error!("session failed: {}", e);
            }
            if self.stopped() {
                return;
            }
            self.reconnect().await;
        }
    }

    async fn connect(&self) -> TunnelResult<(Session, SessionEvents)> {
        if !self.config.accept_any_host_cert {
            return Err(TunnelError::Other(
                "host certificate verification is unsupported; set accept_any_host_cert".into(),
            ));
        }

        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.config.server_addr))
            .await
            .map_err(|_| TunnelError::Timeout)?
            .map_err(|e| {
                TunnelError::Transport(format!("connect {}: {e}", self.config.server_addr))
            })?;
        let timed = TimedStream::new(tcp, READ_TIMEOUT, WRITE_TIMEOUT);

        let host = self
            .config
            .server_addr
            .rsplit_once(':')
            .map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']'))
            .unwrap_or(self.config.server_addr.as_str());
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| TunnelError::Transport(format!("bad server name {host}: {e}")))?;

        let connector = TlsConnector::from(insecure_client_config());
        let mut tls = connector
            .connect(server_name, timed)
            .await
            .map_err(|e| TunnelError::Transport(format!("tls connect: {e}")))?;

        if let Some(cert) = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
        {
            info!(fingerprint = %cert_fingerprint(cert.as_ref()), "server certificate (unverified)");
        }

        // Fresh node id per connection attempt, so a re-dialed agent never
        // collides with its not-yet-reaped predecessor.
        let username = format!("{}@{}", self.config.user, Uuid::new_v4());
        let hello = Frame::Hello {
            version: PROTOCOL_VERSION.to_string(),
            username,
            token: self.config.token.clone(),
        };
        codec::write_frame(&mut tls, &hello).await?;

        match codec::read_frame(&mut tls).await? {
            Frame::AuthOk {} => {}
            Frame::AuthFail { reason } => return Err(TunnelError::Auth(reason)),
            _ => return Err(TunnelError::Protocol("unexpected handshake reply".into())),
        }

        info!("connected to {}", self.config.server_addr);
        Ok(Session::spawn(tls, Role::Agent))
    }

    async fn serve(&self, session: Session, mut events: SessionEvents) {
        let targets: HashMap<String, String> = self
            .forwards
            .iter()
            .map(|f| (f.name.clone(), f.target.clone()))
            .collect();

        // Keepalive emitter: the reply value is not inspected, only whether
        // the round-trip succeeded. The server keeps the liveness state.
        let keepalive_session = session.clone();
        let keepalive = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                if keepalive_session.request(KEEPALIVE, Vec::new()).await.is_err() {
                    keepalive_session.close();
                    return;
                }
            }
        });

        let mut stop = self.stop.subscribe();
        if *stop.borrow_and_update() {
            session.close();
        }
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    session.close();
                    break;
                }
                _ = session.closed() => break,
                stream = events.streams.recv() => match stream {
                    Some(stream) => spawn_stream_worker(&targets, stream),
                    None => break,
                },
                request = events.requests.recv() => match request {
                    Some(request) => {
                        // Everything is acknowledged; only the reconnect
                        // request tears the session down.
                        request.reply(true);
                        if request.kind == RECONNECT {
                            info!("reconnect requested by server");
                            session.close();
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        keepalive.abort();
        session.closed().await;
        warn!("disconnected from {}", self.config.server_addr);
    }

    /// Run the redialer until it reports success, ignoring individual
    /// failures (a redialer may legitimately fail mid-transition). Without a
    /// redialer this just waits one interval.
    async fn reconnect(&self) {
        let mut stop = self.stop.subscribe();
        if *stop.borrow_and_update() {
            return;
        }

        loop {
            tokio::select! {
                _ = stop.changed() => return,
                _ = tokio::time::sleep(self.redial_interval) => {}
            }

            let Some(redialer) = self.redialer.clone() else {
                return;
            };

            let result = tokio::task::spawn_blocking(move || redialer.redial()).await;
            match result {
                Ok(Ok(())) => {
                    info!("redial succeeded");
                    return;
                }
                Ok(Err(e)) => warn!("redial failed: {}", e),
                Err(e) => warn!("redial task failed: {}", e),
            }
        }
    }
}

fn spawn_stream_worker(targets: &HashMap<String, String>, incoming: IncomingStream) {
    let IncomingStream { forward, stream } = incoming;
    let Some(target) = targets.get(&forward).cloned() else {
        warn!(forward = %forward, "stream for unknown forward");
        return;
    };

    tokio::spawn(async move {
        let dial = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&target)).await;
        match dial {
            Ok(Ok(local)) => {
                let _ = splice(stream, local).await;
            }
            // Dropping the stream resets the public client; no retry.
            _ => warn!(target = %target, "failed to connect to service"),
        }
    });
}
