//! Authenticated multiplex session between agent and server.
//!
//! One framed transport carries three kinds of traffic: out-of-band typed
//! requests with a boolean reply, named-forward registrations, and logical
//! byte streams opened by the server toward a named forward. A dispatch task
//! reads frames and routes them to per-stream buffers and pending-reply
//! slots; a writer task drains one outbound queue so any worker can send
//! without holding the transport.
//!
//! Closing the session is the single cancellation primitive: every pending
//! request errors out, every stream reader sees EOF, and both I/O tasks exit.

use crate::codec::{read_frame, write_frame};
use crate::error::{TunnelError, TunnelResult};
use crate::message::{Frame, ForwardSpec};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, warn};

/// Which peer this end of the session is. Streams are opened by the server
/// only; forward registrations travel agent to server only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Agent,
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<bool>>>>;
type PendingForwards = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<String, String>>>>>;
type StreamMap = Arc<Mutex<HashMap<u32, mpsc::UnboundedSender<Vec<u8>>>>>;

/// Handle to a live session. Cheap to clone; all clones share the same
/// underlying transport and die together.
#[derive(Clone)]
pub struct Session {
    outbound: mpsc::UnboundedSender<Frame>,
    pending_replies: PendingReplies,
    pending_forwards: PendingForwards,
    streams: StreamMap,
    next_request_id: Arc<AtomicU64>,
    next_stream_id: Arc<AtomicU32>,
    cancel: Arc<watch::Sender<bool>>,
    done: watch::Receiver<bool>,
}

/// Inbound traffic of a session, consumed by the owning peer's workers.
pub struct SessionEvents {
    /// Out-of-band requests from the remote peer.
    pub requests: mpsc::UnboundedReceiver<IncomingRequest>,
    /// Named-forward registrations (server side only).
    pub forwards: mpsc::UnboundedReceiver<IncomingForward>,
    /// Logical streams opened by the server (agent side only).
    pub streams: mpsc::UnboundedReceiver<IncomingStream>,
}

/// A typed request awaiting a boolean reply.
pub struct IncomingRequest {
    pub kind: String,
    pub payload: Vec<u8>,
    id: u64,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl IncomingRequest {
    pub fn reply(&self, ok: bool) {
        let _ = self.outbound.send(Frame::Reply { id: self.id, ok });
    }
}

/// A named-forward registration awaiting accept or reject.
pub struct IncomingForward {
    pub spec: ForwardSpec,
    id: u64,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl IncomingForward {
    /// Report the actually bound public address back to the agent.
    pub fn accept(&self, bound_addr: &str) {
        let _ = self.outbound.send(Frame::ForwardOk {
            id: self.id,
            bound_addr: bound_addr.to_string(),
        });
    }

    pub fn reject(&self, reason: &str) {
        let _ = self.outbound.send(Frame::ForwardFail {
            id: self.id,
            reason: reason.to_string(),
        });
    }
}

/// A logical stream opened by the server, tagged with its forward name.
pub struct IncomingStream {
    pub forward: String,
    pub stream: TunnelStream,
}

impl Session {
    /// Take ownership of an authenticated transport and start the session
    /// I/O tasks. The handshake must already have happened on `io`.
    pub fn spawn<S>(io: S, role: Role) -> (Session, SessionEvents)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);

        let (outbound, outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (request_tx, requests) = mpsc::unbounded_channel();
        let (forward_tx, forwards) = mpsc::unbounded_channel();
        let (stream_tx, streams_rx) = mpsc::unbounded_channel();

        let (cancel, cancel_rx) = watch::channel(false);
        let cancel = Arc::new(cancel);
        let (done_tx, done) = watch::channel(false);

        let session = Session {
            outbound: outbound.clone(),
            pending_replies: Arc::new(Mutex::new(HashMap::new())),
            pending_forwards: Arc::new(Mutex::new(HashMap::new())),
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: Arc::new(AtomicU64::new(1)),
            next_stream_id: Arc::new(AtomicU32::new(1)),
            cancel: cancel.clone(),
            done,
        };

        tokio::spawn(writer_loop(write_half, outbound_rx, cancel.clone(), cancel_rx.clone()));

        tokio::spawn(dispatch_loop(DispatchContext {
            read_half,
            role,
            outbound,
            pending_replies: session.pending_replies.clone(),
            pending_forwards: session.pending_forwards.clone(),
            streams: session.streams.clone(),
            request_tx,
            forward_tx,
            stream_tx,
            cancel,
            cancel_rx,
            done_tx,
        }));

        (
            session,
            SessionEvents {
                requests,
                forwards,
                streams: streams_rx,
            },
        )
    }

    /// Send a typed request and wait for the peer's boolean reply.
    pub async fn request(&self, kind: &str, payload: Vec<u8>) -> TunnelResult<bool> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_replies.lock().await.insert(id, tx);

        let frame = Frame::Request {
            id,
            kind: kind.to_string(),
            payload,
        };
        if self.outbound.send(frame).is_err() {
            self.pending_replies.lock().await.remove(&id);
            return Err(TunnelError::SessionClosed);
        }

        tokio::select! {
            res = rx => res.map_err(|_| TunnelError::SessionClosed),
            _ = self.closed() => Err(TunnelError::SessionClosed),
        }
    }

    /// Send a typed request without waiting for the reply.
    pub fn notify(&self, kind: &str) {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.outbound.send(Frame::Request {
            id,
            kind: kind.to_string(),
            payload: Vec::new(),
        });
    }

    /// Register a named forward (agent side) and return the public address
    /// the server actually bound.
    pub async fn register_forward(&self, spec: &ForwardSpec) -> TunnelResult<String> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_forwards.lock().await.insert(id, tx);

        let frame = Frame::ForwardRequest {
            id,
            name: spec.name.clone(),
            bind_addr: spec.bind_addr.clone(),
            target: spec.target.clone(),
            options: spec.options.clone(),
        };
        if self.outbound.send(frame).is_err() {
            self.pending_forwards.lock().await.remove(&id);
            return Err(TunnelError::SessionClosed);
        }

        let outcome = tokio::select! {
            res = rx => res.map_err(|_| TunnelError::SessionClosed)?,
            _ = self.closed() => return Err(TunnelError::SessionClosed),
        };
        outcome.map_err(TunnelError::Forward)
    }

    /// Open a logical stream toward the agent, tagged with a forward name
    /// (server side).
    pub async fn open_stream(&self, forward: &str) -> TunnelResult<TunnelStream> {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().await.insert(id, tx);

        let frame = Frame::StreamOpen {
            id,
            forward: forward.to_string(),
        };
        if self.outbound.send(frame).is_err() || self.is_closed() {
            self.streams.lock().await.remove(&id);
            return Err(TunnelError::SessionClosed);
        }

        Ok(TunnelStream::new(id, rx, self.outbound.clone()))
    }

    /// Tear the session down. Idempotent; unblocks every dependent worker.
    pub fn close(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait until the session has ended, however that happened.
    pub async fn closed(&self) {
        let mut done = self.done.clone();
        loop {
            if *done.borrow_and_update() {
                return;
            }
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.done.borrow()
    }
}

async fn writer_loop<W>(
    mut write_half: W,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
    cancel: Arc<watch::Sender<bool>>,
    mut cancel_rx: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel_rx.changed() => {
                // Flush frames queued before the close was requested (the
                // reconnect notification races its own teardown otherwise).
                // The transport deadlines bound this.
                while let Ok(frame) = outbound_rx.try_recv() {
                    if write_frame(&mut write_half, &frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut write_half, &frame).await {
                        debug!(error = %e, "session write failed");
                        let _ = cancel.send(true);
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

struct DispatchContext<R> {
    read_half: R,
    role: Role,
    outbound: mpsc::UnboundedSender<Frame>,
    pending_replies: PendingReplies,
    pending_forwards: PendingForwards,
    streams: StreamMap,
    request_tx: mpsc::UnboundedSender<IncomingRequest>,
    forward_tx: mpsc::UnboundedSender<IncomingForward>,
    stream_tx: mpsc::UnboundedSender<IncomingStream>,
    cancel: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
}

async fn dispatch_loop<R>(mut ctx: DispatchContext<R>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = ctx.cancel_rx.changed() => break,
            frame = read_frame::<_, Frame>(&mut ctx.read_half) => frame,
        };

        match frame {
            Ok(frame) => dispatch(&mut ctx, frame).await,
            Err(e) => {
                debug!(error = %e, "session read ended");
                break;
            }
        }
    }

    // Teardown: wake the writer, fail pending requests, EOF every stream.
    let _ = ctx.cancel.send(true);
    ctx.pending_replies.lock().await.clear();
    ctx.pending_forwards.lock().await.clear();
    ctx.streams.lock().await.clear();
    let _ = ctx.done_tx.send(true);
}

async fn dispatch<R>(ctx: &mut DispatchContext<R>, frame: Frame) {
    match frame {
        Frame::Request { id, kind, payload } => {
            let _ = ctx.request_tx.send(IncomingRequest {
                kind,
                payload,
                id,
                outbound: ctx.outbound.clone(),
            });
        }

        Frame::Reply { id, ok } => {
            match ctx.pending_replies.lock().await.remove(&id) {
                Some(tx) => {
                    let _ = tx.send(ok);
                }
                None => debug!(id, "reply without a pending request"),
            }
        }

        Frame::ForwardRequest {
            id,
            name,
            bind_addr,
            target,
            options,
        } => match ctx.role {
            Role::Server => {
                let _ = ctx.forward_tx.send(IncomingForward {
                    spec: ForwardSpec {
                        name,
                        bind_addr,
                        target,
                        options,
                    },
                    id,
                    outbound: ctx.outbound.clone(),
                });
            }
            Role::Agent => warn!(name = %name, "forward request from server ignored"),
        },

        Frame::ForwardOk { id, bound_addr } => {
            if let Some(tx) = ctx.pending_forwards.lock().await.remove(&id) {
                let _ = tx.send(Ok(bound_addr));
            }
        }

        Frame::ForwardFail { id, reason } => {
            if let Some(tx) = ctx.pending_forwards.lock().await.remove(&id) {
                let _ = tx.send(Err(reason));
            }
        }

        Frame::StreamOpen { id, forward } => match ctx.role {
            Role::Agent => {
                let (tx, rx) = mpsc::unbounded_channel();
                ctx.streams.lock().await.insert(id, tx);
                let stream = TunnelStream::new(id, rx, ctx.outbound.clone());
                let _ = ctx.stream_tx.send(IncomingStream { forward, stream });
            }
            // Streams are opened by the server only; anything else is an
            // unknown channel type and is rejected.
            Role::Server => {
                warn!(id, forward = %forward, "rejecting agent-initiated stream");
                let _ = ctx.outbound.send(Frame::StreamClose { id });
            }
        },

        Frame::StreamData { id, data } => {
            let mut streams = ctx.streams.lock().await;
            let stale = match streams.get(&id) {
                Some(tx) => tx.send(data).is_err(),
                None => {
                    debug!(id, "data for unknown stream");
                    false
                }
            };
            if stale {
                streams.remove(&id);
                let _ = ctx.outbound.send(Frame::StreamClose { id });
            }
        }

        Frame::StreamClose { id } => {
            ctx.streams.lock().await.remove(&id);
        }

        Frame::Hello { .. } | Frame::AuthOk {} | Frame::AuthFail { .. } => {
            warn!("handshake frame on an established session");
        }
    }
}

/// One logical byte stream multiplexed over the session.
///
/// Reads drain the per-stream buffer fed by the dispatch task; writes are
/// queued as `StreamData` frames. Dropping the stream (or shutting down the
/// write side) tells the peer to close its half.
pub struct TunnelStream {
    id: u32,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Frame>,
    read_buf: Vec<u8>,
    read_offset: usize,
    close_sent: bool,
}

impl TunnelStream {
    fn new(
        id: u32,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            id,
            rx,
            outbound,
            read_buf: Vec::new(),
            read_offset: 0,
            close_sent: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn send_close(&mut self) {
        if !self.close_sent {
            self.close_sent = true;
            let _ = self.outbound.send(Frame::StreamClose { id: self.id });
        }
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Drain leftover bytes from a previous chunk first.
        if this.read_offset < this.read_buf.len() {
            let available = &this.read_buf[this.read_offset..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            this.read_offset += n;
            if this.read_offset >= this.read_buf.len() {
                this.read_buf.clear();
                this.read_offset = 0;
            }
            return Poll::Ready(Ok(()));
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    this.read_buf = data;
                    this.read_offset = n;
                }
                Poll::Ready(Ok(()))
            }
            // Sender gone: the peer closed the stream or the session died.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.close_sent {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        let frame = Frame::StreamData {
            id: this.id,
            data: buf.to_vec(),
        };
        match this.outbound.send(frame) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().send_close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        self.send_close();
    }
}
