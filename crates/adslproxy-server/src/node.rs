//! Server-side record of one live agent session.

use adslproxy_core::{Session, HEARTBEAT_INTERVAL, RECONNECT};
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

/// A named reverse forward owned by a node. The public listener lives inside
/// `accept_task`; aborting the task closes it.
pub struct Forward {
    pub name: String,
    /// The actually bound public address.
    pub left: SocketAddr,
    /// What the agent dials locally when a stream arrives.
    pub right: String,
    /// Opaque, echoed verbatim in admin listings.
    pub options: String,
    pub(crate) accept_task: JoinHandle<()>,
}

impl std::fmt::Display for Forward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} -> {}", self.name, self.left, self.right)
    }
}

/// One authenticated agent, alive for exactly the life of its session.
///
/// Mutated only by workers the node owns: the heartbeat supervisor updates
/// `heartbeat`, the request handler appends forwards. Everything else reads.
pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub remote_ip: IpAddr,
    session: Session,
    forwards: Mutex<Vec<Forward>>,
    heartbeat: Mutex<Instant>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    cleared: AtomicBool,
}

impl Node {
    pub fn new(id: Uuid, name: String, remote_ip: IpAddr, session: Session) -> Self {
        Self {
            id,
            name,
            remote_ip,
            session,
            forwards: Mutex::new(Vec::new()),
            heartbeat: Mutex::new(Instant::now()),
            heartbeat_task: Mutex::new(None),
            cleared: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// A node is alive while its last keepalive is younger than one
    /// heartbeat interval.
    pub fn is_alive(&self) -> bool {
        self.heartbeat_age() <= HEARTBEAT_INTERVAL
    }

    /// Record a successful keepalive round-trip. Monotonic by construction.
    pub fn touch(&self) {
        *self.heartbeat.lock() = Instant::now();
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.heartbeat.lock().elapsed()
    }

    /// Wall-clock time of the last successful keepalive, for admin output.
    pub fn last_heartbeat(&self) -> SystemTime {
        SystemTime::now() - self.heartbeat_age()
    }

    pub fn add_forward(&self, forward: Forward) {
        info!("new forwarding {} via {}", forward, self);
        self.forwards.lock().push(forward);
    }

    /// Run `f` over a snapshot-consistent view of the forward list.
    pub fn with_forwards<T>(&self, f: impl FnOnce(&[Forward]) -> T) -> T {
        f(&self.forwards.lock())
    }

    pub(crate) fn set_heartbeat_task(&self, task: JoinHandle<()>) {
        *self.heartbeat_task.lock() = Some(task);
    }

    /// Tell the agent to re-dial its WAN link, then drop the session. The
    /// session end runs the normal teardown path.
    pub fn redial(&self) {
        info!("redial requested for {}", self);
        self.session.notify(RECONNECT);
        self.session.close();
    }

    /// Stop the heartbeat supervisor, close every forward listener, close
    /// the session. Idempotent.
    pub fn clear(&self) {
        if self.cleared.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.heartbeat_task.lock().take() {
            task.abort();
        }

        for forward in self.forwards.lock().iter() {
            forward.accept_task.abort();
        }

        self.session.close();
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}[{}]", self.name, self.remote_ip, self.id)
    }
}
