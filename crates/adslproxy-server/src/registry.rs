//! Ordered registry of live nodes.
//!
//! A plain vector under one exclusive lock: node counts are small, listing
//! is the most frequent read, and registration order gives deterministic
//! admin output. Id uniqueness is enforced at the handshake, not here.

use crate::node::Node;
use adslproxy_core::{HEARTBEAT_INTERVAL, KEEPALIVE};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
pub struct Registry {
    nodes: Mutex<Vec<Arc<Node>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the node and start its heartbeat supervisor. The `Arc` itself
    /// is the removal handle.
    pub fn add(&self, node: &Arc<Node>) {
        self.nodes.lock().push(node.clone());

        let task = tokio::spawn(heartbeat_loop(node.clone()));
        node.set_heartbeat_task(task);
    }

    /// Remove by handle. Idempotent.
    pub fn remove(&self, node: &Arc<Node>) {
        self.nodes.lock().retain(|n| !Arc::ptr_eq(n, node));
    }

    pub fn find_by_id(&self, id: &Uuid) -> Option<Arc<Node>> {
        self.nodes.lock().iter().find(|n| n.id == *id).cloned()
    }

    /// Snapshot copy, in registration order.
    pub fn list(&self) -> Vec<Arc<Node>> {
        self.nodes.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Clear every node (stop ticker, close listeners, close session). The
    /// nodes fall out of the registry when their session loops unwind.
    pub fn clear_nodes(&self) {
        for node in self.nodes.lock().iter() {
            node.clear();
        }
    }
}

/// Per-node heartbeat supervisor: one missed keepalive ends the session,
/// which unblocks the acceptor's waiter and runs the teardown path.
async fn heartbeat_loop(node: Arc<Node>) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        ticker.tick().await;
        match node.session().request(KEEPALIVE, Vec::new()).await {
            Ok(true) => {
                debug!("keepalive ok for {}", node);
                node.touch();
            }
            Ok(false) | Err(_) => {
                debug!("keepalive failed for {}", node);
                node.session().close();
                return;
            }
        }
    }
}
