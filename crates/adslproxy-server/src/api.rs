//! Read-mostly JSON admin API.
//!
//! `GET /api/nodes/` lists live nodes with their forwards. `POST
//! /api/nodes/{id}/redial` asks one agent to re-dial its WAN link. The
//! original service triggered redial with a non-standard `UPDATE` verb on
//! the node resource; this implementation uses a POST sub-resource instead.

use crate::registry::Registry;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
struct ApiState {
    registry: Arc<Registry>,
}

#[derive(Debug, Serialize)]
pub struct ForwardEntry {
    pub name: String,
    pub left: String,
    pub right: String,
    pub options: String,
}

#[derive(Debug, Serialize)]
pub struct NodeEntry {
    pub id: String,
    pub name: String,
    pub remote_ip: String,
    /// Milliseconds since the Unix epoch of the last successful keepalive.
    pub heartbeat: u64,
    pub forward_list: Vec<ForwardEntry>,
}

pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/api/nodes/", get(list_nodes))
        .route("/api/nodes/{id}/redial", post(redial_node))
        .with_state(ApiState { registry })
}

/// Serve the admin API on an already bound listener.
pub async fn serve(listener: TcpListener, registry: Arc<Registry>) -> std::io::Result<()> {
    axum::serve(listener, router(registry)).await
}

async fn list_nodes(State(state): State<ApiState>) -> Json<Vec<NodeEntry>> {
    let nodes = state
        .registry
        .list()
        .iter()
        .map(|node| NodeEntry {
            id: node.id.to_string(),
            name: node.name.clone(),
            remote_ip: node.remote_ip.to_string(),
            heartbeat: node
                .last_heartbeat()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            forward_list: node.with_forwards(|forwards| {
                forwards
                    .iter()
                    .map(|f| ForwardEntry {
                        name: f.name.clone(),
                        left: f.left.to_string(),
                        right: f.right.clone(),
                        options: f.options.clone(),
                    })
                    .collect()
            }),
        })
        .collect();

    Json(nodes)
}

async fn redial_node(State(state): State<ApiState>, Path(id): Path<String>) -> StatusCode {
    let Ok(id) = Uuid::parse_str(&id) else {
        return StatusCode::NOT_FOUND;
    };

    match state.registry.find_by_id(&id) {
        Some(node) => {
            info!("redial via api for {}", node);
            node.redial();
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}
