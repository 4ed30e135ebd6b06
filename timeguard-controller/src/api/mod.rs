//! JSON API for a dashboard
//!
//! ## Endpoints
//!
//! - `GET /api/agents` - refresh lock status and list the directory
//! - `POST /api/scan` - rescan the subnet and list the new directory
//! - `GET /api/agents/{ip}/status` - query one agent
//! - `POST /api/action` - send an operator action to one agent

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::actions::Action;
use crate::controller::Controller;
use crate::directory::{DirectorySnapshot, DiscoveredAgent};
use crate::dispatch::CommandOutcome;

type SharedController = Arc<Controller>;

/// Body of `POST /api/action`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub ip: IpAddr,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentsResponse {
    pub agents: Vec<DiscoveredAgent>,
    pub last_scan: Option<DateTime<Local>>,
}

impl From<&DirectorySnapshot> for AgentsResponse {
    fn from(snapshot: &DirectorySnapshot) -> Self {
        Self {
            agents: snapshot.agents.values().cloned().collect(),
            last_scan: snapshot.scanned_at,
        }
    }
}

pub fn router(controller: SharedController) -> Router {
    Router::new()
        .route("/api/agents", get(list_agents))
        .route("/api/scan", post(scan))
        .route("/api/agents/{ip}/status", get(agent_status))
        .route("/api/action", post(perform_action))
        .with_state(controller)
}

pub async fn serve(listener: TcpListener, controller: SharedController) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "Dashboard API listening");
    axum::serve(listener, router(controller)).await
}

async fn list_agents(State(controller): State<SharedController>) -> Json<AgentsResponse> {
    let snapshot = controller.refresh_status().await;
    Json(AgentsResponse::from(snapshot.as_ref()))
}

async fn scan(State(controller): State<SharedController>) -> Json<AgentsResponse> {
    let snapshot = controller.scan().await;
    Json(AgentsResponse::from(snapshot.as_ref()))
}

async fn agent_status(
    State(controller): State<SharedController>,
    Path(ip): Path<IpAddr>,
) -> Json<CommandOutcome> {
    Json(controller.query_status(ip).await)
}

async fn perform_action(
    State(controller): State<SharedController>,
    Json(request): Json<ActionRequest>,
) -> Json<CommandOutcome> {
    info!(ip = %request.ip, action = ?request.action, "Action requested");
    Json(controller.perform(request.ip, &request.action).await)
}
