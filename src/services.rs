//! Services every node serves over the grid

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use grid_proto::HandlerId;
use grid_transport::{
    CancellationToken, Connection, GridResult, Manager, ManagerBuilder, RemoteErr, Response,
    StatelessHandler,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("GRID_COMMIT");
pub const BUILD_TIME: &str = env!("GRID_BUILD_TIME");

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerStatus {
    pub host: String,
    pub state: String,
}

/// Answer to `SERVER_INFO`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    pub host: String,
    pub version: String,
    pub commit: String,
    pub build_time: String,
    /// Changes on every restart
    pub instance: Uuid,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub peers: Vec<PeerStatus>,
}

/// One event on the `TRACE` stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    pub host: String,
    pub instance: Uuid,
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub connected_peers: usize,
}

pub struct NodeServices {
    host: String,
    instance: Uuid,
    started_at: DateTime<Utc>,
    trace_interval: Duration,
    manager: OnceLock<Weak<Manager>>,
}

impl NodeServices {
    pub fn new(host: impl Into<String>, trace_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            host: host.into(),
            instance: Uuid::new_v4(),
            started_at: Utc::now(),
            trace_interval,
            manager: OnceLock::new(),
        })
    }

    pub fn register(self: &Arc<Self>, builder: &mut ManagerBuilder) -> GridResult<()> {
        let services = self.clone();
        builder.register_single_handler(HandlerId::SERVER_INFO, move |_| {
            let info = services.server_info();
            async move {
                serde_json::to_vec(&info)
                    .map(Bytes::from)
                    .map_err(|e| RemoteErr::new(format!("encoding server info: {}", e)))
            }
        })?;

        let services = self.clone();
        builder.register_streaming_handler(
            HandlerId::TRACE,
            StatelessHandler::new(move |cancel, _, out| services.clone().trace(cancel, out))
                .with_out_capacity(16),
        )
    }

    /// Peer states become visible once the manager runs
    pub fn attach(&self, manager: &Arc<Manager>) {
        let _ = self.manager.set(Arc::downgrade(manager));
    }

    pub fn peers(&self) -> Vec<PeerStatus> {
        let Some(manager) = self.manager.get().and_then(Weak::upgrade) else {
            return Vec::new();
        };
        let mut peers: Vec<PeerStatus> = manager
            .connections()
            .map(|conn| PeerStatus {
                host: conn.remote().to_string(),
                state: conn.state().to_string(),
            })
            .collect();
        peers.sort_by(|a, b| a.host.cmp(&b.host));
        peers
    }

    pub fn server_info(&self) -> ServerInfo {
        let uptime = Utc::now() - self.started_at;
        ServerInfo {
            host: self.host.clone(),
            version: VERSION.to_string(),
            commit: COMMIT.to_string(),
            build_time: BUILD_TIME.to_string(),
            instance: self.instance,
            started_at: self.started_at,
            uptime_secs: uptime.num_seconds().max(0) as u64,
            peers: self.peers(),
        }
    }

    /// Emit a [`TraceEvent`] every interval until the caller goes away
    pub(crate) async fn trace(
        self: Arc<Self>,
        cancel: CancellationToken,
        out: mpsc::Sender<Response>,
    ) -> Result<(), RemoteErr> {
        let mut ticker = tokio::time::interval(self.trace_interval);
        let mut seq = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let event = TraceEvent {
                host: self.host.clone(),
                instance: self.instance,
                seq,
                at: Utc::now(),
                connected_peers: self
                    .peers()
                    .iter()
                    .filter(|p| p.state == "connected")
                    .count(),
            };
            let data = serde_json::to_vec(&event)
                .map_err(|e| RemoteErr::new(format!("encoding trace event: {}", e)))?;
            if out.send(Ok(Bytes::from(data))).await.is_err() {
                break;
            }
            seq += 1;
        }
        debug!("Trace stream on {} ended after {} events", self.host, seq);
        Ok(())
    }
}

/// Ask a peer for its [`ServerInfo`]
pub async fn fetch_server_info(conn: &Connection, cancel: &CancellationToken) -> Result<ServerInfo> {
    let data = conn
        .request(cancel, HandlerId::SERVER_INFO, Bytes::new())
        .await
        .with_context(|| format!("SERVER_INFO request to {} failed", conn.remote()))?;
    serde_json::from_slice(&data).context("Invalid server info")
}
