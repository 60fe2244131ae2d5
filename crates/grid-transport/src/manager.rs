//! Grid manager
//!
//! Owns one [`Connection`] per peer, the frozen handler registry and the HTTP
//! endpoint peers upgrade on.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use grid_auth::PeerAuthenticator;
use grid_proto::{HandlerId, GRID_ROUTE_PATH};
use http::HeaderMap;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::arbitration::should_connect;
use crate::config::GridConfig;
use crate::connection::{Connection, ConnectionParams};
use crate::dialer::{Dialer, WebSocketDialer};
use crate::error::{GridError, GridResult, RemoteErr};
use crate::handshake::{evaluate_connect, read_connect, send_connect_response};
use crate::link::Link;
use crate::registry::{Handlers, StreamingHandler};

/// Produces the token presented when dialing the given host
pub type AddAuthFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Checks the headers of an inbound upgrade request
pub type AuthRequestFn = Arc<dyn Fn(&HeaderMap) -> Result<(), String> + Send + Sync>;

/// Holds dial loops back until opened
#[derive(Clone)]
pub struct ConnectGate {
    open: watch::Receiver<bool>,
}

/// Opens a [`ConnectGate`]
pub struct GateOpener {
    open: watch::Sender<bool>,
}

impl ConnectGate {
    pub fn new() -> (ConnectGate, GateOpener) {
        let (tx, rx) = watch::channel(false);
        (ConnectGate { open: rx }, GateOpener { open: tx })
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Resolves once the gate is open, or its opener is gone
    pub async fn wait(&self) {
        let mut open = self.open.clone();
        if open.wait_for(|open| *open).await.is_err() {
            debug!("Connect gate dropped without opening, proceeding");
        }
    }
}

impl GateOpener {
    pub fn open(&self) {
        self.open.send_replace(true);
    }
}

/// Construction options of a [`Manager`]
pub struct ManagerOptions {
    pub dialer: Arc<dyn Dialer>,
    /// This node, as it appears in `hosts`
    pub local: String,
    /// Every node of the cluster, including `local`
    pub hosts: Vec<String>,
    pub add_auth: AddAuthFn,
    pub auth_request: AuthRequestFn,
    pub block_connect: Option<ConnectGate>,
    pub config: GridConfig,
}

impl ManagerOptions {
    /// Options with the WebSocket dialer and no authentication
    pub fn new(local: impl Into<String>, hosts: Vec<String>) -> Self {
        Self {
            dialer: Arc::new(WebSocketDialer::new()),
            local: local.into(),
            hosts,
            add_auth: Arc::new(|_| String::new()),
            auth_request: Arc::new(|_| Ok(())),
            block_connect: None,
            config: GridConfig::default(),
        }
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn with_auth(mut self, add_auth: AddAuthFn, auth_request: AuthRequestFn) -> Self {
        self.add_auth = add_auth;
        self.auth_request = auth_request;
        self
    }

    /// Authenticate both directions with audience-scoped tokens
    pub fn with_peer_authenticator(self, auth: PeerAuthenticator) -> Self {
        let local = self.local.clone();
        let issuer = auth.clone();
        let issuing_host = local.clone();

        self.with_auth(
            Arc::new(move |remote| {
                issuer.token_for(&issuing_host, remote).unwrap_or_else(|e| {
                    warn!("Unable to issue token for {}: {}", remote, e);
                    String::new()
                })
            }),
            Arc::new(move |headers| {
                auth.validate_request(headers, &local)
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }),
        )
    }

    pub fn with_connect_gate(mut self, gate: ConnectGate) -> Self {
        self.block_connect = Some(gate);
        self
    }

    pub fn with_config(mut self, config: GridConfig) -> Self {
        self.config = config;
        self
    }

    fn validate(&self) -> GridResult<()> {
        if self.hosts.is_empty() {
            return Err(GridError::InvalidOptions("host list is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for host in &self.hosts {
            if !seen.insert(host.as_str()) {
                return Err(GridError::InvalidOptions(format!(
                    "host {} listed twice",
                    host
                )));
            }
        }
        if !seen.contains(self.local.as_str()) {
            return Err(GridError::InvalidOptions(format!(
                "local host {} is not in the host list",
                self.local
            )));
        }
        Ok(())
    }
}

/// Collects handlers before the manager starts
pub struct ManagerBuilder {
    options: ManagerOptions,
    handlers: Handlers,
}

impl ManagerBuilder {
    pub fn register_single_handler<F, Fut>(&mut self, id: HandlerId, handle: F) -> GridResult<()>
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, RemoteErr>> + Send + 'static,
    {
        self.handlers.register_single(id, handle)
    }

    pub fn register_streaming_handler(
        &mut self,
        id: HandlerId,
        handler: impl Into<StreamingHandler>,
    ) -> GridResult<()> {
        self.handlers.register_streaming(id, handler)
    }

    /// Freeze the handlers, create the connections and start dialing
    pub fn start(self) -> GridResult<Arc<Manager>> {
        let options = self.options;
        options.validate()?;

        let handlers = Arc::new(self.handlers);
        let shutdown = CancellationToken::new();

        let connections: HashMap<String, Arc<Connection>> = options
            .hosts
            .iter()
            .filter(|host| **host != options.local)
            .map(|remote| {
                let conn = Connection::new(ConnectionParams {
                    local: options.local.clone(),
                    remote: remote.clone(),
                    initiator: should_connect(&options.local, remote),
                    handlers: handlers.clone(),
                    config: options.config.clone(),
                    dialer: options.dialer.clone(),
                    add_auth: options.add_auth.clone(),
                    shutdown: shutdown.clone(),
                });
                (remote.clone(), Arc::new(conn))
            })
            .collect();

        let mut tasks = Vec::new();
        for conn in connections.values().filter(|c| c.is_initiator()) {
            tasks.push(tokio::spawn(
                conn.clone().run_dialer(options.block_connect.clone()),
            ));
        }

        info!(
            "Grid manager for {} started: {} peers, {} dialed from here, {} handlers",
            options.local,
            connections.len(),
            tasks.len(),
            handlers.registered().len()
        );

        Ok(Arc::new(Manager {
            local: options.local,
            hosts: options.hosts,
            handlers,
            connections,
            auth_request: options.auth_request,
            config: options.config,
            shutdown,
            tasks: Mutex::new(tasks),
        }))
    }
}

pub struct Manager {
    local: String,
    hosts: Vec<String>,
    handlers: Arc<Handlers>,
    connections: HashMap<String, Arc<Connection>>,
    auth_request: AuthRequestFn,
    config: GridConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("local", &self.local)
            .field("hosts", &self.hosts)
            .finish()
    }
}

impl Manager {
    pub fn builder(options: ManagerOptions) -> ManagerBuilder {
        ManagerBuilder {
            options,
            handlers: Handlers::new(),
        }
    }

    pub fn local_host(&self) -> &str {
        &self.local
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    /// Connection to `host`; `None` for the local host and unknown hosts
    pub fn connection(&self, host: &str) -> Option<Arc<Connection>> {
        self.connections.get(host).cloned()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.connections.values()
    }

    /// Router serving the grid endpoint
    pub fn handler(self: &Arc<Self>) -> Router {
        Router::new()
            .route(GRID_ROUTE_PATH, get(grid_upgrade))
            .with_state(self.clone())
    }

    /// Handshake an inbound link and hand it to its connection
    pub(crate) async fn accept(self: Arc<Self>, mut link: Link, auth: Result<(), String>) {
        let req = match timeout(self.config.handshake_timeout, read_connect(&mut link)).await {
            Ok(Ok(req)) => req,
            Ok(Err(e)) => {
                warn!("Inbound handshake to {} failed: {}", self.local, e);
                return;
            }
            Err(_) => {
                warn!("Inbound handshake to {} timed out", self.local);
                return;
            }
        };

        let resp = if self.shutdown.is_cancelled() {
            grid_proto::ConnectResp::reject(req.id, "shutting down")
        } else {
            evaluate_connect(&self.local, &self.hosts, auth, &req)
        };

        if let Err(e) = send_connect_response(&mut link, &resp).await {
            warn!("Unable to answer handshake from {}: {}", req.host, e);
            return;
        }

        if !resp.accepted {
            warn!(
                "Rejected handshake from {}: {}",
                req.host, resp.rejected_reason
            );
            link.close().await;
            return;
        }

        match self.connections.get(&req.host) {
            Some(conn) => {
                conn.install(link).await;
                info!("[{}->{}] Accepted link", self.local, req.host);
            }
            None => link.close().await,
        }
    }

    /// Disconnect every peer and stop dialing
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Grid manager for {} shutting down", self.local);
        self.shutdown.cancel();
        for conn in self.connections.values() {
            conn.shutdown().await;
        }
    }

    /// Resolves once every dial loop has stopped
    pub async fn wait_for_exit(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }
        self.shutdown.cancelled().await;
    }
}

async fn grid_upgrade(
    State(manager): State<Arc<Manager>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let auth = (manager.auth_request)(&headers);
    ws.on_upgrade(move |socket| manager.accept(Link::from_axum(socket), auth))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> Vec<String> {
        vec!["http://a:1".to_string(), "http://b:1".to_string()]
    }

    #[test]
    fn test_options_validation() {
        assert!(ManagerOptions::new("http://a:1", hosts()).validate().is_ok());

        assert!(matches!(
            ManagerOptions::new("http://c:1", hosts()).validate(),
            Err(GridError::InvalidOptions(_))
        ));
        assert!(matches!(
            ManagerOptions::new("http://a:1", Vec::new()).validate(),
            Err(GridError::InvalidOptions(_))
        ));

        let mut dup = hosts();
        dup.push("http://b:1".to_string());
        assert!(matches!(
            ManagerOptions::new("http://a:1", dup).validate(),
            Err(GridError::InvalidOptions(msg)) if msg.contains("twice")
        ));
    }

    #[tokio::test]
    async fn test_start_creates_peer_connections() {
        let (gate, _opener) = ConnectGate::new();
        let manager = Manager::builder(
            ManagerOptions::new("http://a:1", hosts()).with_connect_gate(gate),
        )
        .start()
        .unwrap();

        assert_eq!(manager.local_host(), "http://a:1");
        assert!(manager.connection("http://a:1").is_none());
        assert!(manager.connection("http://zz:1").is_none());

        let peer = manager.connection("http://b:1").unwrap();
        assert_eq!(peer.remote(), "http://b:1");
        assert_eq!(peer.is_initiator(), should_connect("http://a:1", "http://b:1"));

        manager.shutdown().await;
        manager.wait_for_exit().await;
        assert_eq!(peer.state(), crate::ConnState::Shutdown);
    }

    #[tokio::test]
    async fn test_gate_opens() {
        let (gate, opener) = ConnectGate::new();
        assert!(!gate.is_open());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        opener.open();
        waiter.await.unwrap();
        assert!(gate.is_open());
    }
}
