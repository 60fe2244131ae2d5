//! grid-node - one member of a grid cluster
//!
//! Serves the grid endpoint, keeps a link to every other node and answers the
//! node services over it.

mod config;
mod services;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use clap::{Parser, Subcommand};
use grid_auth::PeerAuthenticator;
use grid_transport::{CancellationToken, ConnState, Manager, ManagerOptions};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use crate::config::{NodeConfig, Overrides};
use crate::services::{fetch_server_info, NodeServices, ServerInfo};

/// Grid node - persistent links between cluster members
#[derive(Parser, Debug)]
#[command(name = "grid-node")]
#[command(about = "Grid node - persistent links between cluster members")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the grid endpoint and connect to every peer
    #[command(long_about = r#"
Serve the grid endpoint and keep a link to every other node of the cluster.
Flags override the values of the configuration file.

EXAMPLES:
  # Three node cluster, run once per node with its own --local
  grid-node serve --listen 0.0.0.0:9000 \
    --local http://node1:9000 \
    --hosts http://node1:9000,http://node2:9000,http://node3:9000 \
    --secret $GRID_SECRET

  # Everything from a file
  grid-node serve --config grid.yml

ENVIRONMENT VARIABLES:
  GRID_CONFIG   Configuration file
  GRID_LISTEN   Listen address
  GRID_LOCAL    This node's host
  GRID_HOSTS    Comma separated list of all hosts
  GRID_SECRET   Shared cluster secret
    "#)]
    Serve {
        /// YAML configuration file
        #[arg(short, long, env = "GRID_CONFIG")]
        config: Option<PathBuf>,

        /// Listen address (e.g., 0.0.0.0:9000)
        #[arg(long, env = "GRID_LISTEN")]
        listen: Option<String>,

        /// This node, as listed in --hosts
        #[arg(long, env = "GRID_LOCAL")]
        local: Option<String>,

        /// All nodes of the cluster, this one included
        #[arg(long, env = "GRID_HOSTS", value_delimiter = ',')]
        hosts: Option<Vec<String>>,

        /// Shared cluster secret
        #[arg(long, env = "GRID_SECRET", hide_env_values = true)]
        secret: Option<String>,
    },

    /// Print a token for dialing a node
    Token {
        /// Shared cluster secret
        #[arg(long, env = "GRID_SECRET", hide_env_values = true)]
        secret: String,

        /// Host the token is for
        #[arg(long)]
        audience: String,

        /// Host presenting the token
        #[arg(long, default_value = "grid-node")]
        subject: String,

        /// Validity in seconds
        #[arg(long, default_value = "900")]
        validity: i64,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Build the manager with the node services registered
fn start_node(config: &NodeConfig) -> Result<(Arc<Manager>, Arc<NodeServices>)> {
    let mut options = ManagerOptions::new(config.local.clone(), config.hosts.clone())
        .with_config(config.grid_config());
    match config.authenticator() {
        Some(auth) => options = options.with_peer_authenticator(auth),
        None => warn!("No cluster secret configured, peer links are unauthenticated"),
    }

    let services = NodeServices::new(config.local.clone(), config.trace_interval());
    let mut builder = Manager::builder(options);
    services
        .register(&mut builder)
        .context("Failed to register node services")?;
    let manager = builder.start().context("Failed to start grid manager")?;
    services.attach(&manager);

    Ok((manager, services))
}

/// Grid endpoint plus a local status page
fn node_router(manager: &Arc<Manager>, services: Arc<NodeServices>) -> Router {
    manager.handler().merge(
        Router::new()
            .route("/status", get(status))
            .with_state(services),
    )
}

async fn status(State(services): State<Arc<NodeServices>>) -> Json<ServerInfo> {
    Json(services.server_info())
}

/// Log the state of every peer, pinging the connected ones
async fn log_peer_status(manager: Arc<Manager>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    let mut instances: HashMap<String, Uuid> = HashMap::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => return,
        }

        let mut connected = 0;
        for conn in manager.connections() {
            let state = conn.state();
            if state != ConnState::Connected {
                info!("Peer {}: {}", conn.remote(), state);
                continue;
            }
            connected += 1;

            let cancel = shutdown.child_token();
            match conn.ping(&cancel).await {
                Ok(rtt) => debug!("Peer {}: connected, rtt {:?}", conn.remote(), rtt),
                Err(e) => warn!("Peer {}: ping failed: {}", conn.remote(), e),
            }

            match fetch_server_info(conn, &cancel).await {
                Ok(info) => {
                    if instances.insert(info.host.clone(), info.instance) != Some(info.instance) {
                        info!(
                            "Peer {} runs grid-node {} ({}), up {}s",
                            info.host, info.version, info.commit, info.uptime_secs
                        );
                    }
                }
                Err(e) => debug!("Peer {}: {:#}", conn.remote(), e),
            }
        }
        info!(
            "{}/{} peers connected",
            connected,
            manager.hosts().len().saturating_sub(1)
        );
    }
}

async fn serve(config: NodeConfig) -> Result<()> {
    let addr = config.listen_addr()?;
    let (manager, services) = start_node(&config)?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Grid node {} listening on {}", config.local, addr);
    info!("Cluster: {}", config.hosts.join(", "));

    let shutdown = CancellationToken::new();
    let router = node_router(&manager, services);
    let server = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        })
    };
    let status = tokio::spawn(log_peer_status(
        manager.clone(),
        config.status_interval(),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    manager.shutdown().await;
    manager.wait_for_exit().await;
    shutdown.cancel();

    let _ = status.await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Server error: {}", e),
        Err(e) => error!("Server task panicked: {}", e),
    }

    info!("Grid node stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Serve {
            config,
            listen,
            local,
            hosts,
            secret,
        } => {
            let config = NodeConfig::load(config.as_deref())?.apply(Overrides {
                listen,
                local,
                hosts,
                secret,
            });
            config.validate().context("Invalid configuration")?;
            serve(config).await
        }
        Commands::Token {
            secret,
            audience,
            subject,
            validity,
        } => {
            let token = PeerAuthenticator::new(secret)
                .with_validity(chrono::Duration::seconds(validity))
                .token_for(&subject, &audience)
                .context("Failed to issue token")?;
            println!("{}", token);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_config() -> NodeConfig {
        NodeConfig::parse(
            r#"
listen: "127.0.0.1:0"
local: "http://127.0.0.1:1"
hosts: ["http://127.0.0.1:1", "http://127.0.0.1:2"]
auth:
  secret: "node-test"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_cli_parses_serve_flags() {
        let cli = Cli::try_parse_from([
            "grid-node",
            "serve",
            "--local",
            "http://a:1",
            "--hosts",
            "http://a:1,http://b:1",
        ])
        .unwrap();

        match cli.command {
            Commands::Serve { local, hosts, .. } => {
                assert_eq!(local.as_deref(), Some("http://a:1"));
                assert_eq!(hosts.unwrap().len(), 2);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_route() {
        let config = test_config();
        let (manager, services) = start_node(&config).unwrap();

        let response = node_router(&manager, services)
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let info: ServerInfo = serde_json::from_slice(&body).unwrap();
        assert_eq!(info.host, "http://127.0.0.1:1");
        assert_eq!(info.peers.len(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_grid_route_requires_upgrade() {
        let config = test_config();
        let (manager, services) = start_node(&config).unwrap();

        let response = node_router(&manager, services)
            .oneshot(
                Request::get(grid_proto::GRID_ROUTE_PATH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());

        manager.shutdown().await;
    }
}
