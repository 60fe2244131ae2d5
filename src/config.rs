//! Node configuration file
//!
//! A `grid.yml` names this node, its peers and the shared secret. Command line
//! flags override what the file says.

use anyhow::{Context, Result};
use grid_auth::PeerAuthenticator;
use grid_transport::{GridConfig, ReconnectConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the grid endpoint listens on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// This node, as it appears in `hosts`
    #[serde(default)]
    pub local: String,

    /// Every node of the cluster, this one included
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub auth: AuthSection,

    #[serde(default)]
    pub grid: GridSection,

    /// How often peer health is logged
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,

    /// Period of the events sent on the trace stream
    #[serde(default = "default_trace_interval")]
    pub trace_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    /// Shared cluster secret; links are unauthenticated without one.
    /// `${VAR}` is read from the environment.
    pub secret: Option<String>,

    #[serde(default = "default_token_validity")]
    pub token_validity_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSection {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    #[serde(default = "default_out_queue")]
    pub out_queue: usize,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_status_interval() -> u64 {
    30
}

fn default_trace_interval() -> u64 {
    1000
}

fn default_token_validity() -> u64 {
    900
}

fn default_handshake_timeout() -> u64 {
    5000
}

fn default_ping_interval() -> u64 {
    10
}

fn default_ping_timeout() -> u64 {
    5
}

fn default_out_queue() -> usize {
    10_000
}

fn default_initial_backoff() -> u64 {
    250
}

fn default_max_backoff() -> u64 {
    10_000
}

impl Default for GridSection {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout(),
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
            out_queue: default_out_queue(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            local: String::new(),
            hosts: Vec::new(),
            auth: AuthSection {
                secret: None,
                token_validity_secs: default_token_validity(),
            },
            grid: GridSection::default(),
            status_interval_secs: default_status_interval(),
            trace_interval_ms: default_trace_interval(),
        }
    }
}

/// Values given on the command line
#[derive(Debug, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub local: Option<String>,
    pub hosts: Option<Vec<String>>,
    pub secret: Option<String>,
}

impl NodeConfig {
    /// Read `path`; no path means defaults, to be filled by flags
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {:?}", path))?;
                Self::parse(&content)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse YAML config")
    }

    pub fn apply(mut self, overrides: Overrides) -> Self {
        if let Some(listen) = overrides.listen {
            self.listen = listen;
        }
        if let Some(local) = overrides.local {
            self.local = local;
        }
        if let Some(hosts) = overrides.hosts {
            self.hosts = hosts;
        }
        if let Some(secret) = overrides.secret {
            self.auth.secret = Some(secret);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if self.local.is_empty() {
            anyhow::bail!("No local host configured");
        }
        if self.hosts.is_empty() {
            anyhow::bail!("No hosts configured");
        }

        let mut seen = HashSet::new();
        for host in &self.hosts {
            if !seen.insert(host) {
                anyhow::bail!("Duplicate host: {}", host);
            }
        }
        if !seen.contains(&self.local) {
            anyhow::bail!("Local host '{}' is not in hosts", self.local);
        }

        if self.grid.ping_interval_secs == 0 || self.grid.ping_timeout_secs == 0 {
            anyhow::bail!("Ping interval and timeout must be positive");
        }
        if self.grid.initial_backoff_ms == 0
            || self.grid.initial_backoff_ms > self.grid.max_backoff_ms
        {
            anyhow::bail!(
                "Invalid backoff: initial {}ms, max {}ms",
                self.grid.initial_backoff_ms,
                self.grid.max_backoff_ms
            );
        }
        if self.grid.out_queue == 0 {
            anyhow::bail!("out_queue must be positive");
        }
        if self.status_interval_secs == 0 || self.trace_interval_ms == 0 {
            anyhow::bail!("Status and trace intervals must be positive");
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.listen))
    }

    /// Secret with `${VAR}` references resolved
    pub fn secret(&self) -> Option<String> {
        self.auth
            .secret
            .as_deref()
            .map(expand_env_vars)
            .filter(|s| !s.is_empty())
    }

    pub fn authenticator(&self) -> Option<PeerAuthenticator> {
        self.secret().map(|secret| {
            PeerAuthenticator::new(secret).with_validity(chrono::Duration::seconds(
                self.auth.token_validity_secs as i64,
            ))
        })
    }

    pub fn grid_config(&self) -> GridConfig {
        GridConfig::default()
            .with_handshake_timeout(Duration::from_millis(self.grid.handshake_timeout_ms))
            .with_ping(
                Duration::from_secs(self.grid.ping_interval_secs),
                Duration::from_secs(self.grid.ping_timeout_secs),
            )
            .with_out_queue(self.grid.out_queue)
            .with_reconnect(ReconnectConfig {
                initial_backoff: Duration::from_millis(self.grid.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.grid.max_backoff_ms),
                ..ReconnectConfig::default()
            })
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn trace_interval(&self) -> Duration {
        Duration::from_millis(self.trace_interval_ms)
    }
}

/// Replace `${VAR}` with the value of `VAR`, empty when unset
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&std::env::var(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
