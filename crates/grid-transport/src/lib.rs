//! Grid transport
//!
//! Persistent, multiplexed links between the nodes of a cluster. Every pair of
//! nodes shares exactly one link, dialed by the side chosen by
//! [`should_connect`]. Over a link, callers issue single requests and open
//! streams to handlers registered on the remote node.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use grid_proto::HandlerId;
//! use grid_transport::{Manager, ManagerOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let hosts = vec!["http://10.0.0.1:9000".to_string(), "http://10.0.0.2:9000".to_string()];
//! let mut builder = Manager::builder(ManagerOptions::new("http://10.0.0.1:9000", hosts));
//! builder.register_single_handler(HandlerId::SERVER_INFO, |payload| async move { Ok(payload) })?;
//! let manager = builder.start()?;
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:9000").await?;
//! let router = manager.handler();
//! tokio::spawn(async move { axum::serve(listener, router).await });
//!
//! let cancel = CancellationToken::new();
//! let peer = manager.connection("http://10.0.0.2:9000").unwrap();
//! peer.wait_for_connect(&cancel).await?;
//! let reply = peer.request(&cancel, HandlerId::SERVER_INFO, Bytes::from("hi")).await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod arbitration;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod dialer;
pub mod error;
#[cfg(any(test, feature = "fault-injection"))]
pub mod fault;
pub mod handshake;
pub mod link;
pub mod manager;
pub(crate) mod mux;
pub mod registry;
pub mod stream;

#[cfg(test)]
mod tests;

pub use arbitration::should_connect;
pub use config::{GridConfig, ReconnectConfig};
pub use connection::{ConnState, Connection};
pub use dialer::{Dialer, WebSocketDialer};
pub use error::{GridError, GridResult, RemoteErr, TransportError};
#[cfg(any(test, feature = "fault-injection"))]
pub use fault::Fault;
pub use link::Link;
pub use manager::{
    AddAuthFn, AuthRequestFn, ConnectGate, GateOpener, Manager, ManagerBuilder, ManagerOptions,
};
pub use registry::{
    Handlers, MuxReceiver, Response, StatefulHandler, StatelessHandler, StreamingHandler,
};
pub use stream::Stream;

// Re-export so callers can take cancellation tokens without a direct dependency
pub use tokio_util::sync::CancellationToken;
