//! Outbound link establishment

use async_trait::async_trait;
use grid_auth::AUTHORIZATION_SCHEME;
use grid_proto::GRID_ROUTE_PATH;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tracing::debug;
use url::Url;

use crate::error::TransportError;
use crate::link::Link;

/// Opens a link to a peer, presenting `token` for authentication
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, token: &str) -> Result<Link, TransportError>;
}

/// WebSocket dialer used between real nodes
#[derive(Debug, Clone, Default)]
pub struct WebSocketDialer;

impl WebSocketDialer {
    pub fn new() -> Self {
        Self
    }
}

/// Grid endpoint of a host given as `http(s)://addr[:port]`
pub fn grid_url(host: &str) -> Result<Url, TransportError> {
    let mut url =
        Url::parse(host).map_err(|e| TransportError::InvalidAddress(format!("{}: {}", host, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidAddress(format!(
                "{}: unsupported scheme {}",
                host, other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::InvalidAddress(host.to_string()))?;
    url.set_path(GRID_ROUTE_PATH);

    Ok(url)
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, host: &str, token: &str) -> Result<Link, TransportError> {
        let url = grid_url(host)?;
        debug!("Dialing grid endpoint {}", url);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidAddress(e.to_string()))?;

        if !token.is_empty() {
            let value = HeaderValue::from_str(&format!("{} {}", AUTHORIZATION_SCHEME, token))
                .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))?;

        Ok(Link::from_tungstenite(ws))
    }
}
