//! Connection to one remote host
//!
//! A connection outlives any number of links. The side picked by
//! [`should_connect`](crate::arbitration::should_connect) runs the dial loop
//! and the health checks; the other side only installs links handed to it by
//! the manager's accept path.

use bytes::Bytes;
use grid_proto::HandlerId;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backoff::DialFailures;
use crate::config::GridConfig;
use crate::dialer::Dialer;
use crate::error::{GridError, GridResult};
use crate::handshake::client_handshake;
use crate::link::Link;
use crate::manager::{AddAuthFn, ConnectGate};
use crate::mux::{Session, SessionParams};
use crate::registry::Handlers;
use crate::stream::Stream;

#[cfg(any(test, feature = "fault-injection"))]
use crate::fault::Fault;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    /// Manager shut down; terminal
    Shutdown,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

pub(crate) struct ConnectionParams {
    pub local: String,
    pub remote: String,
    pub initiator: bool,
    pub handlers: Arc<Handlers>,
    pub config: GridConfig,
    pub dialer: Arc<dyn Dialer>,
    pub add_auth: AddAuthFn,
    pub shutdown: CancellationToken,
}

pub struct Connection {
    local: String,
    remote: String,
    initiator: bool,
    label: String,
    state: watch::Sender<ConnState>,
    session: RwLock<Option<Arc<Session>>>,
    /// Survives reconnects so a late frame never hits a reused id
    mux_ids: Arc<AtomicU64>,
    handlers: Arc<Handlers>,
    config: GridConfig,
    dialer: Arc<dyn Dialer>,
    add_auth: AddAuthFn,
    shutdown: CancellationToken,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("initiator", &self.initiator)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(params: ConnectionParams) -> Self {
        let (state, _) = watch::channel(ConnState::Disconnected);
        let first_mux_id = if params.initiator { 1 } else { 2 };

        Self {
            label: format!("[{}->{}]", params.local, params.remote),
            local: params.local,
            remote: params.remote,
            initiator: params.initiator,
            state,
            session: RwLock::new(None),
            mux_ids: Arc::new(AtomicU64::new(first_mux_id)),
            handlers: params.handlers,
            config: params.config,
            dialer: params.dialer,
            add_auth: params.add_auth,
            shutdown: params.shutdown,
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// This side dials the remote
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnState> {
        self.state.subscribe()
    }

    fn set_state(&self, new: ConnState) {
        self.state.send_if_modified(|state| {
            if *state == ConnState::Shutdown || *state == new {
                return false;
            }
            debug!("{} {} -> {}", self.label, state, new);
            *state = new;
            true
        });
    }

    /// Wait until the connection is up
    pub async fn wait_for_connect(&self, cancel: &CancellationToken) -> GridResult<()> {
        let mut state = self.state.subscribe();
        loop {
            match *state.borrow_and_update() {
                ConnState::Connected => return Ok(()),
                ConnState::Shutdown => return Err(GridError::Shutdown),
                _ => {}
            }

            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(GridError::Shutdown);
                    }
                }
                _ = cancel.cancelled() => return Err(GridError::Cancelled),
            }
        }
    }

    async fn current_session(&self) -> GridResult<Arc<Session>> {
        if self.state() == ConnState::Shutdown {
            return Err(GridError::Shutdown);
        }
        match self.session.read().await.as_ref() {
            Some(session) if !session.is_closed() => Ok(session.clone()),
            _ => Err(GridError::Disconnected),
        }
    }

    fn check_handler(handler: HandlerId) -> GridResult<()> {
        if !handler.is_valid() || handler.is_reserved() {
            return Err(GridError::InvalidHandlerId(handler.as_u8()));
        }
        Ok(())
    }

    /// Single request to `handler` on the remote.
    ///
    /// Fails fast with `Disconnected` when no link is up.
    pub async fn request(
        &self,
        cancel: &CancellationToken,
        handler: HandlerId,
        payload: Bytes,
    ) -> GridResult<Bytes> {
        Self::check_handler(handler)?;
        let session = self.current_session().await?;
        session.request(cancel, handler, payload).await
    }

    /// Open a stream to `handler` on the remote
    pub async fn new_stream(
        &self,
        cancel: &CancellationToken,
        handler: HandlerId,
        payload: Bytes,
    ) -> GridResult<Stream> {
        Self::check_handler(handler)?;
        let session = self.current_session().await?;
        session.open_stream(cancel, handler, payload).await
    }

    /// Round trip time to the remote's transport
    pub async fn ping(&self, cancel: &CancellationToken) -> GridResult<Duration> {
        let session = self.current_session().await?;
        session.ping(cancel).await
    }

    #[cfg(any(test, feature = "fault-injection"))]
    pub async fn inject_fault(&self, fault: Fault) -> GridResult<()> {
        let session = self.current_session().await?;
        session.inject_fault(fault);
        Ok(())
    }

    /// Make `link` the live link, replacing any previous one
    pub(crate) async fn install(self: &Arc<Self>, link: Link) -> Arc<Session> {
        let session = Session::start(
            link,
            SessionParams {
                label: self.label.clone(),
                initiator: self.initiator,
                handlers: self.handlers.clone(),
                mux_ids: self.mux_ids.clone(),
                out_queue: self.config.out_queue,
                // The dialing side pings; the accepting side only listens
                read_idle: (!self.initiator)
                    .then(|| self.config.ping_interval + self.config.ping_timeout),
            },
        );

        let previous = self.session.write().await.replace(session.clone());
        if let Some(previous) = previous {
            debug!("{} Replacing previous link", self.label);
            previous.close();
        }

        if self.shutdown.is_cancelled() {
            session.disconnect().await;
            return session;
        }

        self.set_state(ConnState::Connected);

        let conn = self.clone();
        let watched = session.clone();
        tokio::spawn(async move {
            watched.closed().await;
            conn.session_ended(&watched).await;
        });

        if self.initiator {
            tokio::spawn(self.clone().run_pinger(session.clone()));
        }

        session
    }

    async fn session_ended(&self, session: &Arc<Session>) {
        let mut current = self.session.write().await;
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, session)) {
            *current = None;
            drop(current);
            info!("{} Link lost", self.label);
            self.set_state(ConnState::Disconnected);
        }
    }

    async fn connect_once(&self) -> GridResult<Link> {
        let token = (self.add_auth)(&self.remote);
        let mut link = self.dialer.dial(&self.remote, &token).await?;
        client_handshake(&mut link, &self.local).await?;
        Ok(link)
    }

    /// Dial, serve the link until it dies, redial. Runs until shutdown.
    pub(crate) async fn run_dialer(self: Arc<Self>, gate: Option<ConnectGate>) {
        if let Some(gate) = gate {
            debug!("{} Waiting for connect gate", self.label);
            tokio::select! {
                _ = gate.wait() => {}
                _ = self.shutdown.cancelled() => return,
            }
        }

        let mut failures = DialFailures::default();

        while !self.shutdown.is_cancelled() {
            self.set_state(ConnState::Connecting);

            let attempt = tokio::select! {
                result = timeout(self.config.handshake_timeout, self.connect_once()) => {
                    result.unwrap_or(Err(GridError::Timeout))
                }
                _ = self.shutdown.cancelled() => break,
            };

            match attempt {
                Ok(link) => {
                    failures.clear();
                    let session = self.install(link).await;
                    info!("{} Connected", self.label);

                    tokio::select! {
                        _ = session.closed() => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                    info!("{} Link down, redialing", self.label);
                }
                Err(e) => {
                    warn!(
                        "{} Connect attempt {} failed: {}",
                        self.label,
                        failures.next_dial(),
                        e
                    );
                    failures.record();
                    self.set_state(ConnState::Disconnected);
                }
            }

            let delay = failures.delay(&self.config.reconnect);
            debug!("{} Redialing in {:?}", self.label, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        debug!("{} Dial loop stopped", self.label);
    }

    /// Periodic health check of an initiator link
    async fn run_pinger(self: Arc<Self>, session: Arc<Session>) {
        let mut ticker = tokio::time::interval(self.config.ping_interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = session.closed() => return,
            }

            let cancel = session.token().child_token();
            match timeout(self.config.ping_timeout, session.ping(&cancel)).await {
                Ok(Ok(rtt)) => trace!("{} Ping {:?}", self.label, rtt),
                Ok(Err(e)) => {
                    if !session.is_closed() {
                        warn!("{} Ping failed: {}, resetting link", self.label, e);
                        session.close();
                    }
                    return;
                }
                Err(_) => {
                    warn!(
                        "{} No pong within {:?}, resetting link",
                        self.label, self.config.ping_timeout
                    );
                    session.close();
                    return;
                }
            }
        }
    }

    /// Announce the disconnect and stop for good
    pub(crate) async fn shutdown(&self) {
        self.state.send_replace(ConnState::Shutdown);
        let session = self.session.write().await.take();
        if let Some(session) = session {
            session.disconnect().await;
        }
        debug!("{} Shut down", self.label);
    }
}
