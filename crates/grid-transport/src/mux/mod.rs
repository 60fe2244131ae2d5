//! Mux layer
//!
//! A [`Session`] owns one established link: a writer task draining the
//! outbound frame queue and a reader task demultiplexing inbound frames by mux
//! id. Muxes opened locally live in `outgoing`, muxes opened by the peer in
//! `incoming`. The initiator allocates odd mux ids and the acceptor even ones,
//! so the id alone tells which table a frame belongs to.

mod client;
mod server;

pub(crate) use client::{StreamAccept, StreamShared};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use grid_proto::{Frame, HandlerId, MuxId, Op, MAX_FRAME_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{GridError, GridResult};
use crate::link::{FrameSink, FrameSource, Link};
use crate::registry::Handlers;

#[cfg(any(test, feature = "fault-injection"))]
use crate::fault::{Fault, FaultSwitches};

pub(crate) struct SessionParams {
    pub label: String,
    pub initiator: bool,
    pub handlers: Arc<Handlers>,
    pub mux_ids: Arc<AtomicU64>,
    pub out_queue: usize,
    /// Close the link after this long without an inbound frame
    pub read_idle: Option<Duration>,
}

/// Cancels the link token when a link task ends, unwinding included
struct CancelOnExit<'a>(&'a CancellationToken);

impl Drop for CancelOnExit<'_> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

async fn read_idle_expired(idle: Option<Duration>) {
    match idle {
        Some(idle) => tokio::time::sleep(idle).await,
        None => std::future::pending().await,
    }
}

/// One live link and every mux running over it
pub(crate) struct Session {
    label: String,
    initiator: bool,
    out: mpsc::Sender<Frame>,
    token: CancellationToken,
    mux_ids: Arc<AtomicU64>,
    handlers: Arc<Handlers>,
    read_idle: Option<Duration>,
    outgoing: DashMap<MuxId, client::Outgoing>,
    incoming: DashMap<MuxId, server::Incoming>,
    #[cfg(any(test, feature = "fault-injection"))]
    faults: FaultSwitches,
}

impl Session {
    /// Take over an established link and spawn its reader and writer
    pub(crate) fn start(link: Link, params: SessionParams) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(params.out_queue.max(1));
        let (sink, source) = link.split();

        let session = Arc::new(Self {
            label: params.label,
            initiator: params.initiator,
            out: out_tx,
            token: CancellationToken::new(),
            mux_ids: params.mux_ids,
            handlers: params.handlers,
            read_idle: params.read_idle,
            outgoing: DashMap::new(),
            incoming: DashMap::new(),
            #[cfg(any(test, feature = "fault-injection"))]
            faults: FaultSwitches::default(),
        });

        tokio::spawn(session.clone().write_loop(sink, out_rx));
        tokio::spawn(session.clone().read_loop(source));

        session
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    /// Cancelled when the link dies; parent of every handler token on it
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) async fn closed(&self) {
        self.token.cancelled().await
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Mux opened by this side of the link
    fn is_own(&self, mux_id: MuxId) -> bool {
        (mux_id % 2 == 1) == self.initiator
    }

    fn next_mux_id(&self) -> MuxId {
        self.mux_ids.fetch_add(2, Ordering::SeqCst)
    }

    /// Queue a frame for the writer
    pub(crate) async fn send(&self, frame: Frame) -> GridResult<()> {
        if frame.payload.len() > MAX_FRAME_SIZE as usize {
            return Err(grid_proto::ProtoError::FrameTooLarge(frame.payload.len()).into());
        }
        if self.token.is_cancelled() {
            return Err(GridError::Disconnected);
        }
        self.out
            .send(frame)
            .await
            .map_err(|_| GridError::Disconnected)
    }

    /// Queue a frame from a context that cannot wait (drop handlers)
    pub(crate) fn send_detached(&self, frame: Frame) {
        if self.token.is_cancelled() {
            return;
        }
        match self.out.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let out = self.out.clone();
                    runtime.spawn(async move {
                        let _ = out.send(frame).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Tell the peer to stop working on `mux_id`
    pub(crate) fn disconnect_mux_detached(&self, mux_id: MuxId, handler: HandlerId) {
        self.send_detached(Frame::new(mux_id, Op::DisconnectMux, Bytes::new()).with_handler(handler));
    }

    /// Tear the link down. Outgoing muxes fail with `Disconnected`, every
    /// handler running for the peer sees its token cancelled.
    pub(crate) fn close(&self) {
        if !self.token.is_cancelled() {
            debug!("{} Closing link", self.label);
        }
        self.token.cancel();
        self.fail_outgoing();
        self.incoming.clear();
    }

    /// Graceful close: announce the disconnect, then tear down
    pub(crate) async fn disconnect(&self) {
        if self
            .send(Frame::connection(Op::Disconnect, Bytes::new()))
            .await
            .is_ok()
        {
            debug!("{} Sent disconnect", self.label);
        }
        self.close();
    }

    #[cfg(any(test, feature = "fault-injection"))]
    pub(crate) fn inject_fault(&self, fault: Fault) {
        warn!("{} Injecting fault {:?}", self.label, fault);
        self.faults.inject(fault);
    }

    #[cfg(any(test, feature = "fault-injection"))]
    async fn inbound_killed(&self) {
        self.faults.inbound_killed().await
    }

    #[cfg(not(any(test, feature = "fault-injection")))]
    async fn inbound_killed(&self) {
        std::future::pending::<()>().await
    }

    #[cfg(any(test, feature = "fault-injection"))]
    async fn outbound_killed(&self) {
        self.faults.outbound_killed().await
    }

    #[cfg(not(any(test, feature = "fault-injection")))]
    async fn outbound_killed(&self) {
        std::future::pending::<()>().await
    }

    #[cfg(any(test, feature = "fault-injection"))]
    async fn inbound_released(&self) {
        self.faults.inbound_released().await
    }

    #[cfg(not(any(test, feature = "fault-injection")))]
    async fn inbound_released(&self) {}

    async fn write_loop(self: Arc<Self>, mut sink: FrameSink, mut rx: mpsc::Receiver<Frame>) {
        let _exit = CancelOnExit(&self.token);
        loop {
            let frame = tokio::select! {
                biased;
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = self.outbound_killed() => {
                    warn!("{} Outbound killed", self.label);
                    self.close();
                    // Dropped without a close message
                    return;
                }
                _ = self.token.cancelled() => break,
            };

            trace!(
                "{} -> {} mux={} seq={} handler={} len={}",
                self.label,
                frame.op,
                frame.mux_id,
                frame.seq,
                frame.handler,
                frame.payload.len()
            );

            let data = match frame.encode() {
                Ok(data) => data,
                Err(e) => {
                    warn!("{} Dropping unencodable frame: {}", self.label, e);
                    continue;
                }
            };

            if let Err(e) = sink.send(data).await {
                debug!("{} Link write error: {}", self.label, e);
                break;
            }
        }

        self.close();
        let _ = sink.close().await;
        debug!("{} Writer task ended", self.label);
    }

    async fn read_loop(self: Arc<Self>, mut source: FrameSource) {
        let _exit = CancelOnExit(&self.token);
        while !self.token.is_cancelled() {
            tokio::select! {
                _ = self.inbound_released() => {}
                _ = self.token.cancelled() => break,
            }

            let next = tokio::select! {
                next = source.next() => next,
                _ = read_idle_expired(self.read_idle) => {
                    warn!("{} No frame for {:?}, closing link", self.label, self.read_idle);
                    break;
                }
                _ = self.inbound_killed() => {
                    warn!("{} Inbound killed", self.label);
                    break;
                }
                _ = self.token.cancelled() => break,
            };

            let data = match next {
                Some(Ok(data)) => data,
                Some(Err(e)) => {
                    debug!("{} Link read error: {}", self.label, e);
                    break;
                }
                None => {
                    debug!("{} Link closed by remote", self.label);
                    break;
                }
            };

            let frame = match Frame::decode(data) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("{} Protocol violation: {}", self.label, e);
                    break;
                }
            };

            trace!(
                "{} <- {} mux={} seq={} handler={} len={}",
                self.label,
                frame.op,
                frame.mux_id,
                frame.seq,
                frame.handler,
                frame.payload.len()
            );

            if let Err(e) = self.dispatch(frame).await {
                warn!("{} Resetting link: {}", self.label, e);
                break;
            }
        }

        self.close();
        debug!("{} Reader task ended", self.label);
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) -> GridResult<()> {
        match frame.op {
            Op::Connect | Op::ConnectResponse => Err(GridError::ProtocolViolation(format!(
                "{} on established link",
                frame.op
            ))),
            Op::Disconnect => {
                debug!("{} Remote is disconnecting", self.label);
                self.close();
                Ok(())
            }
            Op::Request | Op::ConnectMux | Op::MuxClientMsg => {
                if self.is_own(frame.mux_id) {
                    return Err(GridError::ProtocolViolation(format!(
                        "{} on locally allocated mux {}",
                        frame.op, frame.mux_id
                    )));
                }
                match frame.op {
                    Op::Request => self.handle_request(frame).await,
                    Op::ConnectMux => self.handle_connect_mux(frame).await,
                    _ => self.handle_client_msg(frame).await,
                }
            }
            Op::Response => {
                self.handle_response(frame);
                Ok(())
            }
            Op::AckMux => self.handle_ack(frame),
            Op::MuxConnectError => self.handle_mux_connect_error(frame),
            Op::MuxServerMsg => self.handle_server_msg(frame).await,
            Op::MuxServerErr => {
                self.handle_server_err(frame);
                Ok(())
            }
            Op::DisconnectMux => {
                if self.is_own(frame.mux_id) {
                    self.end_outgoing(frame.mux_id, None);
                } else {
                    self.cancel_incoming(frame.mux_id);
                }
                Ok(())
            }
            Op::UnblockMux => {
                if self.is_own(frame.mux_id) {
                    self.grant_request_credit(frame.mux_id);
                } else {
                    self.grant_response_credit(frame.mux_id);
                }
                Ok(())
            }
        }
    }
}
