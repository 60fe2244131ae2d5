//! Muxes opened by this side: single requests and client streams

use bytes::Bytes;
use grid_proto::{decode_payload, Frame, HandlerId, MuxAck, MuxConnectError, MuxId, Op, PongMsg};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::Session;
use crate::error::{GridError, GridResult, RemoteErr};
use crate::stream::Stream;

pub(super) enum Outgoing {
    Single(oneshot::Sender<GridResult<Bytes>>),
    Stream(ClientMux),
}

impl Outgoing {
    fn fail(self, err: GridError) {
        match self {
            Outgoing::Single(tx) => {
                let _ = tx.send(Err(err));
            }
            Outgoing::Stream(mux) => mux.finish(Some(err)),
        }
    }
}

/// State shared between a client stream and the reader
pub(crate) struct StreamShared {
    /// Why the stream ended, handed out once by `Stream::recv`
    end: Mutex<Option<GridError>>,
    /// Requests the server is ready to take
    pub(crate) request_credits: Semaphore,
}

impl StreamShared {
    fn new() -> Self {
        Self {
            end: Mutex::new(None),
            request_credits: Semaphore::new(0),
        }
    }

    pub(crate) fn take_end(&self) -> Option<GridError> {
        match self.end.lock() {
            Ok(mut end) => end.take(),
            Err(_) => None,
        }
    }
}

/// What the client learns when the server accepts a stream
pub(crate) struct StreamAccept {
    pub(crate) windows: MuxAck,
    pub(crate) stateless: bool,
    pub(crate) responses: mpsc::Receiver<Bytes>,
}

pub(super) struct ClientMux {
    opening: Option<oneshot::Sender<GridResult<StreamAccept>>>,
    responses: Option<mpsc::Sender<Bytes>>,
    shared: Arc<StreamShared>,
    stateless: bool,
    expected_seq: u32,
}

impl ClientMux {
    fn finish(mut self, err: Option<GridError>) {
        self.shared.request_credits.close();

        if let Some(opening) = self.opening.take() {
            let err = err.unwrap_or_else(|| {
                GridError::MuxConnect("stream closed before it was accepted".to_string())
            });
            let _ = opening.send(Err(err));
            return;
        }

        if let Some(err) = err {
            if let Ok(mut end) = self.shared.end.lock() {
                *end = Some(err);
            }
        }
        // Dropping `responses` ends the stream for the reader side
    }
}

/// Removes a pending outgoing mux when its caller goes away
struct OutgoingGuard<'a> {
    session: &'a Session,
    mux_id: MuxId,
    handler: HandlerId,
    armed: bool,
}

impl OutgoingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for OutgoingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.session.outgoing.remove(&self.mux_id).is_some() {
            // Still pending, so the remote may be working on it
            self.session.disconnect_mux_detached(self.mux_id, self.handler);
        }
    }
}

enum MsgAction {
    Delivered,
    Dropped,
    Unknown,
    Violation(GridError),
}

impl Session {
    /// Single request. Resolves on the response, cancellation or link loss.
    pub(crate) async fn request(
        &self,
        cancel: &CancellationToken,
        handler: HandlerId,
        payload: Bytes,
    ) -> GridResult<Bytes> {
        let mux_id = self.next_mux_id();
        let (tx, rx) = oneshot::channel();
        self.outgoing.insert(mux_id, Outgoing::Single(tx));
        let _guard = OutgoingGuard {
            session: self,
            mux_id,
            handler,
            armed: true,
        };

        self.send(
            Frame::new(mux_id, Op::Request, payload).with_handler(handler),
        )
        .await?;

        tokio::select! {
            result = rx => result.unwrap_or(Err(GridError::Disconnected)),
            _ = cancel.cancelled() => {
                debug!("{} Request {} to {} cancelled", self.label, mux_id, handler);
                Err(GridError::Cancelled)
            }
            _ = self.token.cancelled() => Err(GridError::Disconnected),
        }
    }

    /// Open a streaming mux and wait for the server to accept it
    pub(crate) async fn open_stream(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        handler: HandlerId,
        payload: Bytes,
    ) -> GridResult<Stream> {
        let mux_id = self.next_mux_id();
        let (ack_tx, ack_rx) = oneshot::channel();
        let shared = Arc::new(StreamShared::new());
        self.outgoing.insert(
            mux_id,
            Outgoing::Stream(ClientMux {
                opening: Some(ack_tx),
                responses: None,
                shared: shared.clone(),
                stateless: false,
                expected_seq: 0,
            }),
        );
        let guard = OutgoingGuard {
            session: self,
            mux_id,
            handler,
            armed: true,
        };

        self.send(Frame::new(mux_id, Op::ConnectMux, payload).with_handler(handler))
            .await?;

        let accept = tokio::select! {
            result = ack_rx => result.unwrap_or(Err(GridError::Disconnected))?,
            _ = cancel.cancelled() => return Err(GridError::Cancelled),
            _ = self.token.cancelled() => return Err(GridError::Disconnected),
        };

        // From here on the stream cleans up after itself
        guard.disarm();
        debug!(
            "{} Stream {} to {} open (windows {}/{})",
            self.label,
            mux_id,
            handler,
            accept.windows.request_window,
            accept.windows.response_window
        );

        let cancel = cancel.child_token();
        tokio::spawn(self.clone().watch_stream(mux_id, handler, cancel.clone()));
        Ok(Stream::new(self.clone(), mux_id, handler, accept, shared, cancel))
    }

    /// Cancel `mux_id` on both ends once `cancel` fires. The stream cancels the
    /// token itself when dropped, so this task never outlives it.
    async fn watch_stream(self: Arc<Self>, mux_id: MuxId, handler: HandlerId, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.token.cancelled() => return,
        }
        if let Some((_, entry)) = self.outgoing.remove(&mux_id) {
            debug!("{} Stream {} to {} cancelled", self.label, mux_id, handler);
            entry.fail(GridError::Cancelled);
            self.disconnect_mux_detached(mux_id, handler);
        }
    }

    /// Round trip to the peer's built-in ping handler
    pub(crate) async fn ping(&self, cancel: &CancellationToken) -> GridResult<Duration> {
        let started = Instant::now();
        self.ping_payload(cancel, Bytes::new()).await?;
        Ok(started.elapsed())
    }

    /// Whether the peer still runs the server side of `mux_id`
    pub(crate) async fn ping_mux(&self, cancel: &CancellationToken, mux_id: MuxId) -> GridResult<bool> {
        let pong = self
            .ping_payload(cancel, Bytes::copy_from_slice(&mux_id.to_be_bytes()))
            .await?;
        Ok(!pong.not_found)
    }

    async fn ping_payload(&self, cancel: &CancellationToken, payload: Bytes) -> GridResult<PongMsg> {
        let reply = self.request(cancel, HandlerId::PING, payload).await?;
        let pong: PongMsg = decode_payload(&reply)?;
        match pong.err {
            Some(err) => Err(GridError::Remote(RemoteErr(err))),
            None => Ok(pong),
        }
    }

    /// Forget a stream the caller dropped
    pub(crate) fn forget_outgoing(&self, mux_id: MuxId) -> bool {
        self.outgoing.remove(&mux_id).is_some()
    }

    pub(super) fn handle_response(&self, frame: Frame) {
        let entry = self
            .outgoing
            .remove_if(&frame.mux_id, |_, v| matches!(v, Outgoing::Single(_)));

        match entry {
            Some((_, Outgoing::Single(tx))) => {
                let result = if frame.flags.payload_is_err() {
                    Err(GridError::Remote(RemoteErr::new(
                        String::from_utf8_lossy(&frame.payload).into_owned(),
                    )))
                } else {
                    Ok(frame.payload)
                };
                let _ = tx.send(result);
            }
            _ => trace!(
                "{} Response for unknown request {}",
                self.label,
                frame.mux_id
            ),
        }
    }

    pub(super) fn handle_ack(&self, frame: Frame) -> GridResult<()> {
        let windows: MuxAck = decode_payload(&frame.payload)?;

        let Some(mut entry) = self.outgoing.get_mut(&frame.mux_id) else {
            trace!("{} Ack for unknown stream {}", self.label, frame.mux_id);
            return Ok(());
        };
        let Outgoing::Stream(mux) = entry.value_mut() else {
            return Err(GridError::ProtocolViolation(format!(
                "AckMux for request {}",
                frame.mux_id
            )));
        };
        let Some(opening) = mux.opening.take() else {
            warn!("{} Duplicate ack for stream {}", self.label, frame.mux_id);
            return Ok(());
        };

        let stateless = frame.flags.is_stateless();
        let (tx, rx) = mpsc::channel(windows.response_window.max(1) as usize);
        mux.responses = Some(tx);
        mux.stateless = stateless;
        if !stateless {
            mux.shared
                .request_credits
                .add_permits(windows.request_window as usize);
        }

        let _ = opening.send(Ok(StreamAccept {
            windows,
            stateless,
            responses: rx,
        }));
        Ok(())
    }

    pub(super) fn handle_mux_connect_error(&self, frame: Frame) -> GridResult<()> {
        let reply: MuxConnectError = decode_payload(&frame.payload)?;
        if let Some((_, entry)) = self.outgoing.remove(&frame.mux_id) {
            entry.fail(GridError::MuxConnect(reply.error));
        }
        Ok(())
    }

    pub(super) async fn handle_server_msg(&self, frame: Frame) -> GridResult<()> {
        let mux_id = frame.mux_id;

        let action = match self.outgoing.get_mut(&mux_id) {
            Some(mut entry) => match entry.value_mut() {
                Outgoing::Stream(mux) => {
                    if mux.expected_seq != frame.seq {
                        MsgAction::Violation(GridError::OutOfOrder {
                            mux_id,
                            expected: mux.expected_seq,
                            got: frame.seq,
                        })
                    } else {
                        mux.expected_seq = mux.expected_seq.wrapping_add(1);
                        match &mux.responses {
                            Some(tx) => match tx.try_send(frame.payload) {
                                Ok(()) => MsgAction::Delivered,
                                Err(TrySendError::Full(_)) if mux.stateless => MsgAction::Dropped,
                                Err(TrySendError::Full(_)) => MsgAction::Violation(
                                    GridError::FlowControl("response window exceeded".to_string()),
                                ),
                                // Stream dropped, its drop handler notifies the server
                                Err(TrySendError::Closed(_)) => MsgAction::Delivered,
                            },
                            None => MsgAction::Violation(GridError::FlowControl(
                                "response before stream was accepted".to_string(),
                            )),
                        }
                    }
                }
                Outgoing::Single(_) => {
                    return Err(GridError::ProtocolViolation(format!(
                        "stream message for request {}",
                        mux_id
                    )))
                }
            },
            None => MsgAction::Unknown,
        };

        match action {
            MsgAction::Delivered => {}
            MsgAction::Dropped => {
                trace!("{} Stream {} consumer behind, response dropped", self.label, mux_id)
            }
            MsgAction::Unknown => {
                trace!("{} Response for unknown stream {}", self.label, mux_id);
                self.send(Frame::new(mux_id, Op::DisconnectMux, Bytes::new()).with_handler(frame.handler))
                    .await?;
            }
            MsgAction::Violation(err) => {
                warn!("{} Stream {} failed: {}", self.label, mux_id, err);
                self.end_outgoing(mux_id, Some(err));
                self.send(Frame::new(mux_id, Op::DisconnectMux, Bytes::new()).with_handler(frame.handler))
                    .await?;
            }
        }
        Ok(())
    }

    pub(super) fn handle_server_err(&self, frame: Frame) {
        let err = RemoteErr::new(String::from_utf8_lossy(&frame.payload).into_owned());
        debug!("{} Stream {} ended with error: {}", self.label, frame.mux_id, err);
        self.end_outgoing(frame.mux_id, Some(GridError::Remote(err)));
    }

    /// The server side of `mux_id` is gone, cleanly when `err` is `None`
    pub(super) fn end_outgoing(&self, mux_id: MuxId, err: Option<GridError>) {
        match self.outgoing.remove(&mux_id) {
            Some((_, Outgoing::Stream(mux))) => mux.finish(err),
            Some((_, single @ Outgoing::Single(_))) => {
                single.fail(err.unwrap_or(GridError::Cancelled));
            }
            None => {}
        }
    }

    pub(super) fn grant_request_credit(&self, mux_id: MuxId) {
        if let Some(entry) = self.outgoing.get(&mux_id) {
            if let Outgoing::Stream(mux) = entry.value() {
                mux.shared.request_credits.add_permits(1);
            }
        }
    }

    /// Fail every mux opened over this link
    pub(super) fn fail_outgoing(&self) {
        let ids: Vec<MuxId> = self.outgoing.iter().map(|e| *e.key()).collect();
        for mux_id in ids {
            if let Some((_, entry)) = self.outgoing.remove(&mux_id) {
                entry.fail(GridError::Disconnected);
            }
        }
    }
}
