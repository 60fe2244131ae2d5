//! Muxes opened by the peer: handler invocations

use bytes::Bytes;
use grid_proto::{encode_payload, Flags, Frame, HandlerId, MuxAck, MuxConnectError, MuxId, Op, PongMsg};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::Session;
use crate::error::{GridError, GridResult, RemoteErr};
use crate::registry::{MuxReceiver, Response, StreamingHandler};

pub(super) struct Incoming {
    cancel: CancellationToken,
    stream: Option<ServerStream>,
}

struct ServerStream {
    /// `None` for stateless streams and once the client sent EOF
    requests: Option<mpsc::Sender<Bytes>>,
    response_credits: Arc<Semaphore>,
    expected_seq: u32,
}

enum MsgAction {
    Done,
    Unknown,
    Violation(GridError),
}

impl Session {
    fn reply_err(mux_id: MuxId, handler: HandlerId, op: Op, msg: &str) -> Frame {
        Frame::new(mux_id, op, Bytes::copy_from_slice(msg.as_bytes()))
            .with_handler(handler)
            .with_flags(Flags::new().with_payload_err())
    }

    fn register_incoming(&self, mux_id: MuxId, incoming: Incoming) -> GridResult<()> {
        if self.incoming.contains_key(&mux_id) {
            return Err(GridError::ProtocolViolation(format!(
                "mux {} opened twice",
                mux_id
            )));
        }
        self.incoming.insert(mux_id, incoming);
        Ok(())
    }

    pub(super) async fn handle_request(self: &Arc<Self>, frame: Frame) -> GridResult<()> {
        let mux_id = frame.mux_id;
        let handler_id = frame.handler;

        if handler_id == HandlerId::PING {
            return self.reply_pong(frame).await;
        }

        let Some(handle) = self.handlers.single(handler_id).cloned() else {
            debug!("{} Request for unregistered {}", self.label, handler_id);
            let msg = format!("handler {} not found", handler_id);
            return self
                .send(Self::reply_err(mux_id, handler_id, Op::Response, &msg))
                .await;
        };

        let cancel = self.token.child_token();
        self.register_incoming(
            mux_id,
            Incoming {
                cancel: cancel.clone(),
                stream: None,
            },
        )?;

        let session = self.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                result = handle(frame.payload) => Some(result),
                _ = cancel.cancelled() => None,
            };
            session.incoming.remove(&mux_id);

            let reply = match result {
                Some(Ok(data)) => Frame::new(mux_id, Op::Response, data).with_handler(handler_id),
                Some(Err(e)) => Self::reply_err(mux_id, handler_id, Op::Response, e.message()),
                None => {
                    debug!("{} Request {} to {} cancelled", session.label, mux_id, handler_id);
                    return;
                }
            };
            if session.send(reply).await.is_err() {
                trace!("{} Link gone before reply to {}", session.label, mux_id);
            }
        });

        Ok(())
    }

    async fn reply_pong(&self, frame: Frame) -> GridResult<()> {
        let mut pong = PongMsg::default();
        if !frame.payload.is_empty() {
            match <[u8; 8]>::try_from(&frame.payload[..]) {
                Ok(raw) => pong.not_found = !self.incoming.contains_key(&u64::from_be_bytes(raw)),
                Err(_) => pong.err = Some(format!("malformed ping of {} bytes", frame.payload.len())),
            }
        }

        self.send(
            Frame::new(frame.mux_id, Op::Response, encode_payload(&pong)?)
                .with_handler(HandlerId::PING),
        )
        .await
    }

    pub(super) async fn handle_connect_mux(self: &Arc<Self>, frame: Frame) -> GridResult<()> {
        let mux_id = frame.mux_id;
        let handler_id = frame.handler;

        let Some(handler) = self.handlers.streaming(handler_id) else {
            debug!("{} Stream for unregistered {}", self.label, handler_id);
            let reply = MuxConnectError {
                error: format!("handler {} not found", handler_id),
            };
            return self
                .send(
                    Frame::new(mux_id, Op::MuxConnectError, encode_payload(&reply)?)
                        .with_handler(handler_id),
                )
                .await;
        };

        // Capacities below 1 act as 1
        let (windows, stateless, requests) = match &handler {
            StreamingHandler::Stateless(h) => (
                MuxAck {
                    request_window: 0,
                    response_window: h.out_capacity.max(1) as u32,
                },
                true,
                None,
            ),
            StreamingHandler::Stateful(h) => (
                MuxAck {
                    request_window: h.in_capacity.max(1) as u32,
                    response_window: h.out_capacity.max(1) as u32,
                },
                false,
                Some(mpsc::channel(h.in_capacity.max(1))),
            ),
        };
        let (requests_tx, requests_rx) = match requests {
            Some((tx, rx)) => (Some(tx), Some(rx)),
            None => (None, None),
        };

        let cancel = self.token.child_token();
        let credits = Arc::new(Semaphore::new(windows.response_window as usize));
        self.register_incoming(
            mux_id,
            Incoming {
                cancel: cancel.clone(),
                stream: Some(ServerStream {
                    requests: requests_tx,
                    response_credits: credits.clone(),
                    expected_seq: 0,
                }),
            },
        )?;

        let mut flags = Flags::new();
        if stateless {
            flags = flags.with_stateless();
        }
        self.send(
            Frame::new(mux_id, Op::AckMux, encode_payload(&windows)?)
                .with_handler(handler_id)
                .with_flags(flags),
        )
        .await?;

        debug!("{} Serving stream {} with {}", self.label, mux_id, handler_id);
        tokio::spawn(self.clone().serve_stream(
            mux_id,
            handler_id,
            handler,
            frame.payload,
            cancel,
            requests_rx,
            credits,
        ));
        Ok(())
    }

    /// Runs one stream handler and forwards its responses.
    ///
    /// Once the mux is cancelled responses are still drained, so a handler
    /// blocked on its output channel gets to observe the cancellation.
    #[allow(clippy::too_many_arguments)]
    async fn serve_stream(
        self: Arc<Self>,
        mux_id: MuxId,
        handler_id: HandlerId,
        handler: StreamingHandler,
        payload: Bytes,
        cancel: CancellationToken,
        requests: Option<mpsc::Receiver<Bytes>>,
        credits: Arc<Semaphore>,
    ) {
        let (stateless, out_capacity) = match &handler {
            StreamingHandler::Stateless(h) => (true, h.out_capacity),
            StreamingHandler::Stateful(h) => (false, h.out_capacity),
        };
        let (out_tx, mut out_rx) = mpsc::channel::<Response>(out_capacity.max(1));

        let mut handler_fut = match handler {
            StreamingHandler::Stateless(h) => (h.handle)(cancel.clone(), payload, out_tx),
            StreamingHandler::Stateful(h) => {
                let rx = requests.unwrap_or_else(|| mpsc::channel(1).1);
                let requests = MuxReceiver::new(rx, mux_id, handler_id, self.out.clone());
                (h.handle)(cancel.clone(), payload, requests, out_tx)
            }
        };

        let mut outcome: Option<Result<(), RemoteErr>> = None;
        let mut out_open = true;
        let mut pending: Option<Response> = None;
        let mut seq: u32 = 0;
        let mut terminated = false;

        loop {
            // Errors and stateless responses need no credit; after
            // cancellation responses are only drained
            let needs_credit = matches!(pending, Some(Ok(_))) && !stateless;
            if pending.is_some() && (!needs_credit || cancel.is_cancelled() || terminated) {
                if let Some(resp) = pending.take() {
                    if !cancel.is_cancelled() && !terminated {
                        terminated = self
                            .emit_response(mux_id, handler_id, &mut seq, resp, &cancel)
                            .await;
                    }
                }
            }

            if outcome.is_some() && pending.is_none() && (!out_open || cancel.is_cancelled()) {
                break;
            }

            tokio::select! {
                result = &mut handler_fut, if outcome.is_none() => outcome = Some(result),
                resp = out_rx.recv(), if out_open && pending.is_none() => match resp {
                    Some(resp) => pending = Some(resp),
                    None => out_open = false,
                },
                permit = credits.acquire(), if pending.is_some() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                    if let Some(resp) = pending.take() {
                        if !cancel.is_cancelled() && !terminated {
                            terminated = self
                                .emit_response(mux_id, handler_id, &mut seq, resp, &cancel)
                                .await;
                        }
                    }
                }
                _ = cancel.cancelled(), if pending.is_some() => {}
                else => break,
            }
        }

        self.incoming.remove(&mux_id);

        if !terminated && !cancel.is_cancelled() {
            let last = match outcome {
                Some(Err(e)) => Self::reply_err(mux_id, handler_id, Op::MuxServerErr, e.message()),
                _ => Frame::new(mux_id, Op::DisconnectMux, Bytes::new()).with_handler(handler_id),
            };
            let _ = self.send(last).await;
        } else if cancel.is_cancelled() {
            debug!("{} Stream {} cancelled", self.label, mux_id);
        }
        cancel.cancel();
    }

    /// Put one response on the wire; true when it ended the stream
    async fn emit_response(
        &self,
        mux_id: MuxId,
        handler_id: HandlerId,
        seq: &mut u32,
        resp: Response,
        cancel: &CancellationToken,
    ) -> bool {
        match resp {
            Ok(data) => {
                let frame = Frame::new(mux_id, Op::MuxServerMsg, data)
                    .with_handler(handler_id)
                    .with_seq(*seq);
                *seq = seq.wrapping_add(1);
                if self.send(frame).await.is_err() {
                    cancel.cancel();
                }
                false
            }
            Err(e) => {
                let _ = self
                    .send(Self::reply_err(mux_id, handler_id, Op::MuxServerErr, e.message()))
                    .await;
                cancel.cancel();
                true
            }
        }
    }

    pub(super) async fn handle_client_msg(&self, frame: Frame) -> GridResult<()> {
        let mux_id = frame.mux_id;
        let eof = frame.flags.has_eof();

        let action = match self.incoming.get_mut(&mux_id) {
            Some(mut entry) => match entry.stream.as_mut() {
                Some(stream) if eof && frame.payload.is_empty() => {
                    stream.requests = None;
                    MsgAction::Done
                }
                Some(stream) if stream.expected_seq != frame.seq => {
                    MsgAction::Violation(GridError::OutOfOrder {
                        mux_id,
                        expected: stream.expected_seq,
                        got: frame.seq,
                    })
                }
                Some(stream) => {
                    stream.expected_seq = stream.expected_seq.wrapping_add(1);
                    let action = match &stream.requests {
                        Some(tx) => match tx.try_send(frame.payload) {
                            Ok(()) => MsgAction::Done,
                            Err(TrySendError::Full(_)) => MsgAction::Violation(
                                GridError::FlowControl("request window exceeded".to_string()),
                            ),
                            // Handler stopped reading
                            Err(TrySendError::Closed(_)) => MsgAction::Done,
                        },
                        None => MsgAction::Violation(GridError::FlowControl(
                            "stream takes no more requests".to_string(),
                        )),
                    };
                    if eof {
                        stream.requests = None;
                    }
                    action
                }
                None => {
                    return Err(GridError::ProtocolViolation(format!(
                        "stream message for request {}",
                        mux_id
                    )))
                }
            },
            None => MsgAction::Unknown,
        };

        match action {
            MsgAction::Done => Ok(()),
            MsgAction::Unknown => {
                trace!("{} Request for unknown stream {}", self.label, mux_id);
                Ok(())
            }
            MsgAction::Violation(err) => {
                warn!("{} Stream {} failed: {}", self.label, mux_id, err);
                if let Some((_, incoming)) = self.incoming.remove(&mux_id) {
                    incoming.cancel.cancel();
                }
                self.send(Self::reply_err(
                    mux_id,
                    frame.handler,
                    Op::MuxServerErr,
                    &err.to_string(),
                ))
                .await
            }
        }
    }

    /// The client gave up on `mux_id`
    pub(super) fn cancel_incoming(&self, mux_id: MuxId) {
        if let Some((_, incoming)) = self.incoming.remove(&mux_id) {
            debug!("{} Remote cancelled mux {}", self.label, mux_id);
            incoming.cancel.cancel();
        }
    }

    pub(super) fn grant_response_credit(&self, mux_id: MuxId) {
        let credits = self
            .incoming
            .get(&mux_id)
            .and_then(|entry| entry.stream.as_ref().map(|s| s.response_credits.clone()));
        if let Some(credits) = credits {
            credits.add_permits(1);
        }
    }
}
