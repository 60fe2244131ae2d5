//! Client side of a streaming mux

use bytes::Bytes;
use grid_proto::{Flags, Frame, HandlerId, MuxId, Op};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{GridError, GridResult};
use crate::mux::{Session, StreamAccept, StreamShared};

/// An open stream to a remote handler.
///
/// `send` and `recv` take `&self`, so one task can feed requests while another
/// consumes responses. Dropping an unfinished stream cancels it remotely.
pub struct Stream {
    session: Arc<Session>,
    mux_id: MuxId,
    handler: HandlerId,
    stateless: bool,
    shared: Arc<StreamShared>,
    /// Child of the token the stream was opened with
    cancel: CancellationToken,
    responses: Mutex<mpsc::Receiver<Bytes>>,
    /// Sequence of the next request, `None` once the request side is closed
    send_seq: Mutex<Option<u32>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("mux_id", &self.mux_id)
            .field("handler", &self.handler)
            .field("stateless", &self.stateless)
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(
        session: Arc<Session>,
        mux_id: MuxId,
        handler: HandlerId,
        accept: StreamAccept,
        shared: Arc<StreamShared>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            mux_id,
            handler,
            stateless: accept.stateless,
            shared,
            cancel,
            responses: Mutex::new(accept.responses),
            send_seq: Mutex::new(Some(0)),
        }
    }

    pub fn mux_id(&self) -> MuxId {
        self.mux_id
    }

    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    /// Best-effort stream: takes no requests, responses may have been dropped
    pub fn is_stateless(&self) -> bool {
        self.stateless
    }

    /// Next response.
    ///
    /// Returns `None` once the server finished the stream. A stream that ended
    /// with an error yields that error once, then `None`. Cancelling the token
    /// the stream was opened with ends it with `GridError::Cancelled`.
    pub async fn recv(&self) -> Option<GridResult<Bytes>> {
        let mut responses = self.responses.lock().await;
        match responses.recv().await {
            Some(data) => {
                if !self.stateless {
                    let unblock = Frame::new(self.mux_id, Op::UnblockMux, Bytes::new())
                        .with_handler(self.handler);
                    let _ = self.session.send(unblock).await;
                }
                Some(Ok(data))
            }
            None => self.shared.take_end().map(Err),
        }
    }

    /// Send one request, waiting for the server to have room for it
    pub async fn send(&self, data: Bytes) -> GridResult<()> {
        if self.stateless {
            return Err(GridError::FlowControl(
                "stateless streams take no requests".to_string(),
            ));
        }

        let mut send_seq = self.send_seq.lock().await;
        let Some(seq) = *send_seq else {
            return Err(GridError::FlowControl("request side closed".to_string()));
        };

        let permit = tokio::select! {
            permit = self.shared.request_credits.acquire() => {
                permit.map_err(|_| self.ended_error())?
            }
            _ = self.cancel.cancelled() => return Err(GridError::Cancelled),
        };

        let frame = Frame::new(self.mux_id, Op::MuxClientMsg, data)
            .with_handler(self.handler)
            .with_seq(seq);
        tokio::select! {
            sent = self.session.send(frame) => sent?,
            _ = self.cancel.cancelled() => return Err(GridError::Cancelled),
        }
        // Spent only once the frame is queued
        permit.forget();
        *send_seq = Some(seq.wrapping_add(1));
        Ok(())
    }

    /// Tell the server no more requests follow
    pub async fn close_send(&self) -> GridResult<()> {
        let mut send_seq = self.send_seq.lock().await;
        let Some(seq) = send_seq.take() else {
            return Ok(());
        };
        if self.stateless {
            return Ok(());
        }

        self.session
            .send(
                Frame::new(self.mux_id, Op::MuxClientMsg, Bytes::new())
                    .with_handler(self.handler)
                    .with_seq(seq)
                    .with_flags(Flags::new().with_eof()),
            )
            .await
    }

    /// Feed every response to `f` until the stream ends.
    ///
    /// Stops at the first error, from the stream or from `f`.
    pub async fn results<F>(self, mut f: F) -> GridResult<()>
    where
        F: FnMut(Bytes) -> GridResult<()>,
    {
        while let Some(response) = self.recv().await {
            f(response?)?;
        }
        Ok(())
    }

    /// Check that the server still runs this stream
    pub async fn ping(&self, cancel: &CancellationToken) -> GridResult<Duration> {
        let started = Instant::now();
        if !self.session.ping_mux(cancel, self.mux_id).await? {
            return Err(GridError::MuxConnect(format!(
                "stream {} unknown to remote",
                self.mux_id
            )));
        }
        Ok(started.elapsed())
    }

    fn ended_error(&self) -> GridError {
        if self.cancel.is_cancelled() {
            GridError::Cancelled
        } else if self.session.is_closed() {
            GridError::Disconnected
        } else {
            GridError::MuxConnect(format!("stream {} closed by remote", self.mux_id))
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.session.forget_outgoing(self.mux_id) {
            debug!(
                "{} Stream {} dropped, cancelling remote",
                self.session.label(),
                self.mux_id
            );
            self.session
                .disconnect_mux_detached(self.mux_id, self.handler);
        }
        self.cancel.cancel();
    }
}
