//! Handler registry
//!
//! Handlers are looked up by [`HandlerId`] in fixed tables sized by
//! [`HANDLER_LIMIT`]. The registry is filled while the manager is built and is
//! read-only once the manager runs.

use bytes::Bytes;
use futures::future::BoxFuture;
use grid_proto::{Frame, HandlerId, MuxId, Op, HANDLER_LIMIT};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{GridError, GridResult, RemoteErr};

/// One streamed response; an `Err` ends the stream
pub type Response = Result<Bytes, RemoteErr>;

/// Single request handler
pub type SingleHandlerFn =
    Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<Bytes, RemoteErr>> + Send + Sync>;

type StatelessFn = Arc<
    dyn Fn(CancellationToken, Bytes, mpsc::Sender<Response>) -> BoxFuture<'static, Result<(), RemoteErr>>
        + Send
        + Sync,
>;

type StatefulFn = Arc<
    dyn Fn(
            CancellationToken,
            Bytes,
            MuxReceiver,
            mpsc::Sender<Response>,
        ) -> BoxFuture<'static, Result<(), RemoteErr>>
        + Send
        + Sync,
>;

/// Best-effort stream: one payload in, responses out, no requests.
///
/// Responses may be dropped by the caller when it falls behind.
#[derive(Clone)]
pub struct StatelessHandler {
    pub(crate) handle: StatelessFn,
    /// Responses buffered towards the caller; below 1 acts as 1
    pub out_capacity: usize,
}

impl StatelessHandler {
    pub fn new<F, Fut>(handle: F) -> Self
    where
        F: Fn(CancellationToken, Bytes, mpsc::Sender<Response>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RemoteErr>> + Send + 'static,
    {
        Self {
            handle: Arc::new(move |cancel, payload, out| Box::pin(handle(cancel, payload, out))),
            out_capacity: 1,
        }
    }

    pub fn with_out_capacity(mut self, capacity: usize) -> Self {
        self.out_capacity = capacity.max(1);
        self
    }
}

/// Bidirectional stream with flow control in both directions
#[derive(Clone)]
pub struct StatefulHandler {
    pub(crate) handle: StatefulFn,
    /// Response window; below 1 acts as 1
    pub out_capacity: usize,
    /// Request window; below 1 acts as 1
    pub in_capacity: usize,
}

impl StatefulHandler {
    pub fn new<F, Fut>(handle: F) -> Self
    where
        F: Fn(CancellationToken, Bytes, MuxReceiver, mpsc::Sender<Response>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), RemoteErr>> + Send + 'static,
    {
        Self {
            handle: Arc::new(move |cancel, payload, requests, out| {
                Box::pin(handle(cancel, payload, requests, out))
            }),
            out_capacity: 1,
            in_capacity: 1,
        }
    }

    pub fn with_out_capacity(mut self, capacity: usize) -> Self {
        self.out_capacity = capacity.max(1);
        self
    }

    pub fn with_in_capacity(mut self, capacity: usize) -> Self {
        self.in_capacity = capacity.max(1);
        self
    }
}

/// Either kind of streaming handler
#[derive(Clone)]
pub enum StreamingHandler {
    Stateless(StatelessHandler),
    Stateful(StatefulHandler),
}

impl From<StatelessHandler> for StreamingHandler {
    fn from(handler: StatelessHandler) -> Self {
        StreamingHandler::Stateless(handler)
    }
}

impl From<StatefulHandler> for StreamingHandler {
    fn from(handler: StatefulHandler) -> Self {
        StreamingHandler::Stateful(handler)
    }
}

/// Returns one request credit to the client per message taken
struct CreditReturn {
    mux_id: MuxId,
    handler: HandlerId,
    out: mpsc::Sender<Frame>,
}

/// Requests of a stateful stream, as seen by the handler.
///
/// Each message taken off the receiver lets the client send one more.
pub struct MuxReceiver {
    rx: mpsc::Receiver<Bytes>,
    credits: Option<CreditReturn>,
}

impl MuxReceiver {
    pub(crate) fn new(
        rx: mpsc::Receiver<Bytes>,
        mux_id: MuxId,
        handler: HandlerId,
        out: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            rx,
            credits: Some(CreditReturn {
                mux_id,
                handler,
                out,
            }),
        }
    }

    /// Receiver without a remote peer, for driving handlers directly
    pub fn detached(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx, credits: None }
    }

    /// Next request, `None` once the client closed its side or went away
    pub async fn recv(&mut self) -> Option<Bytes> {
        let msg = self.rx.recv().await?;

        if let Some(credits) = &self.credits {
            let unblock = Frame::new(credits.mux_id, Op::UnblockMux, Bytes::new())
                .with_handler(credits.handler);
            if credits.out.send(unblock).await.is_err() {
                trace!("Mux {} link gone, credit not returned", credits.mux_id);
            }
        }

        Some(msg)
    }
}

/// Handler tables indexed by handler id
pub struct Handlers {
    single: [Option<SingleHandlerFn>; HANDLER_LIMIT],
    stateless: [Option<StatelessHandler>; HANDLER_LIMIT],
    stateful: [Option<StatefulHandler>; HANDLER_LIMIT],
}

impl Handlers {
    pub fn new() -> Self {
        Self {
            single: std::array::from_fn(|_| None),
            stateless: std::array::from_fn(|_| None),
            stateful: std::array::from_fn(|_| None),
        }
    }

    fn check_free(&self, id: HandlerId) -> GridResult<()> {
        if !id.is_valid() || id.is_reserved() {
            return Err(GridError::InvalidHandlerId(id.as_u8()));
        }
        if self.has_any(id) {
            return Err(GridError::HandlerAlreadyRegistered(id));
        }
        Ok(())
    }

    pub fn register_single<F, Fut>(&mut self, id: HandlerId, handle: F) -> GridResult<()>
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, RemoteErr>> + Send + 'static,
    {
        self.check_free(id)?;
        let handle: SingleHandlerFn = Arc::new(move |payload| Box::pin(handle(payload)));
        self.single[id.index()] = Some(handle);
        debug!("Registered single handler {}", id);
        Ok(())
    }

    pub fn register_stateless(&mut self, id: HandlerId, handler: StatelessHandler) -> GridResult<()> {
        self.check_free(id)?;
        self.stateless[id.index()] = Some(handler);
        debug!("Registered stateless stream handler {}", id);
        Ok(())
    }

    pub fn register_stateful(&mut self, id: HandlerId, handler: StatefulHandler) -> GridResult<()> {
        self.check_free(id)?;
        self.stateful[id.index()] = Some(handler);
        debug!("Registered stateful stream handler {}", id);
        Ok(())
    }

    pub fn register_streaming(
        &mut self,
        id: HandlerId,
        handler: impl Into<StreamingHandler>,
    ) -> GridResult<()> {
        match handler.into() {
            StreamingHandler::Stateless(h) => self.register_stateless(id, h),
            StreamingHandler::Stateful(h) => self.register_stateful(id, h),
        }
    }

    pub fn single(&self, id: HandlerId) -> Option<&SingleHandlerFn> {
        self.single.get(id.index())?.as_ref()
    }

    pub fn streaming(&self, id: HandlerId) -> Option<StreamingHandler> {
        let index = id.index();
        if let Some(h) = self.stateless.get(index)?.as_ref() {
            return Some(StreamingHandler::Stateless(h.clone()));
        }
        self.stateful
            .get(index)?
            .as_ref()
            .map(|h| StreamingHandler::Stateful(h.clone()))
    }

    pub fn has_any(&self, id: HandlerId) -> bool {
        let index = id.index();
        index < HANDLER_LIMIT
            && (self.single[index].is_some()
                || self.stateless[index].is_some()
                || self.stateful[index].is_some())
    }

    /// Ids with a handler of any kind
    pub fn registered(&self) -> Vec<HandlerId> {
        (1..HANDLER_LIMIT as u8)
            .map(HandlerId::from_raw)
            .filter(|id| self.has_any(*id))
            .collect()
    }
}

impl Default for Handlers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_handlers() -> Handlers {
        let mut handlers = Handlers::new();
        handlers
            .register_single(HandlerId::SERVER_INFO, |payload| async move { Ok(payload) })
            .unwrap();
        handlers
    }

    #[test]
    fn test_reserved_and_out_of_range_ids_rejected() {
        let mut handlers = Handlers::new();

        for raw in [0u8, 1, 255] {
            let result =
                handlers.register_single(HandlerId::from_raw(raw), |p| async move { Ok(p) });
            assert!(
                matches!(result, Err(GridError::InvalidHandlerId(id)) if id == raw),
                "id {} should be rejected",
                raw
            );
        }
        assert!(handlers.registered().is_empty());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut handlers = echo_handlers();

        let again = handlers.register_single(HandlerId::SERVER_INFO, |p| async move { Ok(p) });
        assert!(matches!(
            again,
            Err(GridError::HandlerAlreadyRegistered(HandlerId::SERVER_INFO))
        ));

        // A different kind on the same id is rejected too
        let stream = StatelessHandler::new(|_, _, _| async { Ok(()) });
        assert!(matches!(
            handlers.register_streaming(HandlerId::SERVER_INFO, stream),
            Err(GridError::HandlerAlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_lookup_by_kind() {
        let mut handlers = echo_handlers();
        handlers
            .register_streaming(
                HandlerId::TRACE,
                StatefulHandler::new(|_, _, _, _| async { Ok(()) }).with_in_capacity(4),
            )
            .unwrap();

        assert!(handlers.single(HandlerId::SERVER_INFO).is_some());
        assert!(handlers.streaming(HandlerId::SERVER_INFO).is_none());

        match handlers.streaming(HandlerId::TRACE) {
            Some(StreamingHandler::Stateful(h)) => {
                assert_eq!(h.in_capacity, 4);
                assert_eq!(h.out_capacity, 1);
            }
            _ => panic!("expected a stateful handler"),
        }

        assert_eq!(
            handlers.registered(),
            vec![HandlerId::SERVER_INFO, HandlerId::TRACE]
        );
    }

    #[tokio::test]
    async fn test_single_handler_invocation() {
        let handlers = echo_handlers();
        let handle = handlers.single(HandlerId::SERVER_INFO).unwrap();
        let reply = handle(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(reply, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn test_mux_receiver_returns_credits() {
        let (tx, rx) = mpsc::channel(2);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let mut receiver = MuxReceiver::new(rx, 7, HandlerId::TRACE, out_tx);

        tx.send(Bytes::from_static(b"a")).await.unwrap();
        tx.send(Bytes::from_static(b"b")).await.unwrap();
        drop(tx);

        assert_eq!(receiver.recv().await.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(receiver.recv().await.unwrap(), Bytes::from_static(b"b"));
        assert!(receiver.recv().await.is_none());

        for _ in 0..2 {
            let frame = out_rx.recv().await.unwrap();
            assert_eq!(frame.op, Op::UnblockMux);
            assert_eq!(frame.mux_id, 7);
        }
        assert!(out_rx.try_recv().is_err());
    }
}
