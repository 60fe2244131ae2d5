//! Physical link carrying encoded frames, one frame per message

use bytes::Bytes;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use grid_proto::Frame;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{GridError, GridResult, TransportError};

pub type FrameSink = Pin<Box<dyn Sink<Bytes, Error = TransportError> + Send>>;
pub type FrameSource = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Bidirectional message pipe between two nodes
pub struct Link {
    sink: FrameSink,
    source: FrameSource,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

impl Link {
    pub fn new(sink: FrameSink, source: FrameSource) -> Self {
        Self { sink, source }
    }

    /// Dialing side, on top of a tungstenite client stream
    pub fn from_tungstenite<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();

        let sink = sink
            .sink_map_err(|e| TransportError::WebSocketError(e.to_string()))
            .with(|data: Bytes| future::ready(Ok::<_, TransportError>(Message::Binary(data.to_vec()))));

        let source = source.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                Ok(Message::Close(_)) => Some(Err(TransportError::ConnectionClosed)),
                // Control frames are answered by tungstenite
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::WebSocketError(e.to_string()))),
            })
        });

        Self::new(Box::pin(sink), Box::pin(source))
    }

    /// Accepting side, on top of an upgraded axum socket
    pub fn from_axum(ws: axum::extract::ws::WebSocket) -> Self {
        use axum::extract::ws::Message as AxumMessage;

        let (sink, source) = ws.split();

        let sink = sink
            .sink_map_err(|e| TransportError::WebSocketError(e.to_string()))
            .with(|data: Bytes| future::ready(Ok::<_, TransportError>(AxumMessage::Binary(data))));

        let source = source.filter_map(|msg| {
            future::ready(match msg {
                Ok(AxumMessage::Binary(data)) => Some(Ok(data)),
                Ok(AxumMessage::Close(_)) => Some(Err(TransportError::ConnectionClosed)),
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::WebSocketError(e.to_string()))),
            })
        });

        Self::new(Box::pin(sink), Box::pin(source))
    }

    /// Two links wired to each other in memory
    pub fn memory_pair(capacity: usize) -> (Link, Link) {
        let (a_tx, a_rx) = futures::channel::mpsc::channel::<Bytes>(capacity);
        let (b_tx, b_rx) = futures::channel::mpsc::channel::<Bytes>(capacity);

        let a = Self::new(
            Box::pin(a_tx.sink_map_err(|_| TransportError::ConnectionClosed)),
            Box::pin(b_rx.map(Ok)),
        );
        let b = Self::new(
            Box::pin(b_tx.sink_map_err(|_| TransportError::ConnectionClosed)),
            Box::pin(a_rx.map(Ok)),
        );
        (a, b)
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> GridResult<()> {
        let data = frame.encode()?;
        self.sink.send(data).await?;
        Ok(())
    }

    /// Next frame; a closed link is an error
    pub async fn next_frame(&mut self) -> GridResult<Frame> {
        match self.source.next().await {
            Some(Ok(data)) => Ok(Frame::decode(data)?),
            Some(Err(e)) => Err(GridError::Transport(e)),
            None => Err(GridError::Transport(TransportError::ConnectionClosed)),
        }
    }

    pub async fn close(mut self) {
        let _ = self.sink.close().await;
    }

    pub fn split(self) -> (FrameSink, FrameSource) {
        (self.sink, self.source)
    }
}
