//! Duplex frame transport.
//!
//! The engine only needs a sink and a stream of [`Frame`]s. Adapters exist
//! for a `tokio-tungstenite` stream (either side of a dial) and, for tests
//! and embedding, an in-memory pair.

use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};

/// One websocket-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Failure of the underlying transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("transport error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("write timed out")]
    WriteTimeout,
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Wrap an error from a non-tungstenite backend.
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// A duplex link, split into its writing and reading halves.
pub struct Transport {
    sink: FrameSink,
    stream: FrameStream,
    remote_addr: Option<String>,
}

impl Transport {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self {
            sink,
            stream,
            remote_addr: None,
        }
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// Adapt a `tokio-tungstenite` websocket.
    pub fn from_websocket<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let sink = sink
            .sink_map_err(TransportError::from)
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(Message::from(frame))));
        let stream = stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(msg) => Frame::from_message(msg).map(Ok),
                Err(e) => Some(Err(TransportError::from(e))),
            })
        });
        Self::new(Box::pin(sink), Box::pin(stream))
    }

    /// Two connected in-memory ends.
    ///
    /// Like a websocket, each end answers a received ping with a pong.
    pub fn pair() -> (Transport, Transport) {
        let (to_a, from_b) = mpsc::unbounded_channel();
        let (to_b, from_a) = mpsc::unbounded_channel();
        (memory_end(to_b, from_b), memory_end(to_a, from_a))
    }

    pub fn into_parts(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

fn memory_end(
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::UnboundedReceiver<Frame>,
) -> Transport {
    let sink = futures_util::sink::unfold(outbound.clone(), |tx, frame: Frame| async move {
        tx.send(frame).map_err(|_| TransportError::Closed)?;
        Ok::<_, TransportError>(tx)
    });
    let stream = futures_util::stream::unfold((inbound, outbound), |(mut rx, tx)| async move {
        let frame = rx.recv().await?;
        if let Frame::Ping(payload) = &frame {
            let _ = tx.send(Frame::Pong(payload.clone()));
        }
        Some((Ok(frame), (rx, tx)))
    });
    Transport::new(Box::pin(sink), Box::pin(stream)).with_remote_addr("memory")
}

impl Frame {
    /// Convert a tungstenite message; raw frames have no counterpart.
    pub fn from_message(msg: Message) -> Option<Self> {
        match msg {
            Message::Text(t) => Some(Self::Text(t.as_str().to_owned())),
            Message::Binary(b) => Some(Self::Binary(b.to_vec())),
            Message::Ping(p) => Some(Self::Ping(p.to_vec())),
            Message::Pong(p) => Some(Self::Pong(p.to_vec())),
            Message::Close(_) => Some(Self::Close),
            Message::Frame(_) => None,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(t) => Message::Text(t.into()),
            Frame::Binary(b) => Message::Binary(b.into()),
            Frame::Ping(p) => Message::Ping(p.into()),
            Frame::Pong(p) => Message::Pong(p.into()),
            Frame::Close => Message::Close(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_both_ways() {
        let (a, b) = Transport::pair();
        let (mut a_sink, mut a_stream) = a.into_parts();
        let (mut b_sink, mut b_stream) = b.into_parts();

        a_sink.send(Frame::Text("hi".into())).await.unwrap();
        assert_eq!(b_stream.next().await.unwrap().unwrap(), Frame::Text("hi".into()));

        b_sink.send(Frame::Binary(vec![1, 2])).await.unwrap();
        assert_eq!(a_stream.next().await.unwrap().unwrap(), Frame::Binary(vec![1, 2]));
    }

    #[tokio::test]
    async fn pair_answers_ping() {
        let (a, b) = Transport::pair();
        let (mut a_sink, mut a_stream) = a.into_parts();
        let (_b_sink, mut b_stream) = b.into_parts();

        a_sink.send(Frame::Ping(vec![7])).await.unwrap();
        assert_eq!(b_stream.next().await.unwrap().unwrap(), Frame::Ping(vec![7]));
        assert_eq!(a_stream.next().await.unwrap().unwrap(), Frame::Pong(vec![7]));
    }

    #[tokio::test]
    async fn dropping_one_end_ends_the_other() {
        let (a, b) = Transport::pair();
        let (_a_sink, mut a_stream) = a.into_parts();
        drop(b);
        assert!(a_stream.next().await.is_none());
    }

    #[test]
    fn message_conversion() {
        let m: Message = Frame::Text("x".into()).into();
        assert_eq!(Frame::from_message(m), Some(Frame::Text("x".into())));
        let m: Message = Frame::Close.into();
        assert_eq!(Frame::from_message(m), Some(Frame::Close));
    }
}
