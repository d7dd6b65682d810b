//! Client stream over an axum WebSocket
//!
//! Binary and text messages both carry client bytes. Ping and pong frames are
//! reported as heartbeats so they count as tunnel activity. Each upstream
//! datagram goes out as one binary message.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use dnsbroker_transport::{
    ClientSink, ClientSource, ClientStream, InboundFrame, OutboundFrame, TransportError,
    TransportResult,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use tracing::trace;

/// Wrap an upgraded socket as a broker client stream
pub fn client_stream(socket: WebSocket) -> ClientStream {
    let (sink, stream) = socket.split();
    ClientStream::new(
        Box::new(WebSocketSource { stream }),
        Box::new(WebSocketSink {
            sink,
            closed: false,
        }),
    )
}

/// Map a WebSocket message to a broker frame. `None` means the peer closed.
pub(crate) fn inbound_frame(message: Message) -> Option<InboundFrame> {
    match message {
        Message::Binary(data) => Some(InboundFrame::Data(data)),
        Message::Text(text) => Some(InboundFrame::Data(Bytes::copy_from_slice(
            text.as_str().as_bytes(),
        ))),
        Message::Ping(_) | Message::Pong(_) => Some(InboundFrame::Heartbeat),
        Message::Close(_) => None,
    }
}

pub(crate) fn outbound_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Data(data) => Message::Binary(data),
        OutboundFrame::Ping => Message::Ping(Bytes::new()),
    }
}

struct WebSocketSource {
    stream: SplitStream<WebSocket>,
}

impl fmt::Debug for WebSocketSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl ClientSource for WebSocketSource {
    async fn recv_frame(&mut self) -> TransportResult<Option<InboundFrame>> {
        match self.stream.next().await {
            Some(Ok(message)) => {
                trace!("Received WebSocket message: {:?}", message);
                Ok(inbound_frame(message))
            }
            Some(Err(e)) => Err(TransportError::ConnectionError(e.to_string())),
            None => Ok(None),
        }
    }
}

struct WebSocketSink {
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
}

impl fmt::Debug for WebSocketSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketSink")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ClientSink for WebSocketSink {
    async fn send_frame(&mut self, frame: OutboundFrame) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }

        self.sink
            .send(outbound_message(frame))
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }

    async fn close(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // The peer may already be gone; the close frame is best effort.
        let _ = self.sink.send(Message::Close(None)).await;
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_and_text_are_data() {
        assert_eq!(
            inbound_frame(Message::Binary(Bytes::from_static(b"abc"))),
            Some(InboundFrame::Data(Bytes::from_static(b"abc")))
        );
        assert_eq!(
            inbound_frame(Message::Text("hello".into())),
            Some(InboundFrame::Data(Bytes::from_static(b"hello")))
        );
    }

    #[test]
    fn test_control_frames() {
        assert_eq!(
            inbound_frame(Message::Pong(Bytes::new())),
            Some(InboundFrame::Heartbeat)
        );
        assert_eq!(
            inbound_frame(Message::Ping(Bytes::from_static(b"x"))),
            Some(InboundFrame::Heartbeat)
        );
        assert_eq!(inbound_frame(Message::Close(None)), None);
    }

    #[test]
    fn test_outbound_mapping() {
        assert!(matches!(
            outbound_message(OutboundFrame::Ping),
            Message::Ping(payload) if payload.is_empty()
        ));
        assert!(matches!(
            outbound_message(OutboundFrame::Data(Bytes::from_static(b"answer"))),
            Message::Binary(payload) if payload.as_ref() == b"answer"
        ));
    }
}
