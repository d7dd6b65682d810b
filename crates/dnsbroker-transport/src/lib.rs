//! Client stream abstraction for broker tunnels
//!
//! A tunnel owns exactly one client-side duplex endpoint. The broker core never
//! talks to WebSocket (or any other framing) directly; it only sees the two
//! halves defined here:
//!
//! ```text
//!   client ──► ClientSource ──► [relay: client → upstream] ──► UDP resolver
//!   client ◄── ClientSink   ◄── [relay: upstream → client] ◄── UDP resolver
//! ```
//!
//! The halves are split so that each relay direction can own its side
//! without sharing a lock with the other.

pub mod memory;

pub use memory::MemoryPeer;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::debug;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Stream closed")]
    StreamClosed,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A frame received from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Payload bytes to forward upstream
    Data(Bytes),
    /// Protocol-level liveness signal (ping or pong) carrying no payload
    Heartbeat,
}

/// A frame sent to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// One upstream datagram
    Data(Bytes),
    /// Protocol-level ping used by keepalive
    Ping,
}

/// Receiving half of a client stream
#[async_trait]
pub trait ClientSource: Send + Debug {
    /// Receive the next frame from the client
    ///
    /// Returns `None` once the client has closed the stream gracefully.
    async fn recv_frame(&mut self) -> TransportResult<Option<InboundFrame>>;
}

/// Sending half of a client stream
#[async_trait]
pub trait ClientSink: Send + Debug {
    /// Send a frame to the client
    async fn send_frame(&mut self, frame: OutboundFrame) -> TransportResult<()>;

    /// Close the stream. Calling this on a closed sink must succeed.
    async fn close(&mut self) -> TransportResult<()>;
}

/// A duplex client endpoint handed to the broker by a transport adapter
#[derive(Debug)]
pub struct ClientStream {
    source: Box<dyn ClientSource>,
    sink: Box<dyn ClientSink>,
    peer_addr: Option<SocketAddr>,
}

impl ClientStream {
    pub fn new(source: Box<dyn ClientSource>, sink: Box<dyn ClientSink>) -> Self {
        Self {
            source,
            sink,
            peer_addr: None,
        }
    }

    /// Attach the remote address, used only for logging
    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Split into the receiving and sending halves
    pub fn into_parts(self) -> (Box<dyn ClientSource>, Box<dyn ClientSink>) {
        (self.source, self.sink)
    }

    /// Close the stream without relaying anything
    pub async fn close(mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(peer = ?self.peer_addr, "Error closing client stream: {}", e);
        }
    }
}
