//! In-process client stream backed by channels
//!
//! Used by tests and by embedders that want to drive a tunnel without a
//! network transport. `pair` returns the broker-facing `ClientStream` and the
//! `MemoryPeer` that plays the client.

use crate::{
    ClientSink, ClientSource, ClientStream, InboundFrame, OutboundFrame, TransportError,
    TransportResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Create a connected in-memory client stream with `buffer` frames of slack per direction
pub fn pair(buffer: usize) -> (ClientStream, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
    let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
    let closed = Arc::new(AtomicBool::new(false));

    let stream = ClientStream::new(
        Box::new(MemorySource { rx: inbound_rx }),
        Box::new(MemorySink {
            tx: Some(outbound_tx),
            closed: closed.clone(),
        }),
    );

    let peer = MemoryPeer {
        tx: Some(inbound_tx),
        rx: outbound_rx,
        closed,
    };

    (stream, peer)
}

#[derive(Debug)]
struct MemorySource {
    rx: mpsc::Receiver<TransportResult<InboundFrame>>,
}

#[async_trait]
impl ClientSource for MemorySource {
    async fn recv_frame(&mut self) -> TransportResult<Option<InboundFrame>> {
        match self.rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

#[derive(Debug)]
struct MemorySink {
    tx: Option<mpsc::Sender<OutboundFrame>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl ClientSink for MemorySink {
    async fn send_frame(&mut self, frame: OutboundFrame) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::StreamClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionError("memory peer dropped".to_string()))
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.tx = None;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// The client end of an in-memory stream
#[derive(Debug)]
pub struct MemoryPeer {
    tx: Option<mpsc::Sender<TransportResult<InboundFrame>>>,
    rx: mpsc::Receiver<OutboundFrame>,
    closed: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Send payload bytes towards the broker
    pub async fn send_data(&self, data: Bytes) -> TransportResult<()> {
        self.send(Ok(InboundFrame::Data(data))).await
    }

    /// Send a liveness frame (as a pong would be)
    pub async fn send_heartbeat(&self) -> TransportResult<()> {
        self.send(Ok(InboundFrame::Heartbeat)).await
    }

    /// Make the broker's next read fail with `error`
    pub async fn inject_error(&self, error: TransportError) -> TransportResult<()> {
        self.send(Err(error)).await
    }

    /// Close the client's sending side; the broker sees end-of-stream
    pub fn finish(&mut self) {
        self.tx = None;
    }

    /// Receive the next frame sent by the broker, `None` once the broker closed
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.rx.recv().await
    }

    /// Whether the broker has closed the stream
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn send(&self, item: TransportResult<InboundFrame>) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::StreamClosed)?;
        tx.send(item)
            .await
            .map_err(|_| TransportError::ConnectionError("broker side dropped".to_string()))
    }
}
