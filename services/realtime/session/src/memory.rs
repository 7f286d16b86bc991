//! In-memory transport.
//!
//! [`MemoryConnector`] implements the bridge contract over channels. Every
//! `open` hands a [`MemoryPeer`] to the paired [`MemoryListener`]; the peer
//! plays the endpoint: it accepts or fails the connection, reads what the
//! engine writes and pushes frames back.

use bytes::{Bytes, BytesMut};
use msgr_wire::{Packet, PacketDecoder, WireError, DEFAULT_MAX_PACKET_SIZE};
use tokio::sync::mpsc;

use crate::bridge::{BridgeSignal, BridgeStream, Connector, OpenRequest, Outbound};
use crate::TransportError;

/// Connector whose bridges end in [`MemoryPeer`]s
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

/// Receives the peer side of every bridge opened by a [`MemoryConnector`]
#[derive(Debug)]
pub struct MemoryListener {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryConnector {
    /// Create a connector and its listener
    pub fn new() -> (Self, MemoryListener) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { peers }, MemoryListener { peers: rx })
    }
}

impl Connector for MemoryConnector {
    fn open(&self, request: &OpenRequest) -> BridgeStream {
        let (stream, outbound, signals) = BridgeStream::pair();
        let peer = MemoryPeer {
            request: request.clone(),
            outbound,
            signals,
            buffer: BytesMut::new(),
            decoder: PacketDecoder::with_max_packet_size(DEFAULT_MAX_PACKET_SIZE),
            closed: false,
        };
        // Without a listener the peer is dropped and the bridge just ends
        let _ = self.peers.send(peer);
        stream
    }
}

impl MemoryListener {
    /// Next opened bridge
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    /// Next opened bridge, if one is already waiting
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.peers.try_recv().ok()
    }
}

/// Endpoint side of an in-memory bridge
#[derive(Debug)]
pub struct MemoryPeer {
    request: OpenRequest,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    signals: mpsc::Sender<BridgeSignal>,
    buffer: BytesMut,
    decoder: PacketDecoder,
    closed: bool,
}

impl MemoryPeer {
    /// The request the bridge was opened with
    pub fn request(&self) -> &OpenRequest {
        &self.request
    }

    /// Report the socket as open
    pub async fn accept(&self) {
        let _ = self.signals.send(BridgeSignal::Connected).await;
    }

    /// Deliver one frame to the engine
    pub async fn send(&self, data: impl Into<Bytes>) {
        let _ = self.signals.send(BridgeSignal::Data(data.into())).await;
    }

    /// Encode and deliver one packet
    pub async fn send_packet(&self, packet: &Packet) -> Result<(), WireError> {
        let bytes = packet.encode(DEFAULT_MAX_PACKET_SIZE)?;
        self.send(bytes).await;
        Ok(())
    }

    /// Next frame written by the engine; `None` once it closed the bridge
    pub async fn recv(&mut self) -> Option<Bytes> {
        match self.outbound.recv().await {
            Some(Outbound::Data(data)) => Some(data),
            Some(Outbound::Close) | None => None,
        }
    }

    /// Next packet written by the engine, reassembled across frames
    pub async fn recv_packet(&mut self) -> Option<Packet> {
        loop {
            match self.decoder.decode(&mut self.buffer) {
                Ok(Some(packet)) => return Some(packet),
                Ok(None) => {}
                Err(_) => return None,
            }
            let data = self.recv().await?;
            self.buffer.extend_from_slice(&data);
        }
    }

    /// End the stream; only the first call has an effect
    pub async fn close(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.signals.send(BridgeSignal::Closed(reason.to_string())).await;
    }

    /// Fail the stream with a transport error, then close it
    pub async fn fail(&mut self, message: &str) {
        if self.closed {
            return;
        }
        let _ = self
            .signals
            .send(BridgeSignal::Error(TransportError::Proxy(message.to_string())))
            .await;
        self.close(message).await;
    }

    /// Whether the engine side still holds the bridge
    pub fn is_open(&self) -> bool {
        !self.signals.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> OpenRequest {
        OpenRequest {
            url: "wss://edge-chat.facebook.com/chat?sid=1".to_string(),
            headers: Vec::new(),
            proxy: None,
        }
    }

    #[tokio::test]
    async fn test_peer_sees_writes_and_pushes_frames() {
        let (connector, mut listener) = MemoryConnector::new();
        let mut stream = connector.open(&request());
        stream.write(Bytes::from_static(&[0xc0, 0x00])).unwrap();

        let mut peer = listener.accept().await.unwrap();
        assert_eq!(peer.request().url, request().url);
        assert_eq!(peer.recv_packet().await, Some(Packet::PingReq));

        peer.accept().await;
        peer.send_packet(&Packet::PingResp).await.unwrap();
        assert!(matches!(stream.recv().await, Some(BridgeSignal::Connected)));
        assert!(matches!(stream.recv().await, Some(BridgeSignal::Data(d)) if d.as_ref() == [0xd0, 0x00]));
    }

    #[tokio::test]
    async fn test_close_once() {
        let (connector, mut listener) = MemoryConnector::new();
        let mut stream = connector.open(&request());
        let mut peer = listener.accept().await.unwrap();

        peer.fail("reset").await;
        peer.close("again").await;
        drop(peer);

        assert!(matches!(stream.recv().await, Some(BridgeSignal::Error(_))));
        assert!(matches!(stream.recv().await, Some(BridgeSignal::Closed(r)) if r == "reset"));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_engine_close_ends_peer_reads() {
        let (connector, mut listener) = MemoryConnector::new();
        let stream = connector.open(&request());
        let mut peer = listener.accept().await.unwrap();
        stream.close();
        assert!(peer.recv().await.is_none());
        drop(stream);
        assert!(!peer.is_open());
    }
}
