//! WebSocket transport bridge.
//!
//! A bridge turns one WebSocket connection into a byte duplex: outbound
//! writes go through an unbounded queue, inbound binary frames come back as
//! [`BridgeSignal::Data`]. Writes issued before the socket is open wait in
//! the queue and are flushed once the upgrade completes. Whatever ends the
//! socket, the signal stream finishes with exactly one
//! [`BridgeSignal::Closed`], preceded by [`BridgeSignal::Error`] when the end
//! was a failure.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::TransportError;

/// Capacity of the inbound signal channel
const SIGNAL_CAPACITY: usize = 256;

/// Largest proxy CONNECT response header accepted
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// Everything needed to open the upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    /// `wss://` endpoint
    pub url: String,
    /// Extra request headers (Cookie, Origin, User-Agent, ...)
    pub headers: Vec<(String, String)>,
    /// Optional `http://host:port` proxy
    pub proxy: Option<String>,
}

/// Lifecycle and data signals of a bridge
#[derive(Debug)]
pub enum BridgeSignal {
    /// The socket is open; queued writes are being flushed
    Connected,
    /// One inbound frame
    Data(Bytes),
    /// The stream ended; always the last signal
    Closed(String),
    /// The stream failed; followed by `Closed`
    Error(TransportError),
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Data(Bytes),
    Close,
}

/// Engine side of one bridge
#[derive(Debug)]
pub struct BridgeStream {
    writes: mpsc::UnboundedSender<Outbound>,
    signals: mpsc::Receiver<BridgeSignal>,
}

impl BridgeStream {
    /// Pair an engine side with a transport side
    pub(crate) fn pair() -> (Self, mpsc::UnboundedReceiver<Outbound>, mpsc::Sender<BridgeSignal>) {
        let (writes, outbound) = mpsc::unbounded_channel();
        let (signal_tx, signals) = mpsc::channel(SIGNAL_CAPACITY);
        (Self { writes, signals }, outbound, signal_tx)
    }

    /// Queue bytes for the socket
    pub fn write(&self, data: Bytes) -> Result<(), TransportError> {
        self.writes
            .send(Outbound::Data(data))
            .map_err(|_| TransportError::Closed)
    }

    /// Next signal; `None` once the transport side is gone
    pub async fn recv(&mut self) -> Option<BridgeSignal> {
        self.signals.recv().await
    }

    /// Ask the transport to close; calling it again is a no-op
    pub fn close(&self) {
        let _ = self.writes.send(Outbound::Close);
    }
}

/// Opens bridges
pub trait Connector: Send + Sync {
    /// Start opening a bridge; progress is reported through its signals
    fn open(&self, request: &OpenRequest) -> BridgeStream;
}

/// Connector over real WebSockets, optionally through an HTTP proxy
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    /// Create a connector
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn open(&self, request: &OpenRequest) -> BridgeStream {
        let (stream, outbound, signals) = BridgeStream::pair();
        tokio::spawn(pump(request.clone(), outbound, signals));
        stream
    }
}

async fn pump(
    request: OpenRequest,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    signals: mpsc::Sender<BridgeSignal>,
) {
    let result = tokio::select! {
        result = run_socket(&request, &mut outbound, &signals) => result,
        _ = signals.closed() => Ok("bridge dropped".to_string()),
    };

    let reason = match result {
        Ok(reason) => reason,
        Err(e) => {
            warn!("WebSocket to {} failed: {}", request.url, e);
            let reason = e.to_string();
            let _ = signals.send(BridgeSignal::Error(e)).await;
            reason
        }
    };
    debug!("WebSocket closed: {}", reason);
    let _ = signals.send(BridgeSignal::Closed(reason)).await;
}

async fn run_socket(
    request: &OpenRequest,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    signals: &mpsc::Sender<BridgeSignal>,
) -> Result<String, TransportError> {
    let ws = connect(request).await?;
    info!("WebSocket connected to {}", request.url);
    if signals.send(BridgeSignal::Connected).await.is_err() {
        return Ok("bridge dropped".to_string());
    }

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Data(data)) => {
                    sink.send(Message::Binary(data.to_vec())).await?;
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok("closed by client".to_string());
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if signals.send(BridgeSignal::Data(Bytes::from(data))).await.is_err() {
                        return Ok("bridge dropped".to_string());
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if signals.send(BridgeSignal::Data(Bytes::from(text.into_bytes()))).await.is_err() {
                        return Ok("bridge dropped".to_string());
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return Ok(frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by peer".to_string()));
                }
                // Ping/pong answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok("stream ended".to_string()),
            },
        }
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(request: &OpenRequest) -> Result<Socket, TransportError> {
    let mut upgrade = request.url.as_str().into_client_request()?;
    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::Header(name.clone()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| TransportError::Header(name.to_string()))?;
        upgrade.headers_mut().insert(name, value);
    }

    let result = match &request.proxy {
        None => tokio_tungstenite::connect_async_with_config(upgrade, None, false).await,
        Some(proxy) => {
            let target = Url::parse(&request.url).map_err(|e| TransportError::Url(e.to_string()))?;
            let tcp = tunnel(proxy, &target).await?;
            tokio_tungstenite::client_async_tls_with_config(upgrade, tcp, None, None).await
        }
    };

    match result {
        Ok((ws, _)) => Ok(ws),
        Err(WsError::Http(response)) => Err(TransportError::Rejected {
            status: response.status().as_u16(),
            location: response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Open a CONNECT tunnel through an HTTP proxy
async fn tunnel(proxy: &str, target: &Url) -> Result<TcpStream, TransportError> {
    let proxy = Url::parse(proxy).map_err(|e| TransportError::Url(e.to_string()))?;
    if !proxy.username().is_empty() {
        return Err(TransportError::Proxy(
            "proxy credentials are not supported".to_string(),
        ));
    }
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| TransportError::Url("proxy has no host".to_string()))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(8080);
    let host = target
        .host_str()
        .ok_or_else(|| TransportError::Url("endpoint has no host".to_string()))?;
    let port = target.port_or_known_default().unwrap_or(443);

    debug!("Opening tunnel to {}:{} via {}:{}", host, port, proxy_host, proxy_port);
    let mut tcp = TcpStream::connect((proxy_host, proxy_port)).await?;
    let connect = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    tcp.write_all(connect.as_bytes()).await?;

    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_PROXY_RESPONSE {
            return Err(TransportError::Proxy("oversized CONNECT response".to_string()));
        }
        if tcp.read(&mut byte).await? == 0 {
            return Err(TransportError::Proxy("proxy closed during CONNECT".to_string()));
        }
        response.push(byte[0]);
    }

    let status_line = String::from_utf8_lossy(&response);
    let status = status_line
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("");
    if status != "200" {
        return Err(TransportError::Proxy(format!(
            "CONNECT refused: {}",
            status_line.lines().next().unwrap_or("")
        )));
    }
    Ok(tcp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writes_before_open_are_queued() {
        let (stream, mut outbound, _signals) = BridgeStream::pair();
        stream.write(Bytes::from_static(b"\x10\x00")).unwrap();
        stream.write(Bytes::from_static(b"\xc0\x00")).unwrap();

        assert!(matches!(outbound.recv().await, Some(Outbound::Data(d)) if d.as_ref() == b"\x10\x00"));
        assert!(matches!(outbound.recv().await, Some(Outbound::Data(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (stream, mut outbound, _signals) = BridgeStream::pair();
        stream.close();
        stream.close();
        assert!(matches!(outbound.recv().await, Some(Outbound::Close)));

        drop(outbound);
        stream.close();
        assert!(matches!(stream.write(Bytes::new()), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_ends_with_one_close() {
        let mut stream = WsConnector::new().open(&OpenRequest {
            url: "ws://127.0.0.1:1/chat".to_string(),
            headers: vec![("Cookie".to_string(), "c_user=1".to_string())],
            proxy: None,
        });

        assert!(matches!(stream.recv().await, Some(BridgeSignal::Error(_))));
        assert!(matches!(stream.recv().await, Some(BridgeSignal::Closed(_))));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_header_fails_cleanly() {
        let mut stream = WsConnector::new().open(&OpenRequest {
            url: "ws://127.0.0.1:1/chat".to_string(),
            headers: vec![("Bad Header".to_string(), "x".to_string())],
            proxy: None,
        });
        match stream.recv().await {
            Some(BridgeSignal::Error(TransportError::Header(name))) => assert_eq!(name, "Bad Header"),
            other => panic!("expected header error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejected_display_carries_location() {
        let err = TransportError::Rejected {
            status: 302,
            location: Some("https://www.facebook.com/login.php".to_string()),
        };
        assert!(err.to_string().contains("login.php"));
    }
}
