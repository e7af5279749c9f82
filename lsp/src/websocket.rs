//! WebSocket transport, one JSON-RPC envelope per text message.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::error::{ConnectError, SendError, TransportError};
use crate::transport::{Connection, FrameSink, FrameSource, Transport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a language server exposed over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: Url,
}

impl WebSocketTransport {
    /// Use `url` as-is. Only `ws` and `wss` URLs are accepted.
    pub fn new(url: &str) -> Result<Self, ConnectError> {
        let url = Url::parse(url)
            .map_err(|e| ConnectError::InvalidEndpoint(format!("{url}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(ConnectError::InvalidEndpoint(format!(
                "unsupported scheme '{other}', expected ws or wss"
            ))),
        }
    }

    /// Endpoint serving one language: `<base>?language=<language>`.
    pub fn for_language(base: &str, language: &str) -> Result<Self, ConnectError> {
        let language = language.trim();
        if language.is_empty() {
            return Err(ConnectError::InvalidEndpoint(
                "language must not be empty".to_string(),
            ));
        }
        let mut transport = Self::new(base)?;
        transport
            .url
            .query_pairs_mut()
            .append_pair("language", language);
        Ok(transport)
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<Connection, ConnectError> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectError::Failed(format!("WebSocket connect: {e}")))?;
        let (sink, stream) = ws.split();
        Ok(Connection::new(WsSink { sink }, WsSource { stream }))
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), SendError> {
        let text = String::from_utf8(frame).map_err(|e| SendError::Io(e.to_string()))?;
        self.sink.send(Message::text(text)).await.map_err(|e| match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => SendError::Closed,
            other => SendError::Io(other.to_string()),
        })
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            tracing::trace!("Ignoring error while closing WebSocket: {e}");
        }
    }
}

struct WsSource {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_bytes().to_vec())),
                Ok(Message::Binary(bytes)) => return Some(Ok(bytes.to_vec())),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "WebSocket closed by peer");
                    return None;
                }
                // Ping/pong are answered by tungstenite itself.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Some(Err(TransportError(e.to_string()))),
            }
        }
    }
}
