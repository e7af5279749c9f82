//! Transport seam.
//!
//! A [`Transport`] knows how to open a [`Connection`]: an ordered
//! [`FrameSink`] for outgoing frames and a [`FrameSource`] for incoming ones.
//! The session never looks below this seam, so WebSocket, TCP, and in-memory
//! transports are interchangeable.

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{ConnectError, SendError, TransportError};
use crate::framing::{FrameReader, FrameWriter};

/// Outgoing half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame. Frames are delivered in call order.
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), SendError>;

    /// Close the outgoing half. Errors are not interesting at this point.
    async fn close(&mut self);
}

/// Incoming half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame from the peer.
    ///
    /// `None` means the peer closed the connection; an `Err` means the
    /// connection broke. Either way no further frames will arrive.
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>>;
}

/// An open, bidirectional, ordered frame channel.
pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl Connection {
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }

    /// Wrap a byte stream pair with LSP `Content-Length` framing.
    pub fn framed<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(
            FramedSink {
                writer: FrameWriter::new(writer),
            },
            FramedSource {
                reader: FrameReader::new(reader),
            },
        )
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens connections to one endpoint. Called again on every reconnect.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self) -> Result<Connection, ConnectError>;

    /// Human-readable endpoint, for logs.
    fn describe(&self) -> String;
}

struct FramedSink<W> {
    writer: FrameWriter<W>,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for FramedSink<W> {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), SendError> {
        self.writer
            .write_frame(&frame)
            .await
            .map_err(|e| SendError::Io(format!("{e:#}")))
    }

    async fn close(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            tracing::trace!("Ignoring error while closing framed writer: {e:#}");
        }
    }
}

struct FramedSource<R> {
    reader: FrameReader<R>,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for FramedSource<R> {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        match self.reader.read_frame().await {
            Ok(Some(body)) => Some(Ok(body)),
            Ok(None) => None,
            Err(e) => Some(Err(TransportError(format!("{e:#}")))),
        }
    }
}

/// LSP over a plain TCP socket with `Content-Length` framing.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: String,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self) -> Result<Connection, ConnectError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| ConnectError::Failed(format!("{}: {e}", self.addr)))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY on {}: {e}", self.addr);
        }
        let (reader, writer) = stream.into_split();
        Ok(Connection::framed(reader, writer))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}
