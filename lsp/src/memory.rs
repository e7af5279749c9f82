//! In-process transport for driving a session without a real server.
//!
//! [`MemoryTransport`] is handed to the session; its paired [`MemoryServer`]
//! stays with the caller, accepts each connection the session opens as a
//! [`MemoryPeer`], and can make connection attempts fail or hang.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::codec;
use crate::error::{ConnectError, MalformedEnvelope, SendError, TransportError};
use crate::protocol::Envelope;
use crate::transport::{Connection, FrameSink, FrameSource, Transport};

#[derive(Debug, Default)]
struct Controls {
    attempts: AtomicU32,
    fail_next: AtomicU32,
    refuse_all: AtomicBool,
    stall: AtomicBool,
}

impl Controls {
    /// Consume one queued failure, if any.
    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Client side of an in-memory link.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    controls: Arc<Controls>,
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> (Self, MemoryServer) {
        let controls = Arc::new(Controls::default());
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                controls: Arc::clone(&controls),
                accept_tx,
            },
            MemoryServer {
                controls,
                accept_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<Connection, ConnectError> {
        let attempt = self.controls.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.controls.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.controls.refuse_all.load(Ordering::SeqCst) || self.controls.take_failure() {
            return Err(ConnectError::Failed(format!(
                "connection refused (attempt {attempt})"
            )));
        }

        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            inbound: to_server_rx,
            outbound: to_client_tx,
        };
        if self.accept_tx.send(peer).is_err() {
            return Err(ConnectError::Failed("memory server is gone".to_string()));
        }

        Ok(Connection::new(
            MemorySink {
                tx: Some(to_server_tx),
            },
            MemorySource { rx: to_client_rx },
        ))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

/// Server side: accepts connections and controls whether opening succeeds.
#[derive(Debug)]
pub struct MemoryServer {
    controls: Arc<Controls>,
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryServer {
    /// Wait for the next connection. `None` once the transport is dropped.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next(&self, count: u32) {
        self.controls.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every connection attempt until switched off.
    pub fn refuse_all(&self, refuse: bool) {
        self.controls.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Make connection attempts hang forever, so only the connect timeout
    /// ends them.
    pub fn stall(&self, stall: bool) {
        self.controls.stall.store(stall, Ordering::SeqCst);
    }

    /// Connection attempts made so far, successful or not.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.controls.attempts.load(Ordering::SeqCst)
    }
}

/// The server's end of one connection. Dropping it closes the connection.
#[derive(Debug)]
pub struct MemoryPeer {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl MemoryPeer {
    /// Next frame from the client. `None` once the client closed its side.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Next frame from the client, decoded.
    pub async fn recv_envelope(&mut self) -> Option<Result<Envelope, MalformedEnvelope>> {
        self.recv().await.map(|frame| codec::decode(&frame))
    }

    /// A frame the client already sent, without waiting.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.try_recv().ok()
    }

    /// Send raw bytes to the client. Returns `false` if the client is gone.
    pub fn send(&self, frame: impl Into<Vec<u8>>) -> bool {
        self.outbound.send(frame.into()).is_ok()
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        self.send(codec::encode(envelope))
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), SendError> {
        let tx = self.tx.as_ref().ok_or(SendError::Closed)?;
        tx.send(frame).map_err(|_| SendError::Closed)
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}
