//! Session: owns the connection and the state machine around it.
//!
//! A [`Session`] is a cheap, cloneable handle. Each live connection gets one
//! writer task draining an ordered queue and one reader task feeding incoming
//! frames back into the session. Sends are enqueued under the lifecycle lock,
//! so wire order is call order. Background tasks only hold weak references;
//! dropping the last handle tears everything down.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::codec;
use crate::correlator::{CompletionHandle, Correlator};
use crate::dispatcher::Dispatcher;
use crate::error::{CallError, ConnectError, SessionError};
use crate::protocol::{
    self, CANCEL_REQUEST_METHOD, Envelope, Notification, Request, RequestId, Response, RpcError,
};
use crate::transport::{Connection, FrameSink, FrameSource, Transport};
use crate::types::{SessionConfig, SessionState};

/// How long `shutdown` waits for queued frames to be flushed.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

enum WriterCommand {
    Send(Vec<u8>),
    Shutdown,
}

/// The current connection, if any.
#[derive(Default)]
struct Link {
    /// Bumped for every new connection and on close, so late close reports
    /// from a superseded connection can be recognized and ignored.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<WriterCommand>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

struct Shared {
    config: SessionConfig,
    transport: Box<dyn Transport>,
    endpoint: String,
    correlator: Arc<Correlator>,
    dispatcher: Arc<Dispatcher>,
    state_tx: watch::Sender<SessionState>,
    /// State transitions and sends happen under this lock.
    link: Mutex<Link>,
    next_id: AtomicI64,
    /// Serializes connect and reconnect attempts.
    connect_gate: tokio::sync::Mutex<()>,
}

/// Handle to an LSP session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &self.state())
            .field("pending", &self.shared.correlator.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session in the `Connecting` state. Nothing is opened until
    /// [`Session::connect`].
    pub fn new(transport: impl Transport, config: SessionConfig) -> Self {
        let endpoint = transport.describe();
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        Self {
            shared: Arc::new(Shared {
                config,
                transport: Box::new(transport),
                endpoint,
                correlator: Arc::new(Correlator::new()),
                dispatcher: Arc::new(Dispatcher::new()),
                state_tx,
                link: Mutex::new(Link::default()),
                next_id: AtomicI64::new(1),
                connect_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Number of requests waiting for a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.len()
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    /// Register a handler for server-to-client requests. Last registration
    /// wins; returns `true` if a handler was replaced.
    pub fn on_request<F, Fut>(&self, method: impl Into<String>, handler: F) -> bool
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.shared.dispatcher.on_request(method, handler)
    }

    /// Register a handler for server notifications. Last registration wins;
    /// returns `true` if a handler was replaced.
    pub fn on_notification<F>(&self, method: impl Into<String>, handler: F) -> bool
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.shared.dispatcher.on_notification(method, handler)
    }

    /// Open the transport and move to `Ready`.
    ///
    /// The first attempt is made immediately, followed by up to
    /// `max_reconnect_attempts` retries with exponential backoff. When every
    /// attempt fails the session is closed.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let _gate = shared.connect_gate.lock().await;

        let state = self.state();
        if state != SessionState::Connecting {
            return Err(SessionError::InvalidState(state));
        }

        tracing::info!(endpoint = %shared.endpoint, "Connecting to language server");
        let attempts = shared.config.max_reconnect_attempts.saturating_add(1);
        match shared.establish(SessionState::Connecting, attempts, false).await {
            Ok(()) => Ok(()),
            Err(err) => {
                shared.close("connect failed");
                Err(err)
            }
        }
    }

    /// Send a request with a fresh id.
    ///
    /// Fails immediately with [`CallError::NotReady`] unless the session is
    /// `Ready`. The returned future resolves with the server's result.
    pub fn request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<PendingRequest, CallError> {
        self.issue(None, method.into(), params)
    }

    /// Send a request under a caller-chosen id. Fails with
    /// [`CallError::DuplicateId`] if that id is still pending.
    pub fn request_with_id(
        &self,
        id: RequestId,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<PendingRequest, CallError> {
        self.issue(Some(id), method.into(), params)
    }

    fn issue(
        &self,
        id: Option<RequestId>,
        method: String,
        params: Option<Value>,
    ) -> Result<PendingRequest, CallError> {
        let shared = &self.shared;

        let handle = {
            let link = shared.link();
            let outbound = shared.ready_outbound(&link)?;
            let handle = match id {
                Some(id) => shared.correlator.register(id, method.clone())?,
                None => shared.register_fresh(&method),
            };
            let id = handle.id().clone();
            let frame = codec::encode(&Envelope::Request(Request {
                id: id.clone(),
                method: method.clone(),
                params,
            }));
            if outbound.send(WriterCommand::Send(frame)).is_err() {
                shared.correlator.forget(&id);
                return Err(CallError::ConnectionClosed);
            }
            handle
        };

        tracing::debug!(id = %handle.id(), %method, "Sent request");
        Ok(PendingRequest::new(
            handle,
            method,
            shared.correlator.clone(),
            shared.config.request_timeout(),
        ))
    }

    /// Send a request and wait for its result.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CallError> {
        self.request(method, params)?.await
    }

    /// Send a notification. Fails immediately unless the session is `Ready`.
    pub fn notify(&self, method: impl Into<String>, params: Option<Value>) -> Result<(), CallError> {
        let notification = Notification::new(method, params);
        tracing::debug!(method = %notification.method, "Sending notification");
        self.shared
            .send_envelope(&Envelope::Notification(notification))
    }

    /// Stop waiting for `id`; its caller sees [`CallError::Cancelled`].
    /// Nothing is sent to the server. Returns `false` if `id` was not pending.
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.shared.correlator.cancel(id)
    }

    /// Cancel `id` locally and tell the server with `$/cancelRequest`.
    pub fn cancel_request(&self, id: &RequestId) -> bool {
        if !self.cancel(id) {
            return false;
        }
        if let Err(e) = self.notify(CANCEL_REQUEST_METHOD, Some(protocol::cancel_params(id))) {
            tracing::debug!(%id, "Could not send cancellation to server: {e}");
        }
        true
    }

    /// Close the transport and fail every pending call with
    /// [`CallError::ConnectionClosed`]. Calling it again does nothing.
    pub async fn shutdown(&self) {
        let Some(Some(writer)) = self.shared.close("shutdown requested") else {
            return;
        };
        if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, writer)
            .await
            .is_err()
        {
            tracing::debug!(endpoint = %self.shared.endpoint, "Writer did not flush in time");
        }
    }
}

impl Shared {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Move to `next` if the state machine allows it. Callers hold the link
    /// lock.
    fn transition(&self, next: SessionState) -> bool {
        let mut previous = None;
        let changed = self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(previous) = previous {
            tracing::debug!(
                endpoint = %self.endpoint,
                from = %previous,
                to = %next,
                "Session state changed"
            );
        }
        changed
    }

    /// Register under the next generated id, skipping ids a caller already
    /// chose through [`Session::request_with_id`]. Call with the link held.
    fn register_fresh(&self, method: &str) -> CompletionHandle {
        loop {
            let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
            match self.correlator.register(id, method) {
                Ok(handle) => return handle,
                Err(err) => tracing::debug!("Skipping generated id: {err}"),
            }
        }
    }

    fn ready_outbound<'a>(
        &self,
        link: &'a Link,
    ) -> Result<&'a mpsc::UnboundedSender<WriterCommand>, CallError> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(CallError::NotReady(state));
        }
        link.outbound.as_ref().ok_or(CallError::NotReady(state))
    }

    fn send_envelope(&self, envelope: &Envelope) -> Result<(), CallError> {
        let link = self.link();
        let outbound = self.ready_outbound(&link)?;
        outbound
            .send(WriterCommand::Send(codec::encode(envelope)))
            .map_err(|_| CallError::ConnectionClosed)
    }

    /// Try to open the transport up to `attempts` times while the session
    /// stays in `from`. With `backoff_first`, every attempt is preceded by a
    /// backoff delay; otherwise only the retries are.
    async fn establish(
        self: &Arc<Self>,
        from: SessionState,
        attempts: u32,
        backoff_first: bool,
    ) -> Result<(), SessionError> {
        let mut last_error = ConnectError::Failed("no connection attempt made".to_string());

        for attempt in 1..=attempts {
            let retry = if backoff_first { attempt } else { attempt - 1 };
            if retry > 0 {
                let delay = self.config.backoff_delay(retry);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before connect attempt");
                tokio::time::sleep(delay).await;
            }

            let state = self.state();
            if state != from {
                return Err(SessionError::InvalidState(state));
            }

            let timeout = self.config.connect_timeout();
            let opened = match tokio::time::timeout(timeout, self.transport.open()).await {
                Ok(result) => result,
                Err(_) => Err(ConnectError::TimedOut(timeout)),
            };

            match opened {
                Ok(connection) => {
                    self.install(connection, from)?;
                    tracing::info!(endpoint = %self.endpoint, attempt, "Connected to language server");
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        attempt,
                        attempts,
                        "Connect attempt failed: {err}"
                    );
                    last_error = err;
                }
            }
        }

        Err(SessionError::ConnectFailed {
            attempts,
            last: last_error,
        })
    }

    /// Start the reader and writer for a fresh connection and go `Ready`.
    fn install(self: &Arc<Self>, connection: Connection, expected: SessionState) -> Result<(), SessionError> {
        let Connection { sink, source } = connection;
        let mut link = self.link();

        let state = self.state();
        if state != expected {
            // Shut down while the connection was being opened.
            return Err(SessionError::InvalidState(state));
        }

        link.generation += 1;
        let generation = link.generation;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        link.writer = Some(tokio::spawn(write_loop(
            Arc::downgrade(self),
            generation,
            sink,
            outbound_rx,
        )));
        link.reader = Some(tokio::spawn(read_loop(
            Arc::downgrade(self),
            generation,
            source,
        )));
        link.outbound = Some(outbound_tx);

        self.transition(SessionState::Ready);
        Ok(())
    }

    async fn on_transport_message(self: &Arc<Self>, frame: &[u8]) {
        let envelope = match codec::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(endpoint = %self.endpoint, "Dropping malformed envelope: {err}");
                return;
            }
        };
        tracing::trace!(kind = envelope.kind(), method = ?envelope.method(), "Received envelope");

        match envelope {
            Envelope::Response(Response {
                id: Some(id),
                outcome,
            }) => {
                let delivered = match outcome {
                    Ok(result) => self.correlator.resolve(&id, result),
                    Err(error) => self.correlator.reject(&id, error),
                };
                if let Err(unmatched) = delivered {
                    tracing::warn!(endpoint = %self.endpoint, "Dropping response: {unmatched}");
                }
            }
            Envelope::Response(Response { id: None, outcome }) => {
                if let Err(error) = outcome {
                    tracing::warn!(endpoint = %self.endpoint, "Server reported an uncorrelated error: {error}");
                }
            }
            Envelope::Request(request) => {
                // Own task, so a slow handler never stalls the read loop.
                let dispatcher = Arc::clone(&self.dispatcher);
                let session = Arc::downgrade(self);
                tokio::spawn(async move {
                    let Some(reply) = dispatcher.handle(Envelope::Request(request)).await else {
                        return;
                    };
                    let Some(shared) = session.upgrade() else {
                        return;
                    };
                    if let Err(e) = shared.send_envelope(&Envelope::Response(reply)) {
                        tracing::debug!("Could not reply to server request: {e}");
                    }
                });
            }
            notification @ Envelope::Notification(_) => {
                self.dispatcher.handle(notification).await;
            }
        }
    }

    fn on_transport_closed(self: &Arc<Self>, generation: u64) {
        {
            let mut link = self.link();
            if link.generation != generation {
                tracing::trace!(generation, "Ignoring close of a superseded connection");
                return;
            }
            if !self.transition(SessionState::Degraded) {
                return;
            }
            link.outbound = None;
            if let Some(reader) = link.reader.take() {
                reader.abort();
            }
            link.writer = None;
        }

        if self.config.max_reconnect_attempts == 0 {
            tracing::warn!(endpoint = %self.endpoint, "Connection lost and reconnection is disabled");
            self.close("connection lost");
            return;
        }

        tracing::warn!(
            endpoint = %self.endpoint,
            pending = self.correlator.len(),
            "Connection lost; reconnecting"
        );
        let shared = Arc::clone(self);
        tokio::spawn(async move { shared.reconnect().await });
    }

    async fn reconnect(self: Arc<Self>) {
        let _gate = self.connect_gate.lock().await;
        if self.state() != SessionState::Degraded {
            return;
        }

        match self
            .establish(SessionState::Degraded, self.config.max_reconnect_attempts, true)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    endpoint = %self.endpoint,
                    pending = self.correlator.len(),
                    "Reconnected"
                );
            }
            Err(SessionError::InvalidState(state)) => {
                tracing::debug!(%state, "Reconnect abandoned");
            }
            Err(err) => {
                tracing::warn!(endpoint = %self.endpoint, "Giving up on reconnect: {err}");
                self.close("reconnect attempts exhausted");
            }
        }
    }

    /// Move to `Closed`, stop the connection, and fail every pending call.
    ///
    /// Returns the writer task of the live connection, if there was one, so
    /// the caller can wait for queued frames to flush. Returns `None` if the
    /// session was already closed.
    fn close(&self, reason: &str) -> Option<Option<JoinHandle<()>>> {
        let (outbound, reader, writer) = {
            let mut link = self.link();
            if !self.transition(SessionState::Closed) {
                return None;
            }
            link.generation += 1;
            (link.outbound.take(), link.reader.take(), link.writer.take())
        };

        if let Some(outbound) = outbound {
            let _ = outbound.send(WriterCommand::Shutdown);
        }
        if let Some(reader) = reader {
            reader.abort();
        }

        let drained = self.correlator.drain();
        tracing::info!(
            endpoint = %self.endpoint,
            reason,
            failed_calls = drained.len(),
            "Session closed"
        );
        Some(writer)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let link = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(reader) = link.reader.take() {
            reader.abort();
        }
        self.correlator.drain();
    }
}

async fn write_loop(
    session: Weak<Shared>,
    generation: u64,
    mut sink: Box<dyn FrameSink>,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Send(frame) => {
                if let Err(e) = sink.send(frame).await {
                    tracing::warn!("LSP write error: {e}");
                    if let Some(shared) = session.upgrade() {
                        shared.on_transport_closed(generation);
                    }
                    return;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
    sink.close().await;
}

async fn read_loop(session: Weak<Shared>, generation: u64, mut source: Box<dyn FrameSource>) {
    loop {
        let next = source.recv().await;
        let Some(shared) = session.upgrade() else {
            return;
        };
        match next {
            Some(Ok(frame)) => shared.on_transport_message(&frame).await,
            Some(Err(e)) => {
                tracing::warn!(endpoint = %shared.endpoint, "LSP read error: {e}");
                shared.on_transport_closed(generation);
                return;
            }
            None => {
                tracing::info!(endpoint = %shared.endpoint, "Language server closed the connection");
                shared.on_transport_closed(generation);
                return;
            }
        }
    }
}

/// The eventual result of [`Session::request`].
///
/// Resolves with the server's result, its error as [`CallError::Rpc`], or
/// [`CallError::Timeout`], [`CallError::Cancelled`],
/// [`CallError::ConnectionClosed`]. The timeout runs from the moment the
/// request is sent, polled or not. Dropping it unresolved de-registers the
/// call.
#[must_use = "the request is abandoned when this is dropped"]
pub struct PendingRequest {
    id: RequestId,
    serial: u64,
    correlator: Arc<Correlator>,
    inner: BoxFuture<'static, Result<Value, CallError>>,
    /// Expires the call at its deadline even if nobody polls it.
    timer: Option<JoinHandle<()>>,
    finished: bool,
}

impl PendingRequest {
    fn new(
        handle: CompletionHandle,
        method: String,
        correlator: Arc<Correlator>,
        timeout: Duration,
    ) -> Self {
        let id = handle.id().clone();
        let serial = handle.serial();
        let deadline = tokio::time::Instant::now() + timeout;

        let timer = tokio::runtime::Handle::try_current().ok().map(|runtime| {
            runtime.spawn(expire_at(
                deadline,
                Arc::downgrade(&correlator),
                id.clone(),
                serial,
                method.clone(),
                timeout,
            ))
        });

        let expiry_correlator = Arc::clone(&correlator);
        let expiry_id = id.clone();
        let inner = Box::pin(async move {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    if expiry_correlator.abandon(&expiry_id, serial).is_some() {
                        tracing::warn!(id = %expiry_id, %method, "Request timed out");
                    }
                    Err(CallError::Timeout {
                        method,
                        after: timeout,
                    })
                }
            }
        });
        Self {
            id,
            serial,
            correlator,
            inner,
            timer,
            finished: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

async fn expire_at(
    deadline: tokio::time::Instant,
    correlator: Weak<Correlator>,
    id: RequestId,
    serial: u64,
    method: String,
    after: Duration,
) {
    tokio::time::sleep_until(deadline).await;
    let Some(correlator) = correlator.upgrade() else {
        return;
    };
    let error = CallError::Timeout {
        method: method.clone(),
        after,
    };
    if correlator.expire(&id, serial, error) {
        tracing::warn!(%id, %method, "Request timed out");
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Future for PendingRequest {
    type Output = Result<Value, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = ready!(self.inner.as_mut().poll(cx));
        self.finished = true;
        self.stop_timer();
        Poll::Ready(outcome)
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.stop_timer();
        if !self.finished && self.correlator.abandon(&self.id, self.serial).is_some() {
            tracing::debug!(id = %self.id, "Abandoned pending request");
        }
    }
}
