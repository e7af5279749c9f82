//! Routes server-initiated requests and notifications.
//!
//! One handler per method; registering a method again replaces the earlier
//! handler. Request handlers are async and produce the reply. Notification
//! handlers are plain callbacks run inline on the read loop, which keeps
//! notifications in arrival order. A panicking handler is contained: a
//! request gets an internal-error reply, a notification is dropped.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::protocol::{Envelope, Notification, Request, Response, RpcError};

type RequestFn = dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync;
type NotificationFn = dyn Fn(Option<Value>) + Send + Sync;

#[derive(Clone)]
enum Handler {
    Request(Arc<RequestFn>),
    Notification(Arc<NotificationFn>),
}

impl Handler {
    fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Notification(_) => "notification",
        }
    }
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut methods: Vec<&String> = handlers.keys().collect();
        methods.sort();
        f.debug_struct("Dispatcher").field("methods", &methods).finish()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle server requests for `method`. Returns `true` if an earlier
    /// handler for `method` was replaced.
    pub fn on_request<F, Fut>(&self, method: impl Into<String>, handler: F) -> bool
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let handler: Arc<RequestFn> =
            Arc::new(move |params| -> BoxFuture<'static, Result<Value, RpcError>> {
                Box::pin(handler(params))
            });
        self.insert(method.into(), Handler::Request(handler))
    }

    /// Handle server notifications for `method`. Returns `true` if an earlier
    /// handler for `method` was replaced.
    pub fn on_notification<F>(&self, method: impl Into<String>, handler: F) -> bool
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.insert(method.into(), Handler::Notification(Arc::new(handler)))
    }

    /// Drop the handler for `method`. Returns `true` if one was registered.
    pub fn remove(&self, method: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(method)
            .is_some()
    }

    #[must_use]
    pub fn has_handler(&self, method: &str) -> bool {
        self.lookup(method).is_some()
    }

    fn insert(&self, method: String, handler: Handler) -> bool {
        let kind = handler.kind();
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.clone(), handler);
        if let Some(previous) = &previous {
            tracing::debug!(
                %method,
                previous = previous.kind(),
                replacement = kind,
                "Replaced handler"
            );
        }
        previous.is_some()
    }

    fn lookup(&self, method: &str) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    /// Route one incoming envelope. Returns the reply to send back, if any.
    ///
    /// Requests always get a reply: the handler's result, its error, or
    /// `MethodNotFound`. Notifications never do. Responses belong to the
    /// correlator and are ignored here.
    pub async fn handle(&self, envelope: Envelope) -> Option<Response> {
        match envelope {
            Envelope::Request(request) => Some(self.handle_request(request).await),
            Envelope::Notification(notification) => {
                self.handle_notification(notification);
                None
            }
            Envelope::Response(response) => {
                tracing::warn!(id = ?response.id, "Dispatcher received a response; ignoring");
                None
            }
        }
    }

    async fn handle_request(&self, request: Request) -> Response {
        let Request { id, method, params } = request;
        let handler = match self.lookup(&method) {
            Some(Handler::Request(handler)) => handler,
            Some(Handler::Notification(_)) | None => {
                tracing::debug!(%method, %id, "No handler for server request; replying method not found");
                return Response::err(Some(id), RpcError::method_not_found(&method));
            }
        };

        match AssertUnwindSafe(handler(params)).catch_unwind().await {
            Ok(Ok(result)) => Response::ok(id, result),
            Ok(Err(error)) => {
                tracing::debug!(%method, %id, code = error.code, "Server request handler failed");
                Response::err(Some(id), error)
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                tracing::error!(%method, %id, "Server request handler panicked: {reason}");
                Response::err(
                    Some(id),
                    RpcError::internal(format!("handler for {method} panicked: {reason}")),
                )
            }
        }
    }

    fn handle_notification(&self, notification: Notification) {
        let Notification { method, params } = notification;
        match self.lookup(&method) {
            Some(Handler::Notification(handler)) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(params))) {
                    let reason = panic_message(payload.as_ref());
                    tracing::error!(%method, "Notification handler panicked: {reason}");
                }
            }
            Some(Handler::Request(_)) => {
                tracing::trace!(%method, "Notification for a request-only method; ignoring");
            }
            None => {
                tracing::trace!(%method, "Ignoring unhandled notification");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
