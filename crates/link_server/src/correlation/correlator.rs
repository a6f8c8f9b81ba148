use super::registry::{CallId, CallOutcome, CorrelationRegistry};
use crate::error::{BridgeError, Result};
use crate::protocol::{CallbackRequest, CallbackReturn, CALLBACK_EVENT, CALLBACK_RETURN_EVENT};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// One-way channel that carries named events to the other side.
#[async_trait]
pub trait CallTransport: Send + Sync {
    async fn send_event(&self, name: &str, payload: Value) -> Result<()>;
}

#[async_trait]
impl<T: CallTransport + ?Sized> CallTransport for Arc<T> {
    async fn send_event(&self, name: &str, payload: Value) -> Result<()> {
        (**self).send_event(name, payload).await
    }
}

type CallbackHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Value> + Send + Sync>;

/// Request/response over a one-way transport.
///
/// Outgoing calls travel as `callback` events and are settled by the
/// matching `callbackReturn`. Incoming `callback` events run the handler
/// registered for their event name and answer with a `callbackReturn`.
/// The same type serves either end of a channel; only the transport differs.
pub struct Correlator<T> {
    transport: T,
    registry: CorrelationRegistry,
    handlers: DashMap<String, CallbackHandler>,
}

impl<T: CallTransport> Correlator<T> {
    pub fn new(transport: T, timeout: impl Into<Duration>) -> Self {
        Self {
            transport,
            registry: CorrelationRegistry::new(timeout),
            handlers: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Issues a call and hands its outcome to `callback`.
    ///
    /// If the request cannot be written the call settles immediately with
    /// the transport error instead of waiting out the deadline.
    pub async fn call_with<F>(&self, event: &str, message: Value, callback: F) -> CallId
    where
        F: FnOnce(CallOutcome) + Send + 'static,
    {
        let id = self.registry.register(event, callback);
        let request = CallbackRequest {
            id: id.to_string(),
            event: event.to_string(),
            message,
        };

        let sent = match serde_json::to_value(&request) {
            Ok(payload) => self.transport.send_event(CALLBACK_EVENT, payload).await,
            Err(e) => Err(e.into()),
        };
        if let Err(err) = sent {
            warn!("Failed to send call {} for '{}': {}", id, event, err);
            self.registry.fail(&id, err);
        }

        id
    }

    /// Issues a call and waits for its reply.
    pub async fn call(&self, event: &str, message: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let id = self
            .call_with(event, message, move |outcome| {
                let _ = tx.send(outcome);
            })
            .await;

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::NoResponse { id: id.to_string() }),
        }
    }

    /// Registers the handler answering calls for `event`, replacing any previous one.
    pub fn on_callback<F, Fut>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        let handler: CallbackHandler = Arc::new(move |message| handler(message).boxed());
        self.handlers.insert(event.into(), handler);
    }

    /// Answers an incoming call. Returns `Ok(false)` when no handler is
    /// registered for the event; such calls get no reply and time out on
    /// the caller's side.
    pub async fn handle_callback(&self, request: CallbackRequest) -> Result<bool> {
        // Clone out of the map so no shard lock is held across the await.
        let handler = match self.handlers.get(&request.event) {
            Some(handler) => handler.value().clone(),
            None => {
                debug!("No handler for call '{}', leaving {} unanswered", request.event, request.id);
                return Ok(false);
            }
        };

        let reply = handler(request.message).await;
        let payload = serde_json::to_value(CallbackReturn {
            id: request.id,
            message: reply,
        })?;
        self.transport.send_event(CALLBACK_RETURN_EVENT, payload).await?;
        Ok(true)
    }

    /// Settles an outgoing call with its reply.
    pub fn handle_return(&self, reply: CallbackReturn) -> Result<()> {
        self.registry.resolve(&CallId::from(reply.id.as_str()), reply.message)
    }
}
