//! Protocol connection
//!
//! Typed requests and notifications over one transport, an event surface for
//! server-initiated traffic, and a close signal. The connection owns no
//! lifecycle state: it never restarts or kills anything.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::protocol::*;
use super::transport::TransportChannels;
use crate::error::{BridgeError, Result};
use crate::events::{Emitter, Subscription};

/// Handler for a request initiated by the server
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, params: Value) -> Result<Value>;
}

/// Outcome of a request that a newer request may supersede
#[derive(Debug, Clone, PartialEq)]
pub enum Cancellable<T> {
    Done(T),
    Cancelled,
}

impl<T> Cancellable<T> {
    pub fn done(self) -> Option<T> {
        match self {
            Cancellable::Done(value) => Some(value),
            Cancellable::Cancelled => None,
        }
    }
}

type PendingMap = HashMap<i64, oneshot::Sender<JsonRpcResponse>>;
type NotificationHandlers = HashMap<String, Arc<Emitter<Value>>>;
type RequestHandlers = HashMap<String, (u64, Arc<dyn RequestHandler>)>;

struct InFlight {
    generation: u64,
    token: CancellationToken,
    request_id: Option<i64>,
}

struct Shared {
    outgoing: mpsc::UnboundedSender<String>,
    pending: Mutex<PendingMap>,
    notifications: Mutex<NotificationHandlers>,
    requests: Mutex<RequestHandlers>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn send_body(&self, body: String) -> Result<()> {
        self.outgoing
            .send(body)
            .map_err(|_| BridgeError::ConnectionClosed)
    }

    fn respond(&self, response: JsonRpcResponse) {
        match serde_json::to_string(&response) {
            Ok(body) => {
                if self.send_body(body).is_err() {
                    debug!("Dropping response, connection closed");
                }
            }
            Err(e) => warn!("Failed to serialize response: {}", e),
        }
    }
}

/// Typed connection to one language server
pub struct Connection {
    label: String,
    shared: Arc<Shared>,
    next_id: AtomicI64,
    next_handler_id: AtomicU64,
    next_generation: AtomicU64,
    in_flight: Mutex<HashMap<String, InFlight>>,
    closed: watch::Receiver<bool>,
    request_timeout: Duration,
}

impl Connection {
    /// Bind a connection to a transport and start dispatching incoming messages
    pub fn new(label: impl Into<String>, channels: TransportChannels, request_timeout: Duration) -> Arc<Self> {
        let TransportChannels { outgoing, incoming } = channels;
        let label = label.into();

        let shared = Arc::new(Shared {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            notifications: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
        });
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(Self::dispatch(label.clone(), Arc::clone(&shared), incoming, closed_tx));

        Arc::new(Self {
            label,
            shared,
            next_id: AtomicI64::new(1),
            next_handler_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            in_flight: Mutex::new(HashMap::new()),
            closed: closed_rx,
            request_timeout,
        })
    }

    async fn dispatch(
        label: String,
        shared: Arc<Shared>,
        mut incoming: mpsc::UnboundedReceiver<String>,
        closed: watch::Sender<bool>,
    ) {
        while let Some(body) = incoming.recv().await {
            let message = match Message::parse(&body) {
                Ok(message) => message,
                Err(e) => {
                    warn!(server = %label, "Ignoring malformed message: {}", e);
                    continue;
                }
            };

            match message {
                Message::Response(response) => {
                    let Some(RequestId::Number(id)) = response.id.clone() else {
                        debug!(server = %label, "Response without numeric id");
                        continue;
                    };
                    let sender = lock(&shared.pending).remove(&id);
                    match sender {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => trace!(server = %label, "Response for unknown request {}", id),
                    }
                }
                Message::Notification(notification) => {
                    let emitter = lock(&shared.notifications).get(&notification.method).cloned();
                    match emitter {
                        Some(emitter) => emitter.emit(&notification.params.unwrap_or(Value::Null)),
                        None => trace!(server = %label, "Unhandled notification {}", notification.method),
                    }
                }
                Message::Request(request) => {
                    let handler = lock(&shared.requests)
                        .get(&request.method)
                        .map(|(_, handler)| Arc::clone(handler));
                    let shared = Arc::clone(&shared);
                    let JsonRpcRequest { id, method, params, .. } = request;

                    match handler {
                        Some(handler) => {
                            tokio::spawn(async move {
                                let response = match handler.handle(params.unwrap_or(Value::Null)).await {
                                    Ok(result) => JsonRpcResponse::success(id, result),
                                    Err(e) => JsonRpcResponse::failure(id, INTERNAL_ERROR, e.to_string()),
                                };
                                shared.respond(response);
                            });
                        }
                        None => {
                            debug!(server = %label, "No handler for server request {}", method);
                            shared.respond(JsonRpcResponse::failure(
                                id,
                                METHOD_NOT_FOUND,
                                format!("Unhandled method {}", method),
                            ));
                        }
                    }
                }
            }
        }

        debug!(server = %label, "Connection closed");
        lock(&shared.pending).clear();
        let _ = closed.send(true);
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the server side of the transport has gone away
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Subscribe to a server notification
    pub fn on_notification<F>(&self, method: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let emitter = Arc::clone(
            lock(&self.shared.notifications)
                .entry(method.to_string())
                .or_insert_with(|| Arc::new(Emitter::new())),
        );
        emitter.subscribe(handler)
    }

    /// Handle a server request; the latest registration for a method wins
    pub fn on_request(&self, method: &str, handler: Arc<dyn RequestHandler>) -> Subscription {
        let handler_id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.requests).insert(method.to_string(), (handler_id, handler));

        let shared = Arc::downgrade(&self.shared);
        let method = method.to_string();
        Subscription::new(move || {
            if let Some(shared) = shared.upgrade() {
                let mut requests = lock(&shared.requests);
                if requests.get(&method).map(|(id, _)| *id == handler_id).unwrap_or(false) {
                    requests.remove(&method);
                }
            }
        })
    }

    /// Send a notification (no response expected)
    pub fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::ConnectionClosed);
        }

        let params = serde_json::to_value(params)?;
        let params = if params.is_null() { None } else { Some(params) };
        let notification = JsonRpcNotification::new(method, params);
        self.shared.send_body(serde_json::to_string(&notification)?)
    }

    fn send_request(&self, method: &str, params: Option<Value>) -> Result<(i64, oneshot::Receiver<JsonRpcResponse>)> {
        if self.is_closed() {
            return Err(BridgeError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let body = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx);

        if let Err(e) = self.shared.send_body(body) {
            self.forget(id);
            return Err(e);
        }
        Ok((id, rx))
    }

    fn forget(&self, id: i64) {
        lock(&self.shared.pending).remove(&id);
    }

    fn send_cancel(&self, id: i64) {
        if let Err(e) = self.notify("$/cancelRequest", json!({ "id": id })) {
            debug!(server = %self.label, "Could not cancel request {}: {}", id, e);
        }
    }

    async fn await_response(
        &self,
        method: &str,
        id: i64,
        rx: oneshot::Receiver<JsonRpcResponse>,
        timeout: Duration,
    ) -> Result<Value> {
        let response = match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.forget(id);
                return Err(BridgeError::Timeout {
                    method: method.to_string(),
                });
            }
            Ok(Err(_)) => return Err(BridgeError::ConnectionClosed),
            Ok(Ok(response)) => response,
        };

        if let Some(error) = response.error {
            if error.code == REQUEST_CANCELLED {
                return Err(BridgeError::Cancelled);
            }
            return Err(BridgeError::Server {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Send a request and wait for the raw result
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.request_with_timeout(method, params, self.request_timeout).await
    }

    pub async fn request_with_timeout(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        let (id, rx) = self.send_request(method, params)?;
        self.await_response(method, id, rx, timeout).await
    }

    /// Send a request and deserialize its result
    pub async fn request_typed<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let params = if params.is_null() { None } else { Some(params) };
        let result = self.request(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a request that supersedes any earlier request made under `key`
    ///
    /// The earlier request is cancelled before this one is issued, so two
    /// responses for the same key are never in flight at once.
    pub async fn keyed_request(&self, key: &str, method: &str, params: Option<Value>) -> Result<Cancellable<Value>> {
        let token = CancellationToken::new();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        let previous = lock(&self.in_flight).insert(
            key.to_string(),
            InFlight {
                generation,
                token: token.clone(),
                request_id: None,
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
            if let Some(id) = previous.request_id {
                self.forget(id);
                self.send_cancel(id);
            }
        }

        let (id, rx) = match self.send_request(method, params) {
            Ok(sent) => sent,
            Err(e) => {
                self.clear_in_flight(key, generation);
                return Err(e);
            }
        };

        let registered = match lock(&self.in_flight).get_mut(key) {
            Some(entry) if entry.generation == generation => {
                entry.request_id = Some(id);
                true
            }
            _ => false,
        };
        if !registered {
            // Superseded between insert and send
            self.forget(id);
            self.send_cancel(id);
            return Ok(Cancellable::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Ok(Cancellable::Cancelled),
            result = self.await_response(method, id, rx, self.request_timeout) => match result {
                Ok(value) => Ok(Cancellable::Done(value)),
                Err(BridgeError::Cancelled) => Ok(Cancellable::Cancelled),
                Err(e) => Err(e),
            },
        };

        self.clear_in_flight(key, generation);
        result
    }

    fn clear_in_flight(&self, key: &str, generation: u64) {
        let mut in_flight = lock(&self.in_flight);
        if in_flight.get(key).map(|entry| entry.generation == generation).unwrap_or(false) {
            in_flight.remove(key);
        }
    }

    pub async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        self.request_typed("initialize", params).await
    }

    pub fn initialized(&self) -> Result<()> {
        self.notify("initialized", json!({}))
    }

    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.request_with_timeout("shutdown", None, timeout).await.map(|_| ())
    }

    pub fn exit(&self) -> Result<()> {
        self.notify("exit", Value::Null)
    }

    pub fn did_open(&self, document: TextDocumentItem) -> Result<()> {
        self.notify(
            "textDocument/didOpen",
            DidOpenTextDocumentParams {
                text_document: document,
            },
        )
    }

    pub fn did_change(&self, params: DidChangeTextDocumentParams) -> Result<()> {
        self.notify("textDocument/didChange", params)
    }

    pub fn did_close(&self, uri: &str) -> Result<()> {
        self.notify(
            "textDocument/didClose",
            DidCloseTextDocumentParams {
                text_document: TextDocumentIdentifier { uri: uri.to_string() },
            },
        )
    }

    pub fn did_save(&self, uri: &str, text: Option<String>) -> Result<()> {
        self.notify(
            "textDocument/didSave",
            DidSaveTextDocumentParams {
                text_document: TextDocumentIdentifier { uri: uri.to_string() },
                text,
            },
        )
    }

    pub fn will_save(&self, uri: &str, reason: u8) -> Result<()> {
        self.notify(
            "textDocument/willSave",
            WillSaveTextDocumentParams {
                text_document: TextDocumentIdentifier { uri: uri.to_string() },
                reason,
            },
        )
    }

    pub async fn will_save_wait_until(&self, uri: &str, reason: u8, timeout: Duration) -> Result<Vec<TextEdit>> {
        let params = serde_json::to_value(WillSaveTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: uri.to_string() },
            reason,
        })?;
        let result = self
            .request_with_timeout("textDocument/willSaveWaitUntil", Some(params), timeout)
            .await?;

        if result.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(result)?)
    }

    pub fn did_change_watched_files(&self, changes: Vec<FileEvent>) -> Result<()> {
        self.notify(
            "workspace/didChangeWatchedFiles",
            DidChangeWatchedFilesParams { changes },
        )
    }

    pub fn did_change_configuration(&self, settings: Value) -> Result<()> {
        self.notify(
            "workspace/didChangeConfiguration",
            DidChangeConfigurationParams { settings },
        )
    }

    /// Outline request; a newer outline request cancels this one
    pub async fn document_symbols(&self, uri: &str) -> Result<Cancellable<Value>> {
        let params = serde_json::to_value(DocumentSymbolParams {
            text_document: TextDocumentIdentifier { uri: uri.to_string() },
        })?;
        self.keyed_request("documentSymbol", "textDocument/documentSymbol", Some(params))
            .await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}
