//! WebSocket RPC client.
//!
//! One background task owns the connection. While disconnected it keeps
//! dialing the configured URL with a fixed backoff; while connected it reads
//! frames and routes responses to the correlation table. Callers share the
//! client freely: every `send` gets its own id and the writer task
//! serializes outbound frames.
//!
//! # Thread Safety
//!
//! The correlation table and the outbound channel slot are behind tokio
//! mutexes. No lock is held across a network write or a user callback.

use crate::pending::{CorrelationTable, FeedbackCallback};
use crate::proxy::{DeviceProxy, Proxy};
use futures::{SinkExt, StreamExt};
use linkrpc_core::config::ConnectionConfig;
use linkrpc_core::protocol::{decode, encode_request, encode_response, FrameBody};
use linkrpc_core::{MethodRouter, Params, RequestId, Result, RpcError};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Hook run on connection state changes.
pub type ConnectionHook = Arc<dyn Fn() + Send + Sync>;

/// Hook run for every id-less call pushed by the server.
pub type NotificationHook = Arc<dyn Fn(&str, Params) + Send + Sync>;

/// Connection state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Stopped by [`RpcClient::close`]; terminal.
    Closed,
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://` or `wss://` URL of the server.
    pub url: String,
    /// Delay between connection attempts.
    pub reconnect_backoff: Duration,
    /// Fail outstanding `send` calls when the connection drops.
    /// Off by default: calls stay pending across reconnects.
    pub fail_pending_on_disconnect: bool,
    /// Upper bound on how long `send` waits for its response.
    /// `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_backoff: ConnectionConfig::RECONNECT_BACKOFF,
            fail_pending_on_disconnect: false,
            call_timeout: None,
        }
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_fail_pending_on_disconnect(mut self, fail: bool) -> Self {
        self.fail_pending_on_disconnect = fail;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.url)
            .map_err(|e| RpcError::InvalidAddress(format!("{}: {}", self.url, e)))?;
        match url.scheme() {
            "ws" | "wss" => Ok(()),
            other => Err(RpcError::InvalidAddress(format!(
                "unsupported scheme {:?} in {}",
                other, self.url
            ))),
        }
    }
}

/// Builder for [`RpcClient`].
pub struct RpcClientBuilder {
    config: ClientConfig,
    router: Option<Arc<MethodRouter>>,
    on_connected: Option<ConnectionHook>,
    on_disconnected: Option<ConnectionHook>,
    on_notification: Option<NotificationHook>,
}

impl RpcClientBuilder {
    /// Serve requests the server sends to this client.
    pub fn router(mut self, router: Arc<MethodRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn on_connected(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(hook));
        self
    }

    pub fn on_disconnected(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnected = Some(Arc::new(hook));
        self
    }

    pub fn on_notification(
        mut self,
        hook: impl Fn(&str, Params) + Send + Sync + 'static,
    ) -> Self {
        self.on_notification = Some(Arc::new(hook));
        self
    }

    /// Validate the config and spawn the connection task.
    ///
    /// Must be called from within a tokio runtime. Returns immediately;
    /// use [`RpcClient::wait_connected`] to wait for the first connection.
    pub fn start(self) -> Result<RpcClient> {
        self.config.validate()?;

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(ClientShared {
            config: self.config,
            router: self.router,
            on_connected: self.on_connected,
            on_disconnected: self.on_disconnected,
            on_notification: self.on_notification,
            next_id: AtomicI64::new(1),
            pending: CorrelationTable::new(),
            outbound: Mutex::new(None),
            state,
            runtime: Handle::current(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(shared.clone().run(shutdown_rx));

        Ok(RpcClient {
            shared,
            driver: Arc::new(Driver {
                shutdown_tx,
                task: Some(task),
            }),
        })
    }
}

/// RPC client with automatic reconnect. Cloning shares the connection.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<ClientShared>,
    driver: Arc<Driver>,
}

/// Owns the background task. Dropping the last client clone stops it.
struct Driver {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Drop for Driver {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct ClientShared {
    config: ClientConfig,
    router: Option<Arc<MethodRouter>>,
    on_connected: Option<ConnectionHook>,
    on_disconnected: Option<ConnectionHook>,
    on_notification: Option<NotificationHook>,
    next_id: AtomicI64,
    pending: CorrelationTable,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    state: watch::Sender<ConnectionState>,
    runtime: Handle,
}

impl RpcClient {
    /// Start configuring a client.
    pub fn builder(config: ClientConfig) -> RpcClientBuilder {
        RpcClientBuilder {
            config,
            router: None,
            on_connected: None,
            on_disconnected: None,
            on_notification: None,
        }
    }

    /// Start a client with no hooks.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        Self::builder(config).start()
    }

    /// Call `method` and wait for its response.
    ///
    /// A remote error comes back as [`RpcError::Network`].
    pub async fn send(&self, method: &str, params: Params) -> Result<Value> {
        let id = self.shared.next_id();
        let request = encode_request(Some(id), method, &params)?;

        let rx = self.shared.pending.insert_waiter(id).await;
        if let Err(e) = self.shared.transmit(request).await {
            self.shared.pending.remove(id).await;
            return Err(e);
        }

        let outcome = match self.shared.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.shared.pending.remove(id).await;
                    warn!("Call {} ({}) timed out after {:?}", id, method, limit);
                    return Err(RpcError::Timeout(limit));
                }
            },
            None => rx.await,
        };

        // A dropped sender means the entry was evicted without an answer.
        outcome.unwrap_or(Err(RpcError::ConnectionClosed))
    }

    /// Call `method` and return at once; every response carrying the
    /// returned id is handed to `callback` until [`release`](Self::release).
    pub async fn send_with_feedback(
        &self,
        method: &str,
        params: Params,
        callback: impl Fn(Result<Value>) + Send + Sync + 'static,
    ) -> Result<RequestId> {
        let id = self.shared.next_id();
        let request = encode_request(Some(id), method, &params)?;

        let callback: FeedbackCallback = Arc::new(callback);
        self.shared.pending.insert_callback(id, callback).await;
        if let Err(e) = self.shared.transmit(request).await {
            self.shared.pending.remove(id).await;
            return Err(e);
        }
        Ok(id)
    }

    /// Blocking form of [`send`](Self::send) for threads that cannot await.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async execution context.
    pub fn send_blocking(&self, method: &str, params: Params) -> Result<Value> {
        self.shared.runtime.block_on(self.send(method, params))
    }

    /// Send a one-way call with no id.
    pub async fn notify(&self, method: &str, params: Params) -> Result<()> {
        let request = encode_request(None, method, &params)?;
        self.shared.transmit(request).await
    }

    /// Drop the feedback entry for `id`. Returns whether one was present.
    pub async fn release(&self, id: RequestId) -> bool {
        self.shared.pending.remove(id).await
    }

    /// Number of calls waiting for a response (feedback entries included).
    pub async fn pending_calls(&self) -> usize {
        self.shared.pending.len().await
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Wait until the client is connected.
    ///
    /// Fails with [`RpcError::ConnectionClosed`] once the client is closed.
    pub async fn wait_connected(&self) -> Result<()> {
        if *self.driver.shutdown_tx.borrow() {
            return Err(RpcError::ConnectionClosed);
        }
        let mut rx = self.shared.state.subscribe();
        let state = rx
            .wait_for(|state| {
                matches!(state, ConnectionState::Connected | ConnectionState::Closed)
            })
            .await
            .map(|state| *state)
            .map_err(|_| RpcError::ConnectionClosed)?;
        match state {
            ConnectionState::Connected => Ok(()),
            _ => Err(RpcError::ConnectionClosed),
        }
    }

    /// Stop reconnecting and close the current connection.
    pub fn close(&self) {
        let _ = self.driver.shutdown_tx.send(true);
    }

    pub fn url(&self) -> &str {
        &self.shared.config.url
    }

    /// Proxy addressing device modules behind the relay.
    pub fn device_proxy(&self) -> DeviceProxy {
        Proxy::new(self.clone())
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.shared.runtime
    }
}

impl ClientShared {
    fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn transmit(&self, text: String) -> Result<()> {
        let outbound = self.outbound.lock().await;
        let tx = outbound.as_ref().ok_or(RpcError::NotConnected)?;
        debug!("-> {}", text);
        tx.send(Message::Text(text))
            .map_err(|_| RpcError::NotConnected)
    }

    /// Connect-or-receive loop. Runs until shutdown is signalled.
    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.state.send_replace(ConnectionState::Connecting);
            let attempt = tokio::select! {
                attempt = connect_async(self.config.url.as_str()) => attempt,
                _ = shutdown_rx.changed() => break,
            };

            match attempt {
                Ok((stream, _)) => {
                    info!("Connected to {}", self.config.url);
                    let stopped = self.serve(stream, &mut shutdown_rx).await;
                    self.handle_disconnect().await;
                    if stopped {
                        break;
                    }
                }
                Err(e) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    debug!(
                        "Connecting to {} failed: {}; retrying in {:?}",
                        self.config.url, e, self.config.reconnect_backoff
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }
        }

        self.outbound.lock().await.take();
        self.state.send_replace(ConnectionState::Closed);
        debug!("Client for {} stopped", self.config.url);
    }

    /// Drive one connection. Returns `true` when stopped by shutdown.
    async fn serve(
        self: &Arc<Self>,
        stream: WsStream,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        *self.outbound.lock().await = Some(tx);
        self.state.send_replace(ConnectionState::Connected);
        if let Some(hook) = &self.on_connected {
            hook();
        }

        let stopped = loop {
            let next = tokio::select! {
                next = source.next() => next,
                _ = shutdown_rx.changed() => break true,
            };

            match next {
                Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                Some(Ok(Message::Close(frame))) => {
                    debug!("Server closed the connection: {:?}", frame);
                    break false;
                }
                Some(Ok(Message::Binary(_))) => debug!("Ignoring binary frame"),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Receive from {} failed: {}", self.config.url, e);
                    break false;
                }
                None => break false,
            }
        };

        // Dropping the last sender lets the writer flush and close the sink.
        self.outbound.lock().await.take();
        if stopped {
            let _ = writer.await;
        }
        stopped
    }

    async fn handle_disconnect(&self) {
        self.state.send_replace(ConnectionState::Disconnected);
        info!("Disconnected from {}", self.config.url);

        if let Some(hook) = &self.on_disconnected {
            hook();
        }

        if self.config.fail_pending_on_disconnect {
            let failed = self
                .pending
                .fail_waiters(|| RpcError::ConnectionClosed)
                .await;
            if failed > 0 {
                warn!("Failed {} pending calls after disconnect", failed);
            }
        }
    }

    async fn handle_text(self: &Arc<Self>, text: &str) {
        debug!("<- {}", text);
        let frame = match decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                return;
            }
        };

        match frame.body {
            FrameBody::Result(value) => self.deliver(frame.id, Ok(value)).await,
            FrameBody::Error(error) => self.deliver(frame.id, Err(error.into_error())).await,
            FrameBody::Call { method, params } => match frame.id {
                None => match &self.on_notification {
                    Some(hook) => hook(&method, params),
                    None => debug!("Ignoring notification {}", method),
                },
                Some(id) => self.serve_request(id, method, params),
            },
        }
    }

    async fn deliver(&self, id: Option<RequestId>, outcome: Result<Value>) {
        match id {
            Some(id) => {
                if !self.pending.resolve(id, outcome).await {
                    debug!("No pending call for response {}", id);
                }
            }
            None => match outcome {
                Err(e) => warn!("Server reported an uncorrelated error: {}", e),
                Ok(value) => debug!("Dropping uncorrelated result {}", value),
            },
        }
    }

    /// Answer a request the server addressed to this client.
    fn serve_request(self: &Arc<Self>, id: RequestId, method: String, params: Params) {
        let shared = self.clone();
        tokio::spawn(async move {
            let outcome = match &shared.router {
                Some(router) => router.call(&method, params).await,
                None => Err(RpcError::CannotFoundFunc {
                    name: method.clone(),
                }),
            };
            if let Err(e) = &outcome {
                error!("Serving {} for the server failed: {}", method, e);
            }

            match encode_response(Some(id), &outcome) {
                Ok(text) => {
                    if let Err(e) = shared.transmit(text).await {
                        warn!("Could not answer request {}: {}", id, e);
                    }
                }
                Err(e) => error!("Could not encode response {}: {}", id, e),
            }
        });
    }
}
