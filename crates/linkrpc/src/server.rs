//! WebSocket RPC server.
//!
//! Binds a TCP listener and upgrades requests on the configured path to
//! WebSocket connections. Every admitted peer gets its own receive loop;
//! each inbound call is dispatched into the [`MethodRouter`] on its own
//! task, so a slow handler never holds up the loop or other calls.
//! Responses are matched to calls by id and may leave out of order.
//!
//! # Thread Safety
//!
//! The peer set is behind a tokio mutex and is only touched on admission,
//! removal and broadcast. Outbound frames go through one writer task per
//! peer.

use crate::proxy::{GuiProxy, Proxy};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{FutureExt, SinkExt, StreamExt};
use linkrpc_core::naming::normalize_call;
use linkrpc_core::protocol::{decode, encode_request, encode_response, FrameBody};
use linkrpc_core::{MethodRouter, Params, RequestId, Result, RpcError};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Hook run with the address of a peer that connected or disconnected.
pub type PeerHook = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Port to bind; 0 lets the OS pick one.
    pub port: u16,
    /// HTTP path that accepts WebSocket upgrades.
    pub path: String,
    /// Source addresses refused at connect time.
    pub banned: HashSet<IpAddr>,
    /// Refuse new peers beyond this many.
    pub max_peers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            path: "/".to_string(),
            banned: HashSet::new(),
            max_peers: None,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn ban(mut self, addr: IpAddr) -> Self {
        self.banned.insert(addr);
        self
    }

    pub fn with_max_peers(mut self, max: usize) -> Self {
        self.max_peers = Some(max);
        self
    }
}

/// Builder for [`RpcServer`].
pub struct RpcServerBuilder {
    config: ServerConfig,
    router: Arc<MethodRouter>,
    on_connected: Option<PeerHook>,
    on_disconnected: Option<PeerHook>,
}

impl RpcServerBuilder {
    pub fn on_connected(mut self, hook: impl Fn(SocketAddr) + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(hook));
        self
    }

    pub fn on_disconnected(mut self, hook: impl Fn(SocketAddr) + Send + Sync + 'static) -> Self {
        self.on_disconnected = Some(Arc::new(hook));
        self
    }

    /// Bind the listener and start serving in background tasks.
    ///
    /// Fails with [`RpcError::ListenerOccupied`] when the address is taken.
    pub async fn start(self) -> Result<RpcServer> {
        let target = format!("{}:{}", self.config.host, self.config.port);
        let addr: SocketAddr = target
            .parse()
            .map_err(|e| RpcError::InvalidAddress(format!("{}: {}", target, e)))?;

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                return Err(RpcError::ListenerOccupied { addr });
            }
            Err(e) => return Err(e.into()),
        };
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let path = self.config.path.clone();
        let shared = Arc::new(ServerShared {
            config: self.config,
            router: self.router,
            peers: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
            on_connected: self.on_connected,
            on_disconnected: self.on_disconnected,
            shutdown: shutdown_rx.clone(),
        });

        let app = Router::new()
            .route(&path, get(handle_upgrade))
            .with_state(shared.clone());

        info!("RPC server listening on ws://{}{}", local_addr, path);

        let mut serve_shutdown = shutdown_rx;
        let task = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = serve_shutdown.wait_for(|stop| *stop).await;
            })
            .await;

            if let Err(e) = result {
                error!("RPC server error: {}", e);
            }
        });

        Ok(RpcServer {
            shared,
            local_addr,
            runtime: Handle::current(),
            guard: Arc::new(ServerGuard {
                shutdown_tx,
                task: Some(task),
            }),
        })
    }
}

/// Handle to a running server. Clones share it; dropping the last clone
/// shuts it down.
#[derive(Clone)]
pub struct RpcServer {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    runtime: Handle,
    guard: Arc<ServerGuard>,
}

struct ServerGuard {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Peer {
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<Message>,
}

struct ServerShared {
    config: ServerConfig,
    router: Arc<MethodRouter>,
    peers: Mutex<HashMap<u64, Peer>>,
    next_peer: AtomicU64,
    on_connected: Option<PeerHook>,
    on_disconnected: Option<PeerHook>,
    shutdown: watch::Receiver<bool>,
}

impl RpcServer {
    /// Start configuring a server that dispatches into `router`.
    pub fn builder(config: ServerConfig, router: Arc<MethodRouter>) -> RpcServerBuilder {
        RpcServerBuilder {
            config,
            router,
            on_connected: None,
            on_disconnected: None,
        }
    }

    /// Start a server with no hooks.
    pub async fn start(config: ServerConfig, router: Arc<MethodRouter>) -> Result<Self> {
        Self::builder(config, router).start().await
    }

    /// Broadcast a one-way call to every connected peer.
    ///
    /// Does nothing when no peer is connected.
    pub async fn notify(&self, method: &str, params: Params) -> Result<()> {
        let peers = self.shared.peers.lock().await;
        if peers.is_empty() {
            debug!("No peers connected, dropping notification {}", method);
            return Ok(());
        }

        let text = encode_request(None, method, &params)?;
        debug!("-> * {}", text);
        for peer in peers.values() {
            if peer.tx.send(Message::Text(text.clone())).is_err() {
                debug!("Peer {} is closing, notification skipped", peer.addr);
            }
        }
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients can connect to.
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.local_addr, self.shared.config.path)
    }

    pub fn router(&self) -> &Arc<MethodRouter> {
        &self.shared.router
    }

    pub async fn peer_count(&self) -> usize {
        self.shared.peers.lock().await.len()
    }

    /// Addresses of connected peers, sorted.
    pub async fn peer_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self
            .shared
            .peers
            .lock()
            .await
            .values()
            .map(|peer| peer.addr)
            .collect();
        addrs.sort();
        addrs
    }

    /// Stop accepting connections and end every peer loop.
    pub fn shutdown(&self) {
        info!("RPC server on {} shutting down", self.local_addr);
        let _ = self.guard.shutdown_tx.send(true);
    }

    /// Proxy pushing notifications to front-end peers.
    pub fn gui_proxy(&self) -> GuiProxy {
        Proxy::new(self.clone())
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }
}

async fn handle_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(shared): State<Arc<ServerShared>>,
) -> Response {
    ws.on_upgrade(move |socket| async move { shared.handle_socket(socket, addr).await })
}

impl ServerShared {
    /// Reason to turn `addr` away, if any.
    /// Check the ban list and the peer cap, and join the peer set if both
    /// allow it. The cap check and the insert share one lock.
    async fn admit(
        &self,
        addr: SocketAddr,
        tx: &mpsc::UnboundedSender<Message>,
    ) -> std::result::Result<u64, String> {
        if self.config.banned.contains(&addr.ip()) {
            return Err(format!("connection refused: {} is banned", addr.ip()));
        }

        let mut peers = self.peers.lock().await;
        if let Some(max) = self.config.max_peers {
            if peers.len() >= max {
                return Err(format!("connection refused: server full ({} peers)", max));
            }
        }
        let peer_id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        peers.insert(
            peer_id,
            Peer {
                addr,
                tx: tx.clone(),
            },
        );
        Ok(peer_id)
    }

    async fn handle_socket(self: Arc<Self>, mut socket: WebSocket, addr: SocketAddr) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let peer_id = match self.admit(addr, &tx).await {
            Ok(peer_id) => peer_id,
            Err(reason) => {
                warn!("Rejecting peer {}: {}", addr, reason);
                let _ = socket.send(Message::Text(reason)).await;
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        };

        let (mut sink, mut source) = socket.split();

        // Handler tasks can outlive the peer; stop at the first Close frame.
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!("Write to {} failed: {}", addr, e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        info!("Peer {} connected", addr);
        if let Some(hook) = &self.on_connected {
            hook(addr);
        }

        let mut shutdown = self.shutdown.clone();
        loop {
            let next = tokio::select! {
                next = source.next() => next,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };

            match next {
                Some(Ok(Message::Text(text))) => self.handle_text(&text, addr, &tx),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Binary(_))) => debug!("Ignoring binary frame from {}", addr),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Receive from {} failed: {}", addr, e);
                    break;
                }
            }
        }

        self.peers.lock().await.remove(&peer_id);
        let _ = tx.send(Message::Close(None));
        info!("Peer {} disconnected", addr);
        if let Some(hook) = &self.on_disconnected {
            hook(addr);
        }
    }

    /// Decode one frame and dispatch it. Never ends the receive loop.
    fn handle_text(&self, text: &str, addr: SocketAddr, tx: &mpsc::UnboundedSender<Message>) {
        debug!("<- {}: {}", addr, text);
        let frame = match decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Bad frame from {}: {}", addr, e);
                send_response(tx, None, &Err(e));
                return;
            }
        };

        let (method, params) = match frame.body {
            FrameBody::Call { method, params } => normalize_call(&method, params),
            FrameBody::Result(_) | FrameBody::Error(_) => {
                debug!("Ignoring response {:?} from {}", frame.id, addr);
                return;
            }
        };

        let id = frame.id;
        let router = self.router.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(router.call(&method, params))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(RpcError::handler(panic_message(panic.as_ref()))));

            match &outcome {
                Err(e) => {
                    error!("Call {} from {} failed: {}", method, addr, e);
                    send_response(&tx, id, &outcome);
                }
                Ok(_) if id.is_some() => send_response(&tx, id, &outcome),
                Ok(_) => {}
            }
        });
    }
}

fn send_response(
    tx: &mpsc::UnboundedSender<Message>,
    id: Option<RequestId>,
    outcome: &Result<serde_json::Value>,
) {
    match encode_response(id, outcome) {
        Ok(text) => {
            debug!("-> {}", text);
            let _ = tx.send(Message::Text(text));
        }
        Err(e) => error!("Could not encode response {:?}: {}", id, e),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shared(config: ServerConfig) -> Arc<ServerShared> {
        let (_, shutdown) = watch::channel(false);
        Arc::new(ServerShared {
            config,
            router: Arc::new(MethodRouter::new()),
            peers: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
            on_connected: None,
            on_disconnected: None,
            shutdown,
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_peer_cap_holds_under_concurrent_admission() {
        let shared = shared(ServerConfig::new().with_max_peers(2));
        let (tx, _rx) = mpsc::unbounded_channel::<Message>();

        let attempts = (0..16u16).map(|port| {
            let shared = shared.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let addr = SocketAddr::from(([127, 0, 0, 1], 40000 + port));
                shared.admit(addr, &tx).await
            })
        });
        let outcomes = futures::future::join_all(attempts).await;

        let admitted = outcomes
            .into_iter()
            .filter(|outcome| matches!(outcome, Ok(Ok(_))))
            .count();
        assert_eq!(admitted, 2);
        assert_eq!(shared.peers.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_banned_address_is_not_admitted() {
        let banned = SocketAddr::from(([10, 0, 0, 7], 5000));
        let shared = shared(ServerConfig::new().ban(banned.ip()));
        let (tx, _rx) = mpsc::unbounded_channel::<Message>();

        let reason = shared.admit(banned, &tx).await.unwrap_err();
        assert!(reason.contains("banned"), "{reason}");
        assert!(shared.peers.lock().await.is_empty());

        let other = SocketAddr::from(([10, 0, 0, 8], 5000));
        assert_eq!(shared.admit(other, &tx).await, Ok(1));
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let server = RpcServer::start(ServerConfig::new(), Arc::new(MethodRouter::new()))
            .await
            .unwrap();

        assert!(server.local_addr().port() > 0);
        assert_eq!(server.local_addr().ip(), std::net::Ipv4Addr::LOCALHOST);
        assert!(server.url().starts_with("ws://127.0.0.1:"));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_notify_without_peers_is_noop() {
        let server = RpcServer::start(ServerConfig::new(), Arc::new(MethodRouter::new()))
            .await
            .unwrap();

        assert_eq!(server.peer_count().await, 0);
        let params = match json!({"state": "idle"}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        server.notify("gui.Plugin.update", params).await.unwrap();
        assert_eq!(server.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_occupied_port_is_reported() {
        let first = RpcServer::start(ServerConfig::new(), Arc::new(MethodRouter::new()))
            .await
            .unwrap();

        let config = ServerConfig::new().with_port(first.local_addr().port());
        let result = RpcServer::start(config, Arc::new(MethodRouter::new())).await;
        assert!(matches!(result, Err(RpcError::ListenerOccupied { .. })));
    }

    #[tokio::test]
    async fn test_invalid_host_is_reported() {
        let config = ServerConfig::new().with_host("not a host");
        let result = RpcServer::start(config, Arc::new(MethodRouter::new())).await;
        assert!(matches!(result, Err(RpcError::InvalidAddress(_))));
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "handler panicked: boom");
        let boxed: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "handler panicked");
    }
}
