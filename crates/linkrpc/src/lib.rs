//! linkrpc - bidirectional JSON-RPC 2.0 over WebSocket.
//!
//! A process runs an [`RpcServer`] for its front end, an [`RpcClient`]
//! towards a device relay, or both. Inbound calls on either side are
//! dispatched through a shared [`MethodRouter`]; outbound calls go through
//! the client and server directly or through the [`DeviceProxy`] and
//! [`GuiProxy`] call builders.
//!
//! # Example
//!
//! ```rust,no_run
//! use linkrpc::{ClientConfig, MethodRouter, Module, Params, RpcClient, RpcServer, ServerConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> linkrpc::Result<()> {
//!     let router = Arc::new(MethodRouter::new());
//!     router
//!         .register_namespace("plugin", Module::new().with_fn("status", |_| Ok(json!("idle"))))
//!         .await;
//!
//!     let server = RpcServer::start(ServerConfig::new().with_port(9090), router).await?;
//!
//!     let client = RpcClient::connect(ClientConfig::new(server.url()))?;
//!     client.wait_connected().await?;
//!     let status = client.send("plugin.status", Params::new()).await?;
//!     println!("plugin is {}", status);
//!
//!     server.shutdown();
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod pending;
pub mod proxy;
pub mod server;

pub use client::{ClientConfig, ConnectionState, RpcClient, RpcClientBuilder};
pub use pending::{CorrelationTable, FeedbackCallback};
pub use proxy::{DeviceProxy, GuiProxy, Interface, Proxy, ProxySink, RemoteFunction};
pub use server::{RpcServer, RpcServerBuilder, ServerConfig};

// Re-export the transport-free core
pub use linkrpc_core::{
    ErrorKind, ErrorObject, Handler, MethodPath, MethodRouter, Module, Namespace, Params,
    RequestId, Result, RpcError,
};
