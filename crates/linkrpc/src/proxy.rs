//! Call proxies layered on the client and the server.
//!
//! Both proxies resolve a call in two steps, namespace then function, and
//! emit `"<prefix>.<namespace>.<function>"`:
//!
//! - [`DeviceProxy`] wraps an [`RpcClient`], uses the `dobotlink` prefix
//!   and waits for the correlated response.
//! - [`GuiProxy`] wraps an [`RpcServer`], uses the `gui` prefix and
//!   broadcasts a notification.
//!
//! ```rust,ignore
//! let magician = client.device_proxy().with_port_name("COM3");
//! let pose = magician.namespace("Magician").function("GetPose").call(Params::new()).await?;
//!
//! server.gui_proxy().namespace("Plugin").function("update").call(params).await?;
//! ```
//!
//! An optional [`Interface`] lists the functions each namespace offers;
//! calls outside it fail locally instead of reaching the wire.

use crate::client::RpcClient;
use crate::server::RpcServer;
use async_trait::async_trait;
use linkrpc_core::config::NamespaceConfig;
use linkrpc_core::{Params, Result, RpcError};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Where a proxy sends its calls.
#[async_trait]
pub trait ProxySink: Clone + Send + Sync + 'static {
    /// First segment of every emitted method path.
    const PREFIX: &'static str;

    /// Deliver one call. One-way sinks return `Value::Null`.
    async fn emit(&self, method: &str, params: Params) -> Result<Value>;

    /// Runtime used by the blocking calling convention.
    fn runtime(&self) -> &Handle;
}

#[async_trait]
impl ProxySink for RpcClient {
    const PREFIX: &'static str = NamespaceConfig::DOBOTLINK;

    async fn emit(&self, method: &str, params: Params) -> Result<Value> {
        self.send(method, params).await
    }

    fn runtime(&self) -> &Handle {
        RpcClient::runtime(self)
    }
}

#[async_trait]
impl ProxySink for RpcServer {
    const PREFIX: &'static str = NamespaceConfig::GUI;

    async fn emit(&self, method: &str, params: Params) -> Result<Value> {
        self.notify(method, params).await.map(|_| Value::Null)
    }

    fn runtime(&self) -> &Handle {
        RpcServer::runtime(self)
    }
}

/// Client-side proxy for device modules behind the relay.
pub type DeviceProxy = Proxy<RpcClient>;

/// Server-side proxy pushing notifications to front-end peers.
pub type GuiProxy = Proxy<RpcServer>;

/// Functions each namespace offers.
#[derive(Debug, Clone, Default)]
pub struct Interface {
    namespaces: HashMap<String, HashSet<String>>,
}

impl Interface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a namespace and its functions.
    pub fn namespace<I, S>(mut self, name: impl Into<String>, functions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces
            .entry(name.into())
            .or_default()
            .extend(functions.into_iter().map(Into::into));
        self
    }

    /// Check that `namespace.function` is declared.
    pub fn check(&self, namespace: &str, function: &str) -> Result<()> {
        let functions = self
            .namespaces
            .get(namespace)
            .ok_or_else(|| RpcError::CannotFoundModule {
                name: namespace.to_string(),
            })?;
        if functions.contains(function) {
            Ok(())
        } else {
            Err(RpcError::CannotFoundFunc {
                name: format!("{}.{}", namespace, function),
            })
        }
    }
}

/// Two-level call builder over a [`ProxySink`].
#[derive(Clone)]
pub struct Proxy<S> {
    sink: S,
    port_name: Option<String>,
    interface: Option<Arc<Interface>>,
}

impl<S: ProxySink> Proxy<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            port_name: None,
            interface: None,
        }
    }

    /// Merge `portName` into every call that does not set it itself.
    pub fn with_port_name(mut self, port_name: impl Into<String>) -> Self {
        self.port_name = Some(port_name.into());
        self
    }

    /// Restrict calls to the declared functions.
    pub fn with_interface(mut self, interface: Interface) -> Self {
        self.interface = Some(Arc::new(interface));
        self
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    /// Select a namespace.
    pub fn namespace(&self, name: impl Into<String>) -> NamespaceProxy<S> {
        NamespaceProxy {
            proxy: self.clone(),
            namespace: name.into(),
        }
    }

    /// Call `"<prefix>.<name>"` directly, bypassing the interface check.
    pub async fn invoke(&self, name: &str, params: Params) -> Result<Value> {
        let method = format!("{}.{}", S::PREFIX, name);
        self.sink.emit(&method, self.merge(params)).await
    }

    fn merge(&self, mut params: Params) -> Params {
        if let Some(port_name) = &self.port_name {
            params
                .entry(NamespaceConfig::PORT_NAME_PARAM)
                .or_insert_with(|| Value::String(port_name.clone()));
        }
        params
    }
}

/// A proxy bound to one namespace.
#[derive(Clone)]
pub struct NamespaceProxy<S> {
    proxy: Proxy<S>,
    namespace: String,
}

impl<S: ProxySink> NamespaceProxy<S> {
    /// Select a function.
    pub fn function(&self, name: impl Into<String>) -> RemoteFunction<S> {
        RemoteFunction {
            proxy: self.proxy.clone(),
            namespace: self.namespace.clone(),
            function: name.into(),
        }
    }

    /// Shorthand for `function(name).call(params)`.
    pub async fn call(&self, function: &str, params: Params) -> Result<Value> {
        self.function(function).call(params).await
    }

    pub fn name(&self) -> &str {
        &self.namespace
    }
}

/// A callable remote function.
#[derive(Clone)]
pub struct RemoteFunction<S> {
    proxy: Proxy<S>,
    namespace: String,
    function: String,
}

impl<S: ProxySink> RemoteFunction<S> {
    /// Full method path this function emits.
    pub fn method(&self) -> String {
        format!("{}.{}.{}", S::PREFIX, self.namespace, self.function)
    }

    /// Emit the call and wait for its outcome.
    pub async fn call(&self, params: Params) -> Result<Value> {
        if let Some(interface) = &self.proxy.interface {
            interface.check(&self.namespace, &self.function)?;
        }
        self.proxy
            .sink
            .emit(&self.method(), self.proxy.merge(params))
            .await
    }

    /// Blocking form of [`call`](Self::call) for threads that cannot await.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async execution context.
    pub fn call_blocking(&self, params: Params) -> Result<Value> {
        self.proxy.sink.runtime().block_on(self.call(params))
    }
}
