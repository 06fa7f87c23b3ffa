//! Method registry and resolver.
//!
//! The router keeps two registries: bare functions, addressed by
//! one-segment paths, and namespaces, addressed by two- and three-segment
//! paths. Handlers are invoked the same way whether they are synchronous
//! closures or return a future.
//!
//! # Example
//!
//! ```
//! use linkrpc_core::router::{MethodRouter, Module};
//! use serde_json::json;
//!
//! # tokio_test_block_on(async {
//! let router = MethodRouter::new();
//! router.register_fn("quit", |_| Ok(json!("bye"))).await;
//! router
//!     .register_namespace("plugin", Module::new().with_fn("status", |_| Ok(json!("idle"))))
//!     .await;
//!
//! assert_eq!(router.call("quit", Default::default()).await.unwrap(), json!("bye"));
//! assert_eq!(router.call("plugin.status", Default::default()).await.unwrap(), json!("idle"));
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     futures::executor::block_on(f)
//! # }
//! ```

use crate::config::NamespaceConfig;
use crate::method::{MethodPath, MethodTarget};
use crate::protocol::Params;
use crate::{Result, RpcError};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

type SyncFn = dyn Fn(Params) -> Result<Value> + Send + Sync;
type AsyncFn = dyn Fn(Params) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// A callable registered on the router.
#[derive(Clone)]
pub enum Handler {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

impl Handler {
    /// Wrap a synchronous closure.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Params) -> Result<Value> + Send + Sync + 'static,
    {
        Handler::Sync(Arc::new(f))
    }

    /// Wrap a closure returning a future.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Handler::Async(Arc::new(move |params| f(params).boxed()))
    }

    /// Invoke the handler, awaiting it if it is asynchronous.
    pub async fn invoke(&self, params: Params) -> Result<Value> {
        match self {
            Handler::Sync(f) => f(params),
            Handler::Async(f) => f(params).await,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Sync(_) => f.write_str("Handler::Sync"),
            Handler::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

/// A named group of handlers.
///
/// Implement this directly for namespaces that resolve members
/// dynamically (a relay forwarding any device module, for instance), or
/// use [`Module`] for a fixed table.
pub trait Namespace: Send + Sync {
    /// Resolve a callable member.
    fn function(&self, name: &str) -> Option<Handler>;

    /// Resolve a nested namespace. Only consulted for `dobotlink` paths.
    fn namespace(&self, _name: &str) -> Option<Arc<dyn Namespace>> {
        None
    }
}

/// Table-backed [`Namespace`].
#[derive(Default, Clone)]
pub struct Module {
    functions: HashMap<String, Handler>,
    children: HashMap<String, Arc<dyn Namespace>>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler.
    pub fn with_handler(mut self, name: impl Into<String>, handler: Handler) -> Self {
        self.functions.insert(name.into(), handler);
        self
    }

    /// Add a synchronous function.
    pub fn with_fn<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Params) -> Result<Value> + Send + Sync + 'static,
    {
        self.with_handler(name, Handler::sync(f))
    }

    /// Add an asynchronous function.
    pub fn with_async<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.with_handler(name, Handler::from_async(f))
    }

    /// Add a nested namespace.
    pub fn with_namespace(
        mut self,
        name: impl Into<String>,
        namespace: impl Namespace + 'static,
    ) -> Self {
        self.children.insert(name.into(), Arc::new(namespace));
        self
    }
}

impl Namespace for Module {
    fn function(&self, name: &str) -> Option<Handler> {
        self.functions.get(name).cloned()
    }

    fn namespace(&self, name: &str) -> Option<Arc<dyn Namespace>> {
        self.children.get(name).cloned()
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut functions: Vec<_> = self.functions.keys().collect();
        functions.sort();
        let mut children: Vec<_> = self.children.keys().collect();
        children.sort();
        f.debug_struct("Module")
            .field("functions", &functions)
            .field("children", &children)
            .finish()
    }
}

/// What a name is registered as.
pub enum Registration {
    Function(Handler),
    Namespace(Arc<dyn Namespace>),
}

impl From<Handler> for Registration {
    fn from(handler: Handler) -> Self {
        Registration::Function(handler)
    }
}

impl From<Module> for Registration {
    fn from(module: Module) -> Self {
        Registration::Namespace(Arc::new(module))
    }
}

impl From<Arc<dyn Namespace>> for Registration {
    fn from(namespace: Arc<dyn Namespace>) -> Self {
        Registration::Namespace(namespace)
    }
}

/// Registry mapping dotted method paths to handlers.
#[derive(Default)]
pub struct MethodRouter {
    functions: RwLock<HashMap<String, Handler>>,
    namespaces: RwLock<HashMap<String, Arc<dyn Namespace>>>,
}

impl MethodRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function or a namespace under `name`, replacing any
    /// previous registration of the same kind.
    pub async fn register(&self, name: impl Into<String>, registration: impl Into<Registration>) {
        let name = name.into();
        match registration.into() {
            Registration::Function(handler) => {
                debug!("Registering function {}", name);
                self.functions.write().await.insert(name, handler);
            }
            Registration::Namespace(namespace) => {
                debug!("Registering namespace {}", name);
                self.namespaces.write().await.insert(name, namespace);
            }
        }
    }

    /// Register a synchronous bare function.
    pub async fn register_fn<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Params) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(name, Handler::sync(f)).await;
    }

    /// Register an asynchronous bare function.
    pub async fn register_async<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(name, Handler::from_async(f)).await;
    }

    /// Register a namespace object.
    pub async fn register_namespace(
        &self,
        name: impl Into<String>,
        namespace: impl Namespace + 'static,
    ) {
        let namespace: Arc<dyn Namespace> = Arc::new(namespace);
        self.register(name, namespace).await;
    }

    /// Evict a namespace registration. Returns whether one was present.
    pub async fn remove(&self, name: &str) -> bool {
        self.namespaces.write().await.remove(name).is_some()
    }

    pub async fn has_function(&self, name: &str) -> bool {
        self.functions.read().await.contains_key(name)
    }

    /// Names of all registered namespaces, sorted.
    pub async fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a path to its handler without invoking it.
    pub async fn resolve(&self, path: &MethodPath) -> Result<Handler> {
        match path {
            MethodPath::Bare(name) => self
                .functions
                .read()
                .await
                .get(name)
                .cloned()
                .ok_or_else(|| RpcError::CannotFoundFunc { name: name.clone() }),
            MethodPath::Namespaced {
                target,
                namespace,
                function,
            } => {
                let owner = match target {
                    MethodTarget::Vm => self.lookup_namespace(namespace).await?,
                    MethodTarget::Dobotlink => self
                        .lookup_namespace(NamespaceConfig::DOBOTLINK)
                        .await?
                        .namespace(namespace)
                        .ok_or_else(|| RpcError::CannotFoundModule {
                            name: format!("{}.{}", NamespaceConfig::DOBOTLINK, namespace),
                        })?,
                };
                owner
                    .function(function)
                    .ok_or_else(|| RpcError::CannotFoundFunc {
                        name: path.to_string(),
                    })
            }
        }
    }

    /// Resolve `path` and invoke the handler with `params`.
    ///
    /// Handler errors are returned unchanged.
    pub async fn call(&self, path: &str, params: Params) -> Result<Value> {
        let path = MethodPath::parse(path)?;
        let handler = self.resolve(&path).await?;
        debug!("Invoking {} ({:?})", path, handler);
        handler.invoke(params).await
    }

    async fn lookup_namespace(&self, name: &str) -> Result<Arc<dyn Namespace>> {
        self.namespaces
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::CannotFoundModule {
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    async fn test_router() -> MethodRouter {
        let router = MethodRouter::new();
        router.register_fn("quit", |_| Ok(json!("bye"))).await;
        router
            .register_namespace(
                "plugin",
                Module::new()
                    .with_fn("echo", |p| Ok(Value::Object(p)))
                    .with_async("slow_add", |p| async move {
                        let a = p.get("a").and_then(Value::as_i64).unwrap_or(0);
                        let b = p.get("b").and_then(Value::as_i64).unwrap_or(0);
                        Ok(json!(a + b))
                    }),
            )
            .await;
        router
            .register_namespace(
                "dobotlink",
                Module::new().with_namespace(
                    "Magician",
                    Module::new().with_fn("GetPose", |p| {
                        Ok(json!({"port": p.get("portName").cloned(), "x": 200.0}))
                    }),
                ),
            )
            .await;
        router
    }

    #[tokio::test]
    async fn test_bare_function() {
        let router = test_router().await;
        assert_eq!(router.call("quit", Params::new()).await.unwrap(), json!("bye"));
    }

    #[tokio::test]
    async fn test_bare_function_missing() {
        let router = test_router().await;
        let err = router.call("reboot", Params::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::CannotFoundFunc { .. }));
    }

    #[tokio::test]
    async fn test_two_segment_sync_and_async() {
        let router = test_router().await;
        let echoed = router
            .call("plugin.echo", params(json!({"k": 1})))
            .await
            .unwrap();
        assert_eq!(echoed, json!({"k": 1}));

        let sum = router
            .call("plugin.slow_add", params(json!({"a": 2, "b": 5})))
            .await
            .unwrap();
        assert_eq!(sum, json!(7));
    }

    #[tokio::test]
    async fn test_explicit_vm_target() {
        let router = test_router().await;
        let echoed = router.call("vm.plugin.echo", params(json!({"k": 2}))).await.unwrap();
        assert_eq!(echoed, json!({"k": 2}));
    }

    #[tokio::test]
    async fn test_missing_module() {
        let router = test_router().await;
        let err = router.call("camera.start", Params::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::CannotFoundModule { name } if name == "camera"));
    }

    #[tokio::test]
    async fn test_missing_member() {
        let router = test_router().await;
        let err = router.call("plugin.nothing", Params::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::CannotFoundFunc { .. }));
    }

    #[tokio::test]
    async fn test_dobotlink_nested_lookup() {
        let router = test_router().await;
        let pose = router
            .call("dobotlink.Magician.GetPose", params(json!({"portName": "COM3"})))
            .await
            .unwrap();
        assert_eq!(pose, json!({"port": "COM3", "x": 200.0}));

        let err = router
            .call("dobotlink.M1.GetPose", Params::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::CannotFoundModule { .. }));
    }

    #[tokio::test]
    async fn test_dobotlink_unregistered() {
        let router = MethodRouter::new();
        let err = router
            .call("dobotlink.Magician.GetPose", Params::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::CannotFoundModule { name } if name == "dobotlink"));
    }

    #[tokio::test]
    async fn test_invalid_formats() {
        let router = test_router().await;
        for path in ["", "a.b.c.d", "gui.plugin.echo"] {
            let err = router.call(path, Params::new()).await.unwrap_err();
            assert!(matches!(err, RpcError::InvalidMethodFormat { .. }), "{path:?}");
        }
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let router = MethodRouter::new();
        router
            .register_fn("fail", |_| Err(RpcError::handler("motor stalled")))
            .await;
        let err = router.call("fail", Params::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "motor stalled");
    }

    #[tokio::test]
    async fn test_remove_namespace() {
        let router = test_router().await;
        assert_eq!(router.namespaces().await, vec!["dobotlink", "plugin"]);
        assert!(router.remove("plugin").await);
        assert!(!router.remove("plugin").await);
        let err = router.call("plugin.echo", Params::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::CannotFoundModule { .. }));
    }

    struct CountingRelay {
        calls: Arc<AtomicUsize>,
    }

    impl Namespace for CountingRelay {
        fn function(&self, _name: &str) -> Option<Handler> {
            None
        }

        fn namespace(&self, name: &str) -> Option<Arc<dyn Namespace>> {
            let calls = self.calls.clone();
            let device = name.to_string();
            Some(Arc::new(Module::new().with_fn("GetPose", move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"device": device}))
            })))
        }
    }

    #[tokio::test]
    async fn test_dynamic_namespace() {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = MethodRouter::new();
        router
            .register_namespace("dobotlink", CountingRelay { calls: calls.clone() })
            .await;

        let result = router
            .call("dobotlink.MagicianLite.GetPose", Params::new())
            .await
            .unwrap();
        assert_eq!(result, json!({"device": "MagicianLite"}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
