//! linkrpc core - transport-free pieces of the linkrpc JSON-RPC link.
//!
//! This crate holds everything both ends of a link share and that needs no
//! socket: the envelope codec, the method path grammar, name
//! normalization and the method router. The WebSocket client, server and
//! call proxies live in the `linkrpc` crate.
//!
//! # Example
//!
//! ```rust
//! use linkrpc_core::protocol::{decode, encode_request, FrameBody, Params};
//!
//! let text = encode_request(Some(1), "quit", &Params::new()).unwrap();
//! let frame = decode(&text).unwrap();
//! assert_eq!(frame.id, Some(1));
//! assert!(matches!(frame.body, FrameBody::Call { .. }));
//! ```

pub mod config;
pub mod error;
pub mod method;
pub mod naming;
pub mod protocol;
pub mod router;

// Re-export commonly used types
pub use config::{ConnectionConfig, NamespaceConfig, RpcConfig};
pub use error::{ErrorKind, Result, RpcError};
pub use method::{MethodPath, MethodTarget};
pub use protocol::{ErrorObject, Frame, FrameBody, Params, RequestId};
pub use router::{Handler, MethodRouter, Module, Namespace, Registration};
