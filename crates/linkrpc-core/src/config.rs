//! Centralized protocol constants for linkrpc.
//!
//! Runtime knobs (addresses, backoff, ban lists) live in the client and
//! server config builders of the `linkrpc` crate; this module only holds
//! values both ends must agree on.

use std::time::Duration;

/// Wire-protocol configuration.
pub struct RpcConfig;

impl RpcConfig {
    /// Value of the `version` field on every envelope.
    pub const VERSION: &'static str = "2.0";
    /// Code used when an error carries no structured code of its own.
    pub const SYNTHETIC_ERROR_CODE: i64 = -32000;
}

/// Method path targets and well-known namespaces.
pub struct NamespaceConfig;

impl NamespaceConfig {
    /// Implicit target for two-segment paths.
    pub const VM_TARGET: &'static str = "vm";
    /// Relay target. Traffic addressed here is forwarded, not interpreted,
    /// so its names are never normalized.
    pub const DOBOTLINK: &'static str = "dobotlink";
    /// Prefix of notifications pushed to front-end peers.
    pub const GUI: &'static str = "gui";
    /// Parameter merged into device proxy calls when a port is selected.
    pub const PORT_NAME_PARAM: &'static str = "portName";
}

/// Connection timing.
pub struct ConnectionConfig;

impl ConnectionConfig {
    /// Fixed delay between reconnect attempts.
    pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
}
