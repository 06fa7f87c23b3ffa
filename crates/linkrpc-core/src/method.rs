//! Dotted method paths.
//!
//! Grammar: `function`, `namespace.function` or `target.namespace.function`,
//! where `target` is `vm` (the default for two segments) or `dobotlink`.

use crate::config::NamespaceConfig;
use crate::{Result, RpcError};
use std::fmt;
use std::str::FromStr;

/// Where a namespaced call is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodTarget {
    /// Namespaces registered directly on the router.
    Vm,
    /// Device modules nested under the registered `dobotlink` namespace.
    Dobotlink,
}

impl MethodTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodTarget::Vm => NamespaceConfig::VM_TARGET,
            MethodTarget::Dobotlink => NamespaceConfig::DOBOTLINK,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            NamespaceConfig::VM_TARGET => Some(MethodTarget::Vm),
            NamespaceConfig::DOBOTLINK => Some(MethodTarget::Dobotlink),
            _ => None,
        }
    }
}

impl fmt::Display for MethodTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed method path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodPath {
    Bare(String),
    Namespaced {
        target: MethodTarget,
        namespace: String,
        function: String,
    },
}

impl MethodPath {
    /// Parse a dotted path of one to three non-empty segments.
    pub fn parse(path: &str) -> Result<Self> {
        let invalid = || RpcError::InvalidMethodFormat {
            path: path.to_string(),
        };

        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid());
        }

        match segments.as_slice() {
            [function] => Ok(MethodPath::Bare(function.to_string())),
            [namespace, function] => Ok(MethodPath::Namespaced {
                target: MethodTarget::Vm,
                namespace: namespace.to_string(),
                function: function.to_string(),
            }),
            [target, namespace, function] => {
                let target = MethodTarget::parse(target).ok_or_else(invalid)?;
                Ok(MethodPath::Namespaced {
                    target,
                    namespace: namespace.to_string(),
                    function: function.to_string(),
                })
            }
            _ => Err(invalid()),
        }
    }

    /// The function name, whatever the shape of the path.
    pub fn function(&self) -> &str {
        match self {
            MethodPath::Bare(function) | MethodPath::Namespaced { function, .. } => function,
        }
    }
}

impl FromStr for MethodPath {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        MethodPath::parse(s)
    }
}

impl fmt::Display for MethodPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodPath::Bare(function) => f.write_str(function),
            MethodPath::Namespaced {
                target: MethodTarget::Vm,
                namespace,
                function,
            } => write!(f, "{namespace}.{function}"),
            MethodPath::Namespaced {
                target,
                namespace,
                function,
            } => write!(f, "{target}.{namespace}.{function}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parse() {
        assert_eq!(MethodTarget::parse("vm"), Some(MethodTarget::Vm));
        assert_eq!(MethodTarget::parse("dobotlink"), Some(MethodTarget::Dobotlink));
        assert_eq!(MethodTarget::parse("gui"), None);
        assert_eq!(MethodTarget::Dobotlink.to_string(), "dobotlink");
    }

    #[test]
    fn test_parse_bare() {
        assert_eq!(MethodPath::parse("quit").unwrap(), MethodPath::Bare("quit".into()));
    }

    #[test]
    fn test_parse_two_segments_defaults_to_vm() {
        assert_eq!(
            MethodPath::parse("plugin.start").unwrap(),
            MethodPath::Namespaced {
                target: MethodTarget::Vm,
                namespace: "plugin".into(),
                function: "start".into(),
            }
        );
    }

    #[test]
    fn test_parse_three_segments() {
        let path: MethodPath = "dobotlink.Magician.GetPose".parse().unwrap();
        assert_eq!(
            path,
            MethodPath::Namespaced {
                target: MethodTarget::Dobotlink,
                namespace: "Magician".into(),
                function: "GetPose".into(),
            }
        );
        assert_eq!(path.function(), "GetPose");
        assert_eq!(path.to_string(), "dobotlink.Magician.GetPose");

        let path = MethodPath::parse("vm.plugin.start").unwrap();
        assert_eq!(path.to_string(), "plugin.start");
    }

    #[test]
    fn test_parse_invalid_formats() {
        for path in ["", "a.b.c.d", "other.plugin.start", "a..b", ".quit", "quit."] {
            let err = MethodPath::parse(path).unwrap_err();
            assert!(
                matches!(err, RpcError::InvalidMethodFormat { .. }),
                "{path:?} should be rejected"
            );
        }
    }
}
