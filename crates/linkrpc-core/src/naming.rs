//! Name normalization for inbound calls.
//!
//! Front-end callers address methods and parameters in camelCase, local
//! handlers are registered in snake_case. Paths under the `dobotlink`
//! target are relayed verbatim and never rewritten.

use crate::config::NamespaceConfig;
use crate::protocol::Params;
use regex::Regex;
use std::sync::LazyLock;

/// Any character followed by a capitalized word (`PTPCmd` -> `PTP_Cmd`).
static CAPITALIZED_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(.)([A-Z][a-z]+)").unwrap());

/// Lower-case letter or digit followed by an upper-case letter.
static LOWER_UPPER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([a-z0-9])([A-Z])").unwrap());

/// Convert one identifier from mixed case to snake_case.
///
/// # Examples
///
/// ```
/// use linkrpc_core::naming::to_snake_case;
///
/// assert_eq!(to_snake_case("setPTPCmd"), "set_ptp_cmd");
/// assert_eq!(to_snake_case("SomeModule"), "some_module");
/// assert_eq!(to_snake_case("already_snake"), "already_snake");
/// ```
pub fn to_snake_case(name: &str) -> String {
    let pass = CAPITALIZED_WORD.replace_all(name, "${1}_${2}");
    LOWER_UPPER.replace_all(&pass, "${1}_${2}").to_lowercase()
}

/// Whether a method path is relayed without normalization.
pub fn is_relayed(method: &str) -> bool {
    method.split('.').next() == Some(NamespaceConfig::DOBOTLINK)
}

/// Normalize every segment of a dotted method path.
pub fn normalize_method(method: &str) -> String {
    if is_relayed(method) {
        return method.to_string();
    }
    method
        .split('.')
        .map(to_snake_case)
        .collect::<Vec<_>>()
        .join(".")
}

/// Normalize the top-level keys of a call's parameters.
pub fn normalize_params(params: Params) -> Params {
    params
        .into_iter()
        .map(|(key, value)| (to_snake_case(&key), value))
        .collect()
}

/// Normalize an inbound call unless it is addressed to the relay.
pub fn normalize_call(method: &str, params: Params) -> (String, Params) {
    if is_relayed(method) {
        (method.to_string(), params)
    } else {
        (normalize_method(method), normalize_params(params))
    }
}
