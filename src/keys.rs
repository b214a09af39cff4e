//! Label and annotation keys used to track idling state on namespaces,
//! deployments and ingresses, plus small helpers for editing the sentinel
//! error-code list carried by the nginx ingress controller annotation.

use std::collections::BTreeMap;

/// Current label/annotation prefix.
pub const PREFIX: &str = "idling.snooze.dev";
/// Deprecated prefix still found on environments created by older releases.
pub const LEGACY_PREFIX: &str = "idling.snooze.io";

pub const WATCH: &str = "idling.snooze.dev/watch";
pub const IDLED: &str = "idling.snooze.dev/idled";
pub const FORCE_IDLED: &str = "idling.snooze.dev/force-idled";
pub const FORCE_SCALED: &str = "idling.snooze.dev/force-scaled";
pub const UNIDLE: &str = "idling.snooze.dev/unidle";

pub const IDLED_AT: &str = "idling.snooze.dev/idled-at";
pub const UNIDLE_REPLICAS: &str = "idling.snooze.dev/unidle-replicas";
pub const POD_INTERVAL: &str = "idling.snooze.dev/pod-interval";
pub const PROMETHEUS_INTERVAL: &str = "idling.snooze.dev/prometheus-interval";
pub const DISABLE_REQUEST_VERIFICATION: &str = "idling.snooze.dev/disable-request-verification";
pub const IP_ALLOW_LIST: &str = "idling.snooze.dev/ip-allow-list";
pub const IP_BLOCK_LIST: &str = "idling.snooze.dev/ip-block-list";
pub const ALLOWED_AGENTS: &str = "idling.snooze.dev/allowed-agents";
pub const BLOCKED_AGENTS: &str = "idling.snooze.dev/blocked-agents";

/// The nginx ingress controller annotation holding the comma separated list
/// of status codes served by the default backend.
pub const CUSTOM_HTTP_ERRORS: &str = "nginx.ingress.kubernetes.io/custom-http-errors";

/// The sentinel code surfaced by idled environments.
pub const SENTINEL_CODE: &str = "503";

/// Key suffixes that are migrated from [`LEGACY_PREFIX`] to [`PREFIX`].
/// Applied idempotently wherever current-generation keys are about to be read.
pub const LEGACY_LABEL_KEYS: &[&str] = &["watch", "idled", "force-idled", "force-scaled", "unidle"];
pub const LEGACY_ANNOTATION_KEYS: &[&str] = &[
    "idled-at",
    "unidle-replicas",
    "pod-interval",
    "prometheus-interval",
    "disable-request-verification",
    "ip-allow-list",
    "ip-block-list",
    "allowed-agents",
    "blocked-agents",
];

/// Builds the rename pairs (old key, new key) for a set of key suffixes.
pub fn legacy_renames(suffixes: &[&str]) -> Vec<(String, String)> {
    suffixes
        .iter()
        .map(|s| (format!("{}/{}", LEGACY_PREFIX, s), format!("{}/{}", PREFIX, s)))
        .collect()
}

/// Returns the first value found for `key` across an ordered list of
/// annotation maps. Used for the ingress -> namespace precedence lookups.
pub fn first_present<'a>(
    sources: &[&'a BTreeMap<String, String>],
    key: &str,
) -> Option<&'a String> {
    sources.iter().find_map(|m| m.get(key))
}

/// Interprets an annotation value as a boolean flag.
pub fn truthy(value: &str) -> bool {
    matches!(value, "1" | "t" | "T" | "true" | "TRUE" | "True")
}

/// Adds `code` to a comma separated code list, preserving existing entries.
/// Returns `None` when the code is already present and no patch is needed.
pub fn add_status_code(codes: Option<&str>, code: &str) -> Option<String> {
    match codes {
        None => Some(code.to_string()),
        Some(existing) => {
            if existing.split(',').any(|c| c.trim() == code) {
                return None;
            }
            if existing.trim().is_empty() {
                Some(code.to_string())
            } else {
                Some(format!("{},{}", existing, code))
            }
        }
    }
}

/// Removes `code` from a comma separated code list. Returns `None` when the
/// resulting list is empty, signalling the annotation should be dropped.
pub fn remove_status_code(codes: &str, code: &str) -> Option<String> {
    let remaining: Vec<&str> = codes.split(',').filter(|c| c.trim() != code).collect();
    if remaining.is_empty() {
        None
    } else {
        Some(remaining.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_code_to_existing_list() {
        assert_eq!(add_status_code(Some("404,500"), "503"), Some("404,500,503".to_string()));
    }

    #[test]
    fn add_code_is_idempotent() {
        assert_eq!(add_status_code(Some("404,503"), "503"), None);
        assert_eq!(add_status_code(Some("503"), "503"), None);
    }

    #[test]
    fn add_code_to_missing_annotation() {
        assert_eq!(add_status_code(None, "503"), Some("503".to_string()));
        assert_eq!(add_status_code(Some(""), "503"), Some("503".to_string()));
    }

    #[test]
    fn remove_code_keeps_other_codes() {
        assert_eq!(remove_status_code("404,503,500", "503"), Some("404,500".to_string()));
    }

    #[test]
    fn remove_last_code_drops_annotation() {
        assert_eq!(remove_status_code("503", "503"), None);
    }

    #[test]
    fn remove_missing_code_is_noop() {
        assert_eq!(remove_status_code("404,500", "503"), Some("404,500".to_string()));
    }

    #[test]
    fn precedence_lookup_returns_first_source() {
        let mut ingress = BTreeMap::new();
        ingress.insert("k".to_string(), "ingress".to_string());
        let mut namespace = BTreeMap::new();
        namespace.insert("k".to_string(), "namespace".to_string());
        namespace.insert("other".to_string(), "ns-only".to_string());

        assert_eq!(first_present(&[&ingress, &namespace], "k"), Some(&"ingress".to_string()));
        assert_eq!(first_present(&[&ingress, &namespace], "other"), Some(&"ns-only".to_string()));
        assert_eq!(first_present(&[&ingress, &namespace], "absent"), None);
    }

    #[test]
    fn truthy_values() {
        assert!(truthy("true"));
        assert!(truthy("1"));
        assert!(!truthy("false"));
        assert!(!truthy("0"));
        assert!(!truthy(""));
    }
}
