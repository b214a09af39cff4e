//! Allow/block list evaluation for unidle requests.
//!
//! Each list resolves at the first tier where one is configured: ingress
//! annotation, then namespace annotation, then the global lists. When a
//! block and an allow rule both match, the match at the more specific tier
//! wins; at the same tier the allow wins. With no configured policy at all
//! the request is allowed.

use std::collections::BTreeMap;

use regex::Regex;

use crate::keys;

/// Globally configured lists, loaded from files at startup. `None` means the
/// list is not configured at the global tier.
#[derive(Debug, Clone, Default)]
pub struct GlobalLists {
    pub allowed_ips: Option<Vec<String>>,
    pub blocked_ips: Option<Vec<String>>,
    pub allowed_agents: Option<Vec<String>>,
    pub blocked_agents: Option<Vec<String>>,
}

/// Where a list resolved; lower is more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Tier {
    Ingress,
    Namespace,
    Global,
}

/// Checks a user agent against a list of regex rules. An empty user agent
/// never matches; invalid expressions are skipped.
pub fn check_agents(agents: &[String], user_agent: &str) -> bool {
    if user_agent.is_empty() {
        return false;
    }
    agents.iter().any(|rule| match Regex::new(rule) {
        Ok(re) => re.is_match(user_agent),
        Err(e) => {
            log::warn!(target: "restrictions", "skipping invalid agent rule {:?}: {}", rule, e);
            false
        }
    })
}

/// Checks the caller's IPs against a list. `True-Client-IP` is preferred;
/// otherwise the whole `X-Forwarded-For` chain is tested.
pub fn check_ip_list(list: &[String], x_forwarded_for: &[String], true_client_ip: &str) -> bool {
    let client_ips: Vec<&str> = if true_client_ip.is_empty() {
        x_forwarded_for.iter().map(|ip| ip.trim()).collect()
    } else {
        vec![true_client_ip]
    };
    list.iter().any(|entry| client_ips.iter().any(|ip| entry == ip))
}

/// Resolves a list for `key` at the first tier where one is present.
fn resolve_list(
    ingress_annotations: &BTreeMap<String, String>,
    namespace_annotations: &BTreeMap<String, String>,
    global: Option<&[String]>,
    key: &str,
) -> Option<(Vec<String>, Tier)> {
    if let Some(raw) = ingress_annotations.get(key) {
        return Some((split_list(raw), Tier::Ingress));
    }
    if let Some(raw) = namespace_annotations.get(key) {
        return Some((split_list(raw), Tier::Namespace));
    }
    global.map(|list| (list.to_vec(), Tier::Global))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.trim().to_string()).collect()
}

/// Where a matching rule resolved, if any rule in the list matched.
fn matched_tier(
    resolved: Option<(Vec<String>, Tier)>,
    matches: impl Fn(&[String]) -> bool,
) -> Option<Tier> {
    resolved.and_then(|(list, tier)| matches(&list).then_some(tier))
}

fn decide(allowed: Option<Tier>, blocked: Option<Tier>) -> Option<bool> {
    match (allowed, blocked) {
        // block only loses to an allow at the same or a more specific tier
        (Some(allow), Some(block)) => Some(allow <= block),
        (Some(_), None) => Some(true),
        (None, Some(_)) => Some(false),
        (None, None) => None,
    }
}

/// Decides whether a request may trigger an unidle. Pure; callers count
/// their own metrics off the result.
pub fn check_access(
    ingress_annotations: &BTreeMap<String, String>,
    namespace_annotations: &BTreeMap<String, String>,
    global: &GlobalLists,
    user_agent: &str,
    true_client_ip: &str,
    x_forwarded_for: &[String],
) -> bool {
    let blocked_ip = matched_tier(
        resolve_list(
            ingress_annotations,
            namespace_annotations,
            global.blocked_ips.as_deref(),
            keys::IP_BLOCK_LIST,
        ),
        |list| check_ip_list(list, x_forwarded_for, true_client_ip),
    );
    let allowed_ip = matched_tier(
        resolve_list(
            ingress_annotations,
            namespace_annotations,
            global.allowed_ips.as_deref(),
            keys::IP_ALLOW_LIST,
        ),
        |list| check_ip_list(list, x_forwarded_for, true_client_ip),
    );
    if let Some(allow) = decide(allowed_ip, blocked_ip) {
        return allow;
    }

    let blocked_agent = matched_tier(
        resolve_list(
            ingress_annotations,
            namespace_annotations,
            global.blocked_agents.as_deref(),
            keys::BLOCKED_AGENTS,
        ),
        |list| check_agents(list, user_agent),
    );
    let allowed_agent = matched_tier(
        resolve_list(
            ingress_annotations,
            namespace_annotations,
            global.allowed_agents.as_deref(),
            keys::ALLOWED_AGENTS,
        ),
        |list| check_agents(list, user_agent),
    );
    decide(allowed_agent, blocked_agent).unwrap_or(true)
}
