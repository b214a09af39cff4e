//! Request verification for unidling.
//!
//! When enabled, an unidle is only honoured once the client echoes back the
//! HMAC of the namespace name. The unidle page embeds the expected verifier
//! so a browser's refresh loop passes on the second round trip, while
//! single-shot crawlers never do.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::keys;

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length
    HmacSha256::new_from_slice(secret).expect("hmac key of any length")
}

/// hex(HMAC-SHA256(secret, namespace))
pub fn sign(namespace: &str, secret: &[u8]) -> String {
    let mut m = mac(secret);
    m.update(namespace.as_bytes());
    hex::encode(m.finalize().into_bytes())
}

/// Constant-time check of a caller-supplied verifier.
pub fn verify(namespace: &str, supplied: &str, secret: &[u8]) -> bool {
    let Ok(raw) = hex::decode(supplied) else {
        return false;
    };
    let mut m = mac(secret);
    m.update(namespace.as_bytes());
    m.verify_slice(&raw).is_ok()
}

/// Evaluates verification for a request. Returns the expected verifier (empty
/// when verification does not apply) and whether the request is verified.
/// Disable annotations are honoured at the ingress tier first, then the
/// namespace tier.
pub fn verify_request(
    enabled: bool,
    secret: &str,
    namespace: &str,
    ingress_annotations: &BTreeMap<String, String>,
    namespace_annotations: &BTreeMap<String, String>,
    supplied: Option<&str>,
) -> (String, bool) {
    if !enabled {
        return (String::new(), true);
    }
    let disabled = keys::first_present(
        &[ingress_annotations, namespace_annotations],
        keys::DISABLE_REQUEST_VERIFICATION,
    )
    .map(|v| keys::truthy(v))
    .unwrap_or(false);
    if disabled {
        return (String::new(), true);
    }
    let expected = sign(namespace, secret.as_bytes());
    let verified = supplied.map(|s| verify(namespace, s, secret.as_bytes())).unwrap_or(false);
    (expected, verified)
}
