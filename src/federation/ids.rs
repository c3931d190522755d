//! Locally minted global identifiers
//!
//! Ids have the shape `<base-url>/ap/<lowercased-type>/<key>` where the key
//! is 32 hex characters drawn from the OS random source.

use rand::RngCore;
use rand::rngs::OsRng;

/// Mint a fresh global id for an entity of `ap_type`.
pub fn mint_ap_id(base_url: &str, ap_type: &str) -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    let key: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}/ap/{}/{}",
        base_url.trim_end_matches('/'),
        ap_type.to_ascii_lowercase(),
        key
    )
}

/// Path prefix local ids are minted under.
pub fn local_prefix(base_url: &str) -> String {
    format!("{}/ap/", base_url.trim_end_matches('/'))
}

/// Whether `ap_id` was minted by this instance.
pub fn is_local_id(base_url: &str, ap_id: &str) -> bool {
    ap_id.starts_with(&local_prefix(base_url))
}

/// Split a local id into `(lowercased type, key)`.
pub fn split_local_id<'a>(base_url: &str, ap_id: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = ap_id.strip_prefix(&local_prefix(base_url))?;
    let (kind, key) = rest.split_once('/')?;
    if kind.is_empty() || key.is_empty() || key.contains('/') {
        return None;
    }
    Some((kind, key))
}

/// Routing key of an id: its last non-empty path segment.
pub fn ap_key(ap_id: &str) -> Option<&str> {
    let path = ap_id.split(['?', '#']).next()?;
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|key| !key.is_empty() && !key.contains(':'))
}
