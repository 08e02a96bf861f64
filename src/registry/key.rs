use crate::utils::error::{ConnPoolError, Result};
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use tracing::error;

/// Process-lifetime hash seed, initialized on first key derivation and stable
/// afterwards, so a given endpoint always lands in the same bucket.
static HASH_STATE: OnceLock<RandomState> = OnceLock::new();

/// Derive the 32-bit endpoint key for an IPv4 dotted-quad and port.
///
/// Parsing is strict: hostnames and malformed quads are rejected rather than
/// resolved.
pub fn endpoint_key(ip: &str, port: u16) -> Result<u32> {
    let addr: Ipv4Addr = ip.parse().map_err(|_| {
        error!("endpoint key error: null or invalid ip-tuple ({}:{})", ip, port);
        ConnPoolError::InvalidEndpoint(format!("{}:{}", ip, port))
    })?;
    Ok(hash_two_words(u32::from(addr), u32::from(port)))
}

fn hash_two_words(daddr: u32, port: u32) -> u32 {
    let state = HASH_STATE.get_or_init(RandomState::new);
    let mut hasher = state.build_hasher();
    (daddr, port).hash(&mut hasher);
    hasher.finish() as u32
}
