//! Small helpers shared across providers.

use std::net::TcpListener;

use rand::Rng;
use rand::distributions::Alphanumeric;
use sha2::{Digest, Sha256};

/// Find a free local TCP port in `[lower, upper)` by bind-probing loopback.
///
/// Returns `None` when every port in the range is taken.
#[must_use]
pub fn find_open_port(lower: u16, upper: u16) -> Option<u16> {
    (lower..upper).find(|port| TcpListener::bind(("127.0.0.1", *port)).is_ok())
}

/// First six hex chars of the SHA-256 of `input`.
///
/// Used to suffix generated resource names so they stay unique without
/// becoming unreadable.
#[must_use]
pub fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..6].to_string()
}

/// Random alphanumeric password of `len` characters.
#[must_use]
pub fn random_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
