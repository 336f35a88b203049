//! Readiness probing against the instance control API.
//!
//! Every backend exposes the same contract once its agent is up:
//! `GET {base}/health` answers `200` with `{"status":"ok"}`. The probe
//! trusts the status code; connection errors and any other status mean
//! not-ready and the bounded loop retries.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::instance::ProviderKind;

/// Request timeout for one health call.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded retry policy for readiness waits.
///
/// Providers take the default; tests shrink it so exhaustion is fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            delay: Duration::from_secs(2),
        }
    }
}

/// One health call against `base_url`.
#[must_use]
pub fn check_health(base_url: &str) -> bool {
    let url = format!("{}/health", base_url.trim_end_matches('/'));
    match ureq::get(&url).timeout(PROBE_TIMEOUT).call() {
        Ok(resp) => resp.status() == 200,
        Err(_) => false,
    }
}

/// Run `probe` up to `policy.attempts` times, `policy.delay` apart, until it
/// reports ready.
///
/// # Errors
///
/// Returns [`Error::ReadinessTimeout`] when every attempt reports not-ready.
pub fn wait_until_ready(
    name: &str,
    provider: ProviderKind,
    policy: ProbePolicy,
    mut probe: impl FnMut() -> bool,
) -> Result<()> {
    for attempt in 1..=policy.attempts {
        tracing::debug!(name, attempt, "probing readiness");
        if probe() {
            return Ok(());
        }
        if attempt < policy.attempts {
            std::thread::sleep(policy.delay);
        }
    }
    Err(Error::ReadinessTimeout {
        name: name.to_string(),
        provider,
        attempts: policy.attempts,
    })
}
