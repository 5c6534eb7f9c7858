//! Runtime configuration profiles.
//!
//! The library itself is configured programmatically; binding these values
//! to the environment is the job of the application crate hosting it.

use std::time::Duration;

use crate::resilience;

/// Default number of events read from the global order per subscription or
/// projection poll.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Tunables shared by the subscription runtime, the idempotency behavior
/// and the resilience wrapper.
#[derive(Debug, Clone)]
pub struct Config {
    /// Events read from the global order per poll.
    pub batch_size: usize,
    /// How long pollers (subscription runners, outbox relay, scheduler
    /// worker) sleep when caught up.
    pub poll_interval: Duration,
    /// Default expiry of idempotency entries.
    pub idempotency_ttl: Duration,
    /// The resilience profile wrapped around request handlers.
    pub resilience: resilience::Profile,
    /// The `tracing` filter directive suggested for this profile.
    pub log_filter: &'static str,
}

impl Config {
    /// A liberal profile for local development: generous TTLs, a single
    /// handler attempt, no breaker, trace-level logging.
    pub fn development() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_millis(50),
            idempotency_ttl: Duration::from_secs(60 * 60),
            resilience: resilience::Profile::development(),
            log_filter: "trace",
        }
    }

    /// A production profile: retries, per-attempt deadlines and a circuit
    /// breaker around handlers.
    pub fn production() -> Self {
        Self {
            batch_size: 256,
            poll_interval: Duration::from_millis(500),
            idempotency_ttl: Duration::from_secs(5 * 60),
            resilience: resilience::Profile::production(),
            log_filter: "info",
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::development()
    }
}
