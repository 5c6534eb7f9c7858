//! A lease-based lock over named resources, with fencing tokens.
//!
//! Leases expire on their TTL. A releaser presents its [Lease]; a stale
//! lease -- one superseded after expiring -- cannot evict the current
//! holder, because release verifies the fencing token.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

/// Proof of lock ownership handed out by a successful
/// [try_acquire][Provider::try_acquire].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    resource: String,
    token: u64,
}

impl Lease {
    /// The resource this lease covers.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The fencing token of this lease, unique per acquisition.
    pub fn token(&self) -> u64 {
        self.token
    }
}

/// Interface to acquire and release named resource leases.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The error type returned by the concrete implementation.
    type Error: Send + Sync;

    /// Acquires the named resource for `ttl`, if no unexpired lease exists
    /// for it. Returns `None` while another holder's lease is live.
    async fn try_acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, Self::Error>;

    /// Releases a held lease.
    ///
    /// Returns `false` when the lease no longer owns the resource, i.e. it
    /// expired and the resource was re-acquired; the current holder is
    /// unaffected in that case.
    async fn release(&self, lease: &Lease) -> Result<bool, Self::Error>;
}

#[derive(Debug)]
struct Holder {
    token: u64,
    expires_at: Instant,
}

/// In-memory implementation of the lock [Provider] trait.
#[derive(Debug, Clone, Default)]
pub struct InMemory {
    backend: Arc<Mutex<HashMap<String, Holder>>>,
    fencing: Arc<AtomicU64>,
}

impl InMemory {
    /// Reports whether an unexpired lease exists for the resource.
    pub fn is_held(&self, resource: &str) -> bool {
        self.backend
            .lock()
            .get(resource)
            .map_or(false, |holder| holder.expires_at > Instant::now())
    }
}

#[async_trait]
impl Provider for InMemory {
    type Error = Infallible;

    async fn try_acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, Self::Error> {
        let mut backend = self.backend.lock();
        let now = Instant::now();

        if let Some(holder) = backend.get(resource) {
            if holder.expires_at > now {
                return Ok(None);
            }
        }

        let token = self.fencing.fetch_add(1, Ordering::SeqCst) + 1;

        backend.insert(
            resource.to_owned(),
            Holder {
                token,
                expires_at: now + ttl,
            },
        );

        Ok(Some(Lease {
            resource: resource.to_owned(),
            token,
        }))
    }

    async fn release(&self, lease: &Lease) -> Result<bool, Self::Error> {
        let mut backend = self.backend.lock();

        match backend.get(&lease.resource) {
            Some(holder) if holder.token == lease.token => {
                backend.remove(&lease.resource);
                Ok(true)
            },
            _ => Ok(false),
        }
    }
}
