//! The idempotency store: a TTL-bounded cache of request responses keyed by
//! a caller-supplied request id, used by the
//! [Idempotent][crate::mediator::behavior::Idempotent] pipeline behavior to
//! short-circuit duplicate processing.

use std::any::Any;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// A cached response, type-erased.
///
/// The serializer seam is reserved for the Outbox and the Snapshot store;
/// in-process duplicates replay the original response value directly.
pub type CachedResponse = Arc<dyn Any + Send + Sync>;

/// Interface to record and look up processed request ids.
///
/// An id counts as processed while its entry exists and has not expired.
#[async_trait]
pub trait Store: Send + Sync {
    /// The error type returned by the concrete implementation.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Reports whether the request id has been processed and its entry has
    /// not expired yet.
    async fn is_processed(&self, id: &str) -> Result<bool, Self::Error>;

    /// Records the response of a processed request id, expiring after `ttl`.
    async fn store(
        &self,
        id: &str,
        response: CachedResponse,
        ttl: Duration,
    ) -> Result<(), Self::Error>;

    /// Returns the cached response of the request id, if still unexpired.
    async fn get(&self, id: &str) -> Result<Option<CachedResponse>, Self::Error>;
}

#[derive(Clone)]
struct Entry {
    response: CachedResponse,
    expires_at: DateTime<Utc>,
}

/// In-memory implementation of the idempotency [Store] trait.
///
/// Expired entries are purged lazily, whenever their id is looked up again.
#[derive(Clone, Default)]
pub struct InMemory {
    backend: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemory {
    fn live_entry(&self, id: &str) -> Option<Entry> {
        let expired = {
            let backend = self.backend.read();
            match backend.get(id) {
                None => return None,
                Some(entry) if entry.expires_at > Utc::now() => return Some(entry.clone()),
                Some(_) => true,
            }
        };

        if expired {
            self.backend.write().remove(id);
        }

        None
    }
}

#[async_trait]
impl Store for InMemory {
    type Error = Infallible;

    async fn is_processed(&self, id: &str) -> Result<bool, Self::Error> {
        Ok(self.live_entry(id).is_some())
    }

    async fn store(
        &self,
        id: &str,
        response: CachedResponse,
        ttl: Duration,
    ) -> Result<(), Self::Error> {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.backend.write().insert(
            id.to_owned(),
            Entry {
                response,
                expires_at,
            },
        );

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<CachedResponse>, Self::Error> {
        Ok(self.live_entry(id).map(|entry| entry.response))
    }
}
