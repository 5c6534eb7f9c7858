//! Built-in pipeline [Behavior]s: request validation and idempotent
//! dispatch.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, FieldError};
use crate::mediator::{Behavior, Context, Next, Request};
use crate::message::Envelope;
use crate::reliability::idempotency;

/// The metadata key carrying the caller-supplied request id used for
/// idempotent dispatch.
///
/// Requests without this metadata entry bypass the [Idempotent] behavior.
pub const REQUEST_ID: &str = "request-id";

/// A [Behavior] rejecting requests that fail a field-level validation check,
/// short-circuiting with a [Validation][crate::error::Code::Validation]
/// failure before the handler runs.
pub struct Validate<T, F>
where
    T: Request,
    F: Fn(&T) -> Vec<FieldError> + Send + Sync,
{
    check: F,
    request: PhantomData<fn(T)>,
}

impl<T, F> Validate<T, F>
where
    T: Request,
    F: Fn(&T) -> Vec<FieldError> + Send + Sync,
{
    /// Creates a new [Validate] behavior from the given check, which
    /// returns the list of field rejections (empty when the request is valid).
    pub fn new(check: F) -> Self {
        Self {
            check,
            request: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F> Behavior<T> for Validate<T, F>
where
    T: Request,
    F: Fn(&T) -> Vec<FieldError> + Send + Sync,
{
    async fn handle(
        &self,
        request: Envelope<T>,
        ctx: &Context,
        next: Next<'_, T>,
    ) -> Result<T::Response, Error> {
        let rejections = (self.check)(&request.message);

        if !rejections.is_empty() {
            return Err(Error::validation(rejections));
        }

        next.run(request, ctx).await
    }
}

/// A [Behavior] making dispatch idempotent per request id.
///
/// Requests carrying the [REQUEST_ID] metadata entry enter a per-id critical
/// section: concurrent duplicates of the same id invoke the handler exactly
/// once, and every other caller replays the cached response. The section is
/// held only across the handler execution for that id, and its slot lives
/// only while callers of that id are in flight; late duplicates are served
/// by the response cache alone.
///
/// Successful responses are cached with the configured TTL; failures are
/// not, so a later retry with the same id re-invokes the handler.
pub struct Idempotent<S>
where
    S: idempotency::Store,
{
    store: S,
    ttl: Duration,
    sections: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl<S> Idempotent<S>
where
    S: idempotency::Store,
{
    /// Creates a new [Idempotent] behavior over the given store, caching
    /// responses for `ttl`.
    pub fn new(store: S, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            sections: Arc::default(),
        }
    }

    fn section(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut sections = self.sections.lock();
        Arc::clone(sections.entry(id.to_owned()).or_default())
    }

    fn release_section(&self, id: &str) {
        let mut sections = self.sections.lock();

        // The map entry holds the last reference once every in-flight
        // caller of this id has dropped its own.
        if let Some(section) = sections.get(id) {
            if Arc::strong_count(section) == 1 {
                sections.remove(id);
            }
        }
    }
}

#[async_trait]
impl<T, S> Behavior<T> for Idempotent<S>
where
    T: Request,
    T::Response: Clone,
    S: idempotency::Store,
{
    async fn handle(
        &self,
        request: Envelope<T>,
        ctx: &Context,
        next: Next<'_, T>,
    ) -> Result<T::Response, Error> {
        let Some(request_id) = request.metadata_value(REQUEST_ID).map(ToOwned::to_owned) else {
            return next.run(request, ctx).await;
        };

        let section = self.section(&request_id);

        let outcome = async {
            let _guard = section.lock().await;

            let cached = self
                .store
                .get(&request_id)
                .await
                .map_err(|err| Error::dependency("idempotency store failed").with_source(err))?;

            if let Some(cached) = cached {
                tracing::debug!(request_id = %request_id, "duplicate request, replaying cached response");

                return cached
                    .downcast_ref::<T::Response>()
                    .cloned()
                    .ok_or_else(|| {
                        Error::unhandled(format!(
                            "request id '{request_id}' was cached for a different request type",
                        ))
                    });
            }

            let response = next.run(request, ctx).await?;

            self.store
                .store(&request_id, Arc::new(response.clone()), self.ttl)
                .await
                .map_err(|err| Error::dependency("idempotency store failed").with_source(err))?;

            Ok(response)
        }
        .await;

        drop(section);
        self.release_section(&request_id);

        outcome
    }
}
