//! The behavior pipeline composed around every request handler.
//!
//! Behaviors are the middleware of the dispatch path: validation,
//! authorization, idempotency caching and rate limiting are all expressed as
//! [Behavior]s that either forward the request through [Next] or
//! short-circuit with their own result.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::mediator::{Context, Handler, Request};
use crate::message::Envelope;

/// A middleware wrapping the [Handler] of a request type.
///
/// Behaviors execute in registration order; each receives the request and
/// the [Next] continuation. Calling [`Next::run`] forwards the request to
/// the rest of the pipeline; returning without calling it short-circuits.
/// [Next] is consumed by value, so it can be invoked at most once.
#[async_trait]
pub trait Behavior<T>: Send + Sync
where
    T: Request,
{
    /// Handles the request, either forwarding it through `next` or
    /// short-circuiting with its own result.
    async fn handle(
        &self,
        request: Envelope<T>,
        ctx: &Context,
        next: Next<'_, T>,
    ) -> Result<T::Response, Error>;
}

/// The continuation of the pipeline: the remaining [Behavior]s followed by
/// the request [Handler].
pub struct Next<'a, T>
where
    T: Request,
{
    behaviors: &'a [Arc<dyn Behavior<T>>],
    handler: &'a dyn Handler<T>,
}

impl<'a, T> Next<'a, T>
where
    T: Request,
{
    pub(crate) fn new(behaviors: &'a [Arc<dyn Behavior<T>>], handler: &'a dyn Handler<T>) -> Self {
        Self { behaviors, handler }
    }

    /// Runs the rest of the pipeline: the next registered [Behavior], or the
    /// [Handler] once every behavior has run.
    pub async fn run(self, request: Envelope<T>, ctx: &Context) -> Result<T::Response, Error> {
        match self.behaviors.split_first() {
            Some((head, tail)) => {
                head.handle(
                    request,
                    ctx,
                    Next {
                        behaviors: tail,
                        handler: self.handler,
                    },
                )
                .await
            },
            None => self.handler.handle(request, ctx).await,
        }
    }
}
