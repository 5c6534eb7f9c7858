//! The Mediator: typed, in-process dispatch of Commands, Queries and Events
//! through a pipeline of composable [Behavior]s.
//!
//! Commands and Queries are [Request]s: messages dispatched to exactly one
//! [Handler] returning a typed response. Events fan out to every
//! [EventHandler] registered for their concrete type. Handlers and behaviors
//! are resolved from a registry built once at startup, keyed by the type
//! identity of the message.

pub mod behavior;
pub mod pipeline;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

pub use pipeline::{Behavior, Next};

use crate::error::Error;
use crate::message::{Envelope, Message};

/// A Request is a [Message] dispatched to exactly one [Handler], producing
/// a typed response.
///
/// Commands and Queries are both Requests: a Command that returns nothing
/// declares `()` as its [Response][Request::Response].
pub trait Request: Message + Send + Sync + 'static {
    /// The response type produced by handling this request.
    type Response: Send + Sync + 'static;
}

/// Execution context flowing through every behavior and handler of a
/// dispatch, carrying the cancellation signal of the caller.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancellation: CancellationToken,
}

impl Context {
    /// Creates a [Context] bound to the given [CancellationToken].
    pub fn with_cancellation(cancellation: CancellationToken) -> Self {
        Self { cancellation }
    }

    /// The cancellation signal of the dispatch.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Reports whether the dispatch has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// A software component able to handle [Request]s of a certain type,
/// producing the typed response or a failure.
#[async_trait]
pub trait Handler<T>: Send + Sync
where
    T: Request,
{
    /// Handles a [Request], returning its typed response.
    async fn handle(&self, request: Envelope<T>, ctx: &Context) -> Result<T::Response, Error>;
}

#[async_trait]
impl<T, F, Fut> Handler<T> for F
where
    T: Request,
    F: Send + Sync + Fn(Envelope<T>) -> Fut,
    Fut: Send + std::future::Future<Output = Result<T::Response, Error>>,
{
    async fn handle(&self, request: Envelope<T>, _ctx: &Context) -> Result<T::Response, Error> {
        self(request).await
    }
}

/// A software component able to react to Events of a certain type.
///
/// Any number of event handlers can be registered for the same event type;
/// a failing handler never prevents the others from running.
#[async_trait]
pub trait EventHandler<T>: Send + Sync
where
    T: Message + Send + Sync + 'static,
{
    /// Reacts to the published Event.
    async fn handle(&self, event: Envelope<T>, ctx: &Context) -> Result<(), Error>;
}

#[async_trait]
impl<T, F, Fut> EventHandler<T> for F
where
    T: Message + Send + Sync + 'static,
    F: Send + Sync + Fn(Envelope<T>) -> Fut,
    Fut: Send + std::future::Future<Output = Result<(), Error>>,
{
    async fn handle(&self, event: Envelope<T>, _ctx: &Context) -> Result<(), Error> {
        self(event).await
    }
}

/// What [Mediator::publish] does when one or more event handlers fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishPolicy {
    /// Log the aggregated failures and report success to the caller.
    #[default]
    Log,
    /// Surface the aggregated failures to the caller.
    Fail,
}

struct Registration<T>
where
    T: Request,
{
    handler: Arc<dyn Handler<T>>,
    behaviors: Vec<Arc<dyn Behavior<T>>>,
}

/// Configuration errors detected while building a [Mediator].
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// More than one handler has been registered for the same request type.
    #[error("duplicate handler registrations for request types: {0:?}")]
    DuplicateHandlers(Vec<&'static str>),

    /// A behavior has been registered for a request type with no handler.
    #[error("behaviors registered for request types with no handler: {0:?}")]
    BehaviorsWithoutHandler(Vec<&'static str>),
}

/// Builder assembling the handler registry of a [Mediator].
#[derive(Default)]
pub struct Builder {
    requests: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    events: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    duplicates: Vec<&'static str>,
    orphan_behaviors: Vec<&'static str>,
    publish_policy: PublishPolicy,
}

impl Builder {
    /// Registers the unique [Handler] for the request type `T`.
    ///
    /// Registering a second handler for the same type is a configuration
    /// error, reported by [build][Builder::build].
    #[must_use]
    pub fn register<T, H>(mut self, handler: H) -> Self
    where
        T: Request,
        H: Handler<T> + 'static,
    {
        let key = TypeId::of::<T>();

        if self.requests.contains_key(&key) {
            self.duplicates.push(std::any::type_name::<T>());
            return self;
        }

        self.requests.insert(
            key,
            Box::new(Registration::<T> {
                handler: Arc::new(handler),
                behaviors: Vec::new(),
            }),
        );

        self
    }

    /// Appends a [Behavior] to the pipeline of the request type `T`.
    ///
    /// Behaviors execute in the order they are registered. The handler for
    /// `T` must have been registered first.
    #[must_use]
    pub fn with_behavior<T, B>(mut self, behavior: B) -> Self
    where
        T: Request,
        B: Behavior<T> + 'static,
    {
        let slot = self
            .requests
            .get_mut(&TypeId::of::<T>())
            .and_then(|slot| slot.downcast_mut::<Registration<T>>());

        match slot {
            Some(registration) => registration.behaviors.push(Arc::new(behavior)),
            None => self.orphan_behaviors.push(std::any::type_name::<T>()),
        }

        self
    }

    /// Registers an [EventHandler] for the event type `T`.
    #[must_use]
    pub fn subscribe<T, H>(mut self, handler: H) -> Self
    where
        T: Message + Send + Sync + 'static,
        H: EventHandler<T> + 'static,
    {
        self.events
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(Vec::<Arc<dyn EventHandler<T>>>::new()))
            .downcast_mut::<Vec<Arc<dyn EventHandler<T>>>>()
            .expect("event registry slot holds the handlers of its own type")
            .push(Arc::new(handler));

        self
    }

    /// Overrides the [PublishPolicy] applied on event handler failures.
    #[must_use]
    pub fn with_publish_policy(mut self, policy: PublishPolicy) -> Self {
        self.publish_policy = policy;
        self
    }

    /// Builds the [Mediator], reporting any configuration error collected
    /// during registration.
    pub fn build(self) -> Result<Mediator, BuildError> {
        if !self.duplicates.is_empty() {
            return Err(BuildError::DuplicateHandlers(self.duplicates));
        }

        if !self.orphan_behaviors.is_empty() {
            return Err(BuildError::BehaviorsWithoutHandler(self.orphan_behaviors));
        }

        Ok(Mediator {
            requests: Arc::new(self.requests),
            events: Arc::new(self.events),
            publish_policy: self.publish_policy,
        })
    }
}

/// Typed, in-process dispatcher for Commands, Queries and Events.
///
/// Cloning a [Mediator] is cheap: clones share the same registry.
#[derive(Clone)]
pub struct Mediator {
    requests: Arc<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    events: Arc<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    publish_policy: PublishPolicy,
}

impl std::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mediator")
            .field("requests", &self.requests.len())
            .field("events", &self.events.len())
            .field("publish_policy", &self.publish_policy)
            .finish()
    }
}

impl Mediator {
    /// Returns a [Builder] to assemble a new [Mediator].
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Dispatches a [Request] to its unique [Handler], through the
    /// behaviors registered for its type.
    pub async fn send<T>(&self, request: impl Into<Envelope<T>>) -> Result<T::Response, Error>
    where
        T: Request,
    {
        self.send_in(request, &Context::default()).await
    }

    /// Dispatches a [Request] within the given [Context], racing the
    /// pipeline against the caller's cancellation signal.
    pub async fn send_in<T>(
        &self,
        request: impl Into<Envelope<T>>,
        ctx: &Context,
    ) -> Result<T::Response, Error>
    where
        T: Request,
    {
        let envelope = request.into();
        let name = envelope.message.name();

        let registration = self
            .requests
            .get(&TypeId::of::<T>())
            .and_then(|slot| slot.downcast_ref::<Registration<T>>())
            .ok_or_else(|| Error::no_handler(name))?;

        let next = Next::new(&registration.behaviors, registration.handler.as_ref());
        let pipeline = AssertUnwindSafe(next.run(envelope, ctx)).catch_unwind();

        tokio::select! {
            biased;
            () = ctx.cancellation.cancelled() => Err(Error::cancelled()),
            outcome = pipeline => match outcome {
                Ok(result) => result,
                Err(panic) => Err(Error::unhandled(panic_message(&panic))),
            },
        }
    }

    /// Dispatches a batch of [Request]s of the same type concurrently.
    ///
    /// Semantically equivalent to N independent [send][Mediator::send]
    /// calls; the returned results preserve the order of the requests.
    pub async fn send_batch<T>(
        &self,
        requests: Vec<Envelope<T>>,
    ) -> Vec<Result<T::Response, Error>>
    where
        T: Request,
    {
        let ctx = Context::default();

        join_all(
            requests
                .into_iter()
                .map(|request| self.send_in(request, &ctx)),
        )
        .await
    }

    /// Publishes an Event to every [EventHandler] registered for its
    /// concrete type.
    ///
    /// Handler failures are collected: under [PublishPolicy::Log] (the
    /// default) they are logged and the call succeeds; under
    /// [PublishPolicy::Fail] the aggregated failure surfaces to the caller.
    /// A failing handler never prevents the others from running.
    pub async fn publish<T>(&self, event: impl Into<Envelope<T>>) -> Result<(), Error>
    where
        T: Message + Clone + Send + Sync + 'static,
    {
        self.publish_in(event, &Context::default()).await
    }

    /// Publishes an Event within the given [Context].
    pub async fn publish_in<T>(
        &self,
        event: impl Into<Envelope<T>>,
        ctx: &Context,
    ) -> Result<(), Error>
    where
        T: Message + Clone + Send + Sync + 'static,
    {
        let envelope = event.into();

        let Some(handlers) = self
            .events
            .get(&TypeId::of::<T>())
            .and_then(|slot| slot.downcast_ref::<Vec<Arc<dyn EventHandler<T>>>>())
        else {
            // An event with no handlers is a fact nobody reacts to yet.
            return Ok(());
        };

        let fan_out = join_all(handlers.iter().map(|handler| {
            let event = envelope.clone();
            async move {
                AssertUnwindSafe(handler.handle(event, ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(Error::unhandled(panic_message(&panic))))
            }
        }));

        let outcomes = tokio::select! {
            biased;
            () = ctx.cancellation.cancelled() => return Err(Error::cancelled()),
            outcomes = fan_out => outcomes,
        };

        let failures: Vec<Error> = outcomes.into_iter().filter_map(Result::err).collect();

        if failures.is_empty() {
            return Ok(());
        }

        for failure in &failures {
            tracing::error!(
                event = envelope.message.name(),
                error = %failure,
                "event handler failed",
            );
        }

        match self.publish_policy {
            PublishPolicy::Log => Ok(()),
            PublishPolicy::Fail => {
                let messages: Vec<String> =
                    failures.iter().map(|failure| failure.to_string()).collect();

                Err(Error::unhandled(format!(
                    "{} event handler(s) failed: {}",
                    messages.len(),
                    messages.join("; "),
                )))
            },
        }
    }

    /// Publishes a batch of Events of the same type concurrently.
    ///
    /// Semantically equivalent to N independent [publish][Mediator::publish]
    /// calls.
    pub async fn publish_batch<T>(&self, events: Vec<Envelope<T>>) -> Result<(), Error>
    where
        T: Message + Clone + Send + Sync + 'static,
    {
        let ctx = Context::default();

        let outcomes = join_all(events.into_iter().map(|event| self.publish_in(event, &ctx))).await;

        outcomes.into_iter().collect()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}
