//! Module exposing a test [Scenario] type to write Command [Handler] test
//! cases using the [given-then-when canvas](https://www.agilealliance.org/glossary/gwt/).

use crate::event::store::{Appender, EventStoreExt};
use crate::mediator::{Context, Handler, Request};
use crate::{event, message, version};

/// A test scenario that can be used to test a Command [Handler]
/// using a [given-then-when canvas](https://www.agilealliance.org/glossary/gwt/) approach.
pub struct Scenario;

impl Scenario {
    /// Sets the precondition state of the system for the [Scenario], which
    /// is expressed by a list of persisted Domain Events.
    #[must_use]
    pub fn given<Evt>(self, events: Vec<event::Persisted<Evt>>) -> ScenarioGiven<Evt>
    where
        Evt: message::Message,
    {
        ScenarioGiven { given: events }
    }

    /// Specifies the Command to test in the [Scenario], in the peculiar case
    /// of having a clean system.
    ///
    /// This is a shortcut for:
    /// ```text
    /// Scenario.given(vec![]).when(...)
    /// ```
    #[must_use]
    pub fn when<Evt, Cmd>(self, command: event::Envelope<Cmd>) -> ScenarioWhen<Evt, Cmd>
    where
        Evt: message::Message,
        Cmd: Request,
    {
        ScenarioWhen {
            given: Vec::default(),
            when: command,
        }
    }
}

#[doc(hidden)]
pub struct ScenarioGiven<Evt>
where
    Evt: message::Message,
{
    given: Vec<event::Persisted<Evt>>,
}

impl<Evt> ScenarioGiven<Evt>
where
    Evt: message::Message,
{
    /// Specifies the Command to test in the [Scenario].
    #[must_use]
    pub fn when<Cmd>(self, command: event::Envelope<Cmd>) -> ScenarioWhen<Evt, Cmd>
    where
        Cmd: Request,
    {
        ScenarioWhen {
            given: self.given,
            when: command,
        }
    }
}

#[doc(hidden)]
pub struct ScenarioWhen<Evt, Cmd>
where
    Evt: message::Message,
    Cmd: Request,
{
    given: Vec<event::Persisted<Evt>>,
    when: event::Envelope<Cmd>,
}

impl<Evt, Cmd> ScenarioWhen<Evt, Cmd>
where
    Evt: message::Message,
    Cmd: Request,
{
    /// Sets the expectation on the result of the [Scenario] to be positive
    /// and produce a specified list of Domain Events.
    #[must_use]
    pub fn then(self, events: Vec<event::Persisted<Evt>>) -> ScenarioThen<Evt, Cmd> {
        ScenarioThen {
            given: self.given,
            when: self.when,
            case: ScenarioThenCase::Produces(events),
        }
    }

    /// Sets the expectation on the result of the [Scenario] to return an error.
    #[must_use]
    pub fn then_fails(self) -> ScenarioThen<Evt, Cmd> {
        ScenarioThen {
            given: self.given,
            when: self.when,
            case: ScenarioThenCase::Fails,
        }
    }
}

enum ScenarioThenCase<Evt>
where
    Evt: message::Message,
{
    Produces(Vec<event::Persisted<Evt>>),
    Fails,
}

#[doc(hidden)]
pub struct ScenarioThen<Evt, Cmd>
where
    Evt: message::Message,
    Cmd: Request,
{
    given: Vec<event::Persisted<Evt>>,
    when: event::Envelope<Cmd>,
    case: ScenarioThenCase<Evt>,
}

impl<Evt, Cmd> ScenarioThen<Evt, Cmd>
where
    Evt: message::Message + Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static,
    Cmd: Request,
{
    /// Executes the whole [Scenario] by constructing a Command [Handler]
    /// with the provided closure function and running the specified assertions.
    ///
    /// # Panics
    ///
    /// The method panics if the assertion fails.
    pub async fn assert_on<F, H>(self, handler_factory: F)
    where
        F: Fn(event::store::Tracking<event::store::InMemory<Evt>, Evt>) -> H,
        H: Handler<Cmd>,
    {
        let event_store = event::store::InMemory::<Evt>::default();
        let tracking_event_store = event_store.clone().with_recorded_events_tracking();

        for event in self.given {
            event_store
                .append(
                    event.stream_id,
                    version::Check::MustBe(event.version - 1),
                    vec![event.event],
                )
                .await
                .expect("domain event in 'given' should be inserted in the event store");
        }

        let handler = handler_factory(tracking_event_store.clone());
        let result = handler.handle(self.when, &Context::default()).await;

        match self.case {
            ScenarioThenCase::Produces(events) => {
                let recorded_events = tracking_event_store.recorded_events();
                assert_eq!(events, recorded_events);
            },
            ScenarioThenCase::Fails => assert!(result.is_err()),
        }
    }
}
