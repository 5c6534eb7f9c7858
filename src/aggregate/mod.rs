//! Module containing support for the Aggregate pattern.
//!
//! An Aggregate is the transaction boundary of the domain: it enforces its
//! business invariants in domain methods, and expresses every state mutation
//! as a Domain Event. Replaying the recorded events in order yields the same
//! state, which is how Aggregates are reconstructed from their Event Stream.

pub mod repository;

use std::borrow::{Borrow, BorrowMut};
use std::fmt;

pub use repository::{EventSourced, Repository, Snapshotting};

use crate::event::StreamId;
use crate::version::Version;
use crate::{event, message};

/// An Aggregate manages a domain entity state, acting as a _transaction boundary_.
///
/// It allows **state mutations** through Domain [Event](Aggregate::Event)s,
/// which are applied in order by [apply](Aggregate::apply) -- a reducer over
/// the tagged event variants of the Aggregate.
pub trait Aggregate: Sized + Send + Sync + Clone {
    /// The type used to uniquely identify the Aggregate.
    type Id: Send + Sync + fmt::Display;

    /// The type of Domain Events that interest this Aggregate.
    /// Usually, this type should be an `enum`.
    type Event: message::Message + Send + Sync + Clone;

    /// The error type that can be returned by [Aggregate::apply] when
    /// mutating the Aggregate state.
    type Error: Send + Sync;

    /// A unique name identifier for this Aggregate type, used to render
    /// the identifier of its Event Streams.
    fn type_name() -> &'static str;

    /// Returns the unique identifier for the Aggregate instance.
    fn aggregate_id(&self) -> &Self::Id;

    /// Mutates the state of an Aggregate through a Domain Event.
    ///
    /// # Errors
    ///
    /// The method can return an error if the event to apply is unexpected
    /// given the current state of the Aggregate.
    fn apply(state: Option<Self>, event: Self::Event) -> Result<Self, Self::Error>;
}

/// Renders the identifier of the Event Stream holding the events of the
/// specified [Aggregate] instance, following the `<AggregateName>-<Id>`
/// convention.
pub fn stream_id<T>(id: &T::Id) -> StreamId
where
    T: Aggregate,
{
    StreamId::for_aggregate(T::type_name(), id)
}

/// A context object that should be used by the Aggregate [Root] methods to
/// access the [Aggregate] state and to record new Domain Events.
#[derive(Debug, Clone)]
#[must_use]
pub struct Context<T>
where
    T: Aggregate,
{
    aggregate: T,
    version: Version,
    recorded_events: Vec<event::Envelope<T::Event>>,
}

impl<T> Context<T>
where
    T: Aggregate,
{
    /// Returns the current version for the [Aggregate].
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the list of uncommitted, recorded Domain Events from the [Context]
    /// and resets the internal list to its default value.
    #[doc(hidden)]
    pub fn take_uncommitted_events(&mut self) -> Vec<event::Envelope<T::Event>> {
        std::mem::take(&mut self.recorded_events)
    }

    /// Creates a new [Context] instance from a Domain Event
    /// while rehydrating an [Aggregate].
    ///
    /// # Errors
    ///
    /// The method can return an error if the event to apply is unexpected
    /// given the current state of the Aggregate.
    pub(crate) fn rehydrate_from(event: event::Envelope<T::Event>) -> Result<Context<T>, T::Error> {
        Ok(Context {
            version: 1,
            aggregate: T::apply(None, event.message)?,
            recorded_events: Vec::default(),
        })
    }

    /// Creates a new [Context] instance from a state value recorded at a
    /// known [Version], such as one loaded from a Snapshot.
    pub(crate) fn rehydrate_from_state(aggregate: T, version: Version) -> Context<T> {
        Context {
            aggregate,
            version,
            recorded_events: Vec::default(),
        }
    }

    /// Applies a new Domain Event to the [Context] while rehydrating
    /// an [Aggregate].
    ///
    /// # Errors
    ///
    /// The method can return an error if the event to apply is unexpected
    /// given the current state of the Aggregate.
    pub(crate) fn apply_rehydrated_event(
        mut self,
        event: event::Envelope<T::Event>,
    ) -> Result<Context<T>, T::Error> {
        self.aggregate = T::apply(Some(self.aggregate), event.message)?;
        self.version += 1;

        Ok(self)
    }

    /// Returns read access to the [Aggregate] state.
    fn state(&self) -> &T {
        &self.aggregate
    }

    fn record_new(event: event::Envelope<T::Event>) -> Result<Context<T>, T::Error> {
        Ok(Context {
            version: 1,
            aggregate: T::apply(None, event.message.clone())?,
            recorded_events: vec![event],
        })
    }

    fn record_that(&mut self, event: event::Envelope<T::Event>) -> Result<(), T::Error> {
        self.aggregate = T::apply(Some(self.aggregate.clone()), event.message.clone())?;
        self.recorded_events.push(event);
        self.version += 1;

        Ok(())
    }
}

/// An Aggregate Root represents the Domain Entity object used to
/// load and save an [Aggregate] from and to a [Repository], and
/// to perform actions that may result in new Domain Events
/// to change the state of the Aggregate.
///
/// An Aggregate Root implementation should only depend on [Context],
/// and implement the `From<Context<AggregateType>>` trait. The Aggregate state
/// and list of Domain Events recorded are handled by the Context object itself.
///
/// ```text
/// #[derive(Debug, Clone)]
/// struct MyAggregateRoot(Context<MyAggregate>);
///
/// impl From<Context<MyAggregate>> for MyAggregateRoot {
///     fn from(ctx: Context<MyAggregate>) -> Self {
///         Self(ctx)
///     }
/// }
///
/// // Implement the Aggregate Root interface by providing
/// // read/write access to the Context object.
/// impl aggregate::Root<MyAggregate> for MyAggregateRoot {
///     fn ctx(&self) -> &Context<MyAggregate> {
///         &self.0
///     }
///
///     fn ctx_mut(&mut self) -> &mut Context<MyAggregate> {
///         &mut self.0
///     }
/// }
/// ```
pub trait Root<T>: From<Context<T>> + Borrow<Context<T>> + BorrowMut<Context<T>> + Send + Sync
where
    T: Aggregate,
{
    /// Provides read access to an [Aggregate] [Root] [Context].
    #[doc(hidden)]
    fn ctx(&self) -> &Context<T> {
        self.borrow()
    }

    /// Provides write access to an [Aggregate] [Root] [Context].
    #[doc(hidden)]
    fn ctx_mut(&mut self) -> &mut Context<T> {
        self.borrow_mut()
    }

    /// Provides convenient access to the [Aggregate] Root state.
    fn state(&self) -> &T {
        self.ctx().state()
    }

    /// Returns the current version of the [Aggregate] Root.
    fn version(&self) -> Version {
        self.ctx().version()
    }

    /// Returns the unique identifier for the Aggregate instance.
    fn aggregate_id<'a>(&'a self) -> &'a T::Id
    where
        T: 'a,
    {
        self.state().aggregate_id()
    }

    /// Creates a new [Aggregate] [Root] instance by applying the specified
    /// Domain Event.
    ///
    /// # Errors
    ///
    /// The method can return an error if the event to apply is unexpected
    /// given the current state of the Aggregate.
    fn record_new(event: event::Envelope<T::Event>) -> Result<Self, T::Error> {
        Context::record_new(event).map(Self::from)
    }

    /// Records a change to the [Aggregate] [Root], expressed by the specified
    /// Domain Event.
    ///
    /// # Errors
    ///
    /// The method can return an error if the event to apply is unexpected
    /// given the current state of the Aggregate.
    fn record_that(&mut self, event: event::Envelope<T::Event>) -> Result<(), T::Error> {
        self.ctx_mut().record_that(event)
    }
}

#[cfg(test)]
pub(crate) mod test_order_domain {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::message;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) enum OrderEvent {
        Created { order_id: String },
        ItemAdded { price: u64, quantity: u64 },
    }

    impl message::Message for OrderEvent {
        fn name(&self) -> &'static str {
            match self {
                OrderEvent::Created { .. } => "OrderWasCreated",
                OrderEvent::ItemAdded { .. } => "OrderItemWasAdded",
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Order {
        order_id: String,
        pub(crate) total_amount: u64,
        pub(crate) item_count: u64,
    }

    #[derive(Debug, thiserror::Error)]
    pub(crate) enum OrderError {
        #[error("order has not been created yet")]
        NotYetCreated,
        #[error("order has already been created")]
        AlreadyCreated,
        #[error("order items must have a positive quantity")]
        EmptyItem,
    }

    impl Aggregate for Order {
        type Id = String;
        type Event = OrderEvent;
        type Error = OrderError;

        fn type_name() -> &'static str {
            "Order"
        }

        fn aggregate_id(&self) -> &Self::Id {
            &self.order_id
        }

        fn apply(state: Option<Self>, event: Self::Event) -> Result<Self, Self::Error> {
            match (state, event) {
                (None, OrderEvent::Created { order_id }) => Ok(Order {
                    order_id,
                    total_amount: 0,
                    item_count: 0,
                }),
                (None, _) => Err(OrderError::NotYetCreated),
                (Some(_), OrderEvent::Created { .. }) => Err(OrderError::AlreadyCreated),
                (Some(mut order), OrderEvent::ItemAdded { price, quantity }) => {
                    order.total_amount += price * quantity;
                    order.item_count += 1;
                    Ok(order)
                },
            }
        }
    }

    #[derive(Debug, Clone)]
    pub(crate) struct OrderRoot(Context<Order>);

    impl From<Context<Order>> for OrderRoot {
        fn from(ctx: Context<Order>) -> Self {
            Self(ctx)
        }
    }

    impl Borrow<Context<Order>> for OrderRoot {
        fn borrow(&self) -> &Context<Order> {
            &self.0
        }
    }

    impl BorrowMut<Context<Order>> for OrderRoot {
        fn borrow_mut(&mut self) -> &mut Context<Order> {
            &mut self.0
        }
    }

    impl Root<Order> for OrderRoot {}

    impl OrderRoot {
        pub(crate) fn create(order_id: String) -> Result<Self, OrderError> {
            Self::record_new(event::Envelope::from(OrderEvent::Created { order_id }))
        }

        pub(crate) fn add_item(&mut self, price: u64, quantity: u64) -> Result<(), OrderError> {
            if quantity == 0 {
                return Err(OrderError::EmptyItem);
            }

            self.record_that(event::Envelope::from(OrderEvent::ItemAdded {
                price,
                quantity,
            }))
        }
    }

    #[test]
    fn domain_methods_apply_and_buffer_events() {
        let mut order = OrderRoot::create("A".to_owned()).expect("order should be created");

        order.add_item(50, 2).expect("item should be added");
        order.add_item(100, 1).expect("item should be added");

        assert_eq!(3, order.version());
        assert_eq!(200, order.state().total_amount);
        assert_eq!(2, order.state().item_count);

        let uncommitted = order.ctx_mut().take_uncommitted_events();
        assert_eq!(3, uncommitted.len());

        // The buffer is drained once taken.
        assert!(order.ctx_mut().take_uncommitted_events().is_empty());
    }

    #[test]
    fn invariant_violations_do_not_record_events() {
        let mut order = OrderRoot::create("A".to_owned()).expect("order should be created");

        order
            .add_item(50, 0)
            .expect_err("zero-quantity items should be refused");

        assert_eq!(1, order.version());
        assert_eq!(1, order.ctx_mut().take_uncommitted_events().len());
    }

    #[test]
    fn replaying_history_yields_the_same_state() {
        let events = vec![
            event::Envelope::from(OrderEvent::Created {
                order_id: "A".to_owned(),
            }),
            event::Envelope::from(OrderEvent::ItemAdded {
                price: 50,
                quantity: 2,
            }),
            event::Envelope::from(OrderEvent::ItemAdded {
                price: 100,
                quantity: 1,
            }),
        ];

        let mut events = events.into_iter();

        let ctx = Context::<Order>::rehydrate_from(events.next().unwrap())
            .expect("the first event should rehydrate the aggregate");

        let ctx = events
            .try_fold(ctx, Context::apply_rehydrated_event)
            .expect("all events should apply");

        assert_eq!(3, ctx.version());
        assert_eq!(200, ctx.state().total_amount);
        assert_eq!(2, ctx.state().item_count);
    }
}
