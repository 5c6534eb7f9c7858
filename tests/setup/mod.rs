//! Shared Orders domain used by the integration suites.

#![allow(dead_code)]

use std::borrow::{Borrow, BorrowMut};
use std::fmt::Display;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use catga::aggregate::repository::{GetError, RehydrateError, Repository};
use catga::aggregate::{Aggregate, Context, EventSourced, Root};
use catga::error::Error;
use catga::event;
use catga::event::store::{AppendError, Streamer};
use catga::mediator::{self, Handler, Request};
use catga::message::{Envelope, Message};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderEvent {
    Created { order_id: String, amount: u64 },
    ItemAdded { price: u64, quantity: u64 },
}

impl Message for OrderEvent {
    fn name(&self) -> &'static str {
        match self {
            OrderEvent::Created { .. } => "OrderWasCreated",
            OrderEvent::ItemAdded { .. } => "OrderItemWasAdded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    order_id: String,
    total_amount: u64,
    item_count: u64,
}

impl Order {
    pub fn total_amount(&self) -> u64 {
        self.total_amount
    }

    pub fn item_count(&self) -> u64 {
        self.item_count
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
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
            (None, OrderEvent::Created { order_id, amount }) => Ok(Order {
                order_id,
                total_amount: amount,
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
pub struct OrderRoot(Context<Order>);

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
    pub fn create(order_id: String) -> Result<Self, OrderError> {
        Self::record_new(event::Envelope::from(OrderEvent::Created {
            order_id,
            amount: 0,
        }))
    }

    pub fn add_item(&mut self, price: u64, quantity: u64) -> Result<(), OrderError> {
        if quantity == 0 {
            return Err(OrderError::EmptyItem);
        }

        self.record_that(event::Envelope::from(OrderEvent::ItemAdded {
            price,
            quantity,
        }))
    }
}

pub type OrderStore = event::store::InMemory<OrderEvent>;
pub type OrderRepository = EventSourced<Order, OrderRoot, OrderStore>;

// Commands of the Orders application layer.

#[derive(Debug, Clone, PartialEq)]
pub struct CreateOrder {
    pub order_id: String,
}

impl Message for CreateOrder {
    fn name(&self) -> &'static str {
        "CreateOrder"
    }
}

impl Request for CreateOrder {
    type Response = ();
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddOrderItem {
    pub order_id: String,
    pub price: u64,
    pub quantity: u64,
}

impl Message for AddOrderItem {
    fn name(&self) -> &'static str {
        "AddOrderItem"
    }
}

impl Request for AddOrderItem {
    // Responds with the new order total.
    type Response = u64;
}

fn save_error(err: AppendError) -> Error {
    match err {
        AppendError::Conflict(conflict) => Error::from(conflict),
        AppendError::Internal(err) => {
            Error::dependency(format!("event store failed: {err}"))
        },
    }
}

fn get_error<E>(err: GetError<RehydrateError<OrderError, E>>) -> Error
where
    E: Display,
{
    match err {
        GetError::NotFound => Error::not_found("order does not exist"),
        GetError::Inner(err) => Error::unhandled(err.to_string()),
    }
}

pub struct CreateOrderHandler<S>(pub EventSourced<Order, OrderRoot, S>)
where
    S: event::Store<OrderEvent>;

#[async_trait]
impl<S> Handler<CreateOrder> for CreateOrderHandler<S>
where
    S: event::Store<OrderEvent>,
    <S as Streamer<OrderEvent>>::Error: Display + Send + Sync,
{
    async fn handle(
        &self,
        command: Envelope<CreateOrder>,
        _ctx: &mediator::Context,
    ) -> Result<(), Error> {
        let mut order = OrderRoot::create(command.message.order_id)
            .map_err(|err| Error::unhandled(err.to_string()))?;

        self.0.save(&mut order).await.map_err(save_error)?;

        Ok(())
    }
}

pub struct AddOrderItemHandler<S>(pub EventSourced<Order, OrderRoot, S>)
where
    S: event::Store<OrderEvent>;

#[async_trait]
impl<S> Handler<AddOrderItem> for AddOrderItemHandler<S>
where
    S: event::Store<OrderEvent>,
    <S as Streamer<OrderEvent>>::Error: Display + Send + Sync,
{
    async fn handle(
        &self,
        command: Envelope<AddOrderItem>,
        _ctx: &mediator::Context,
    ) -> Result<u64, Error> {
        let command = command.message;

        let mut order = self.0.get(&command.order_id).await.map_err(get_error)?;

        order
            .add_item(command.price, command.quantity)
            .map_err(|err| Error::unhandled(err.to_string()))?;

        self.0.save(&mut order).await.map_err(save_error)?;

        Ok(order.state().total_amount())
    }
}
