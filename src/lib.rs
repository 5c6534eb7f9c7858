//! `catga` is an in-process message-mediation and Event Sourcing framework.
//!
//! A single process dispatches three kinds of messages -- Commands and
//! Queries (request, one typed response) and Events (fact, zero or more
//! handlers) -- through a [Mediator][mediator::Mediator] pipeline of
//! composable behaviors, and persists state as append-only
//! [Event Streams][event::Store] with optimistic versioning, snapshots,
//! catch-up [subscriptions][subscription], [projections][projection] and
//! point-in-time reconstruction.
//!
//! Around that core sits the messaging-reliability substrate in
//! [reliability]: idempotency cache, inbox, outbox, dead-letter queue,
//! lease lock and scheduled-message queue. Every store is a trait seam
//! backed by a volatile in-memory reference implementation; distributed
//! adapters implement the same contracts with the same semantics.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod event;
pub mod mediator;
pub mod message;
pub mod projection;
pub mod reliability;
pub mod resilience;
pub mod scenario;
pub mod serde;
pub mod snapshot;
pub mod subscription;
pub mod tracing;
pub mod version;

pub use crate::aggregate::Aggregate;
pub use crate::config::Config;
pub use crate::error::{Code, Error};
pub use crate::mediator::Mediator;
pub use crate::message::Message;
pub use crate::version::Version;
