//! The inbox: de-duplicates inbound messages by id, first write wins.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::message;

/// An inbound message recorded by the inbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<M> {
    /// The id of the inbound message.
    pub message_id: message::Id,
    /// The message payload.
    pub payload: M,
    /// The instant the message was first observed at.
    pub arrived_at: DateTime<Utc>,
}

/// Interface to record inbound messages exactly once.
#[async_trait]
pub trait Store<M>: Send + Sync
where
    M: Send + Sync,
{
    /// The error type returned by the concrete implementation.
    type Error: Send + Sync;

    /// Records the message under its id. The first write wins: later calls
    /// with the same id return `false` and leave the recorded entry intact.
    async fn try_add(&self, id: message::Id, payload: M) -> Result<bool, Self::Error>;

    /// Reports whether a message with the given id has been recorded.
    async fn contains(&self, id: message::Id) -> Result<bool, Self::Error>;
}

/// In-memory implementation of the inbox [Store] trait.
#[derive(Debug, Clone)]
pub struct InMemory<M> {
    backend: Arc<RwLock<HashMap<message::Id, Entry<M>>>>,
}

impl<M> Default for InMemory<M> {
    fn default() -> Self {
        Self {
            backend: Arc::default(),
        }
    }
}

#[async_trait]
impl<M> Store<M> for InMemory<M>
where
    M: Send + Sync,
{
    type Error = Infallible;

    async fn try_add(&self, id: message::Id, payload: M) -> Result<bool, Self::Error> {
        let mut backend = self.backend.write();

        if backend.contains_key(&id) {
            return Ok(false);
        }

        backend.insert(
            id,
            Entry {
                message_id: id,
                payload,
                arrived_at: Utc::now(),
            },
        );

        Ok(true)
    }

    async fn contains(&self, id: message::Id) -> Result<bool, Self::Error> {
        Ok(self.backend.read().contains_key(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn the_first_write_wins() {
        let inbox = InMemory::<&'static str>::default();
        let id = message::Id::next();

        assert!(inbox.try_add(id, "first").await.unwrap());
        assert!(!inbox.try_add(id, "second").await.unwrap());
        assert!(inbox.contains(id).await.unwrap());

        // The recorded payload is the first one.
        assert_eq!("first", inbox.backend.read().get(&id).unwrap().payload);
    }

    #[tokio::test]
    async fn distinct_ids_are_admitted() {
        let inbox = InMemory::<&'static str>::default();

        assert!(inbox.try_add(message::Id::next(), "a").await.unwrap());
        assert!(inbox.try_add(message::Id::next(), "b").await.unwrap());
    }
}
