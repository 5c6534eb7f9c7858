//! The transactional outbox: messages to publish are recorded as pending
//! entries, and a [Relay] delivers them through a [Publisher], confirming
//! each one so delivery survives publisher crashes.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::message;

/// The delivery state of an outbox [Entry]. Publishing is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The entry is waiting to be published.
    Pending,
    /// The entry has been published and confirmed.
    Published,
}

/// A message recorded in the outbox for later publication.
///
/// The payload is opaque bytes produced through the
/// [Serde][crate::serde::Serde] seam; the message name carries the type tag
/// consumers use to decode it.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// The id of the recorded message.
    pub id: message::Id,
    /// The stable name of the message type.
    pub message_name: String,
    /// The serialised message payload.
    pub payload: Vec<u8>,
    /// The instant the entry was recorded at.
    pub created_at: DateTime<Utc>,
    /// The delivery state of the entry.
    pub state: State,
    /// The instant the entry was confirmed published at, if it has been.
    pub published_at: Option<DateTime<Utc>>,
}

impl Entry {
    /// Creates a new [State::Pending] entry recorded now.
    pub fn new(id: message::Id, message_name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id,
            message_name: message_name.into(),
            payload,
            created_at: Utc::now(),
            state: State::Pending,
            published_at: None,
        }
    }
}

/// All possible error types returned by [Store::mark_published].
#[derive(Debug, thiserror::Error)]
pub enum MarkError {
    /// No entry with the given id exists in the outbox.
    #[error("outbox entry {0} does not exist")]
    NotFound(message::Id),

    /// The [Store] implementation has encountered an error.
    #[error("failed to mark outbox entry as published: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Interface to record and confirm outbox entries.
///
/// Operations on a single entry are atomic; publishers poll
/// [pending][Store::pending] and confirm each delivery with
/// [mark_published][Store::mark_published].
#[async_trait]
pub trait Store: Send + Sync {
    /// The error type returned by the concrete implementation.
    type Error: Send + Sync;

    /// Records a new [Entry].
    async fn add(&self, entry: Entry) -> Result<(), Self::Error>;

    /// Returns up to `limit` [State::Pending] entries, oldest first.
    async fn pending(&self, limit: usize) -> Result<Vec<Entry>, Self::Error>;

    /// Marks the entry as published. The transition is terminal.
    async fn mark_published(&self, id: message::Id) -> Result<(), MarkError>;
}

/// In-memory implementation of the outbox [Store] trait.
#[derive(Debug, Clone, Default)]
pub struct InMemory {
    backend: Arc<RwLock<Vec<Entry>>>,
}

#[async_trait]
impl Store for InMemory {
    type Error = Infallible;

    async fn add(&self, entry: Entry) -> Result<(), Self::Error> {
        self.backend.write().push(entry);

        Ok(())
    }

    async fn pending(&self, limit: usize) -> Result<Vec<Entry>, Self::Error> {
        Ok(self
            .backend
            .read()
            .iter()
            .filter(|entry| entry.state == State::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: message::Id) -> Result<(), MarkError> {
        let mut backend = self.backend.write();

        let entry = backend
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or(MarkError::NotFound(id))?;

        if entry.state == State::Pending {
            entry.state = State::Published;
            entry.published_at = Some(Utc::now());
        }

        Ok(())
    }
}

/// A software component able to deliver outbox entries to their destination,
/// such as a message broker adapter.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Delivers a single [Entry].
    async fn publish(&self, entry: Entry) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Publisher for F
where
    F: Send + Sync + Fn(Entry) -> Fut,
    Fut: Send + std::future::Future<Output = anyhow::Result<()>>,
{
    async fn publish(&self, entry: Entry) -> anyhow::Result<()> {
        self(entry).await
    }
}

/// Polls the outbox for pending entries and delivers them through a
/// [Publisher], confirming each successful delivery.
///
/// Failed deliveries stay pending and are retried on the next poll.
#[derive(Debug)]
pub struct Relay<S, P> {
    store: S,
    publisher: P,
    batch_size: usize,
}

impl<S, P> Relay<S, P>
where
    S: Store,
    P: Publisher,
{
    /// Creates a new [Relay] over the given store and publisher.
    pub fn new(store: S, publisher: P) -> Self {
        Self {
            store,
            publisher,
            batch_size: crate::config::DEFAULT_BATCH_SIZE,
        }
    }

    /// Overrides the number of entries delivered per poll.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Delivers one batch of pending entries.
    ///
    /// Returns the number of entries confirmed published in this poll.
    pub async fn drain(&self) -> Result<usize, S::Error> {
        let pending = self.store.pending(self.batch_size).await?;
        let mut published = 0;

        for entry in pending {
            let id = entry.id;
            let message_name = entry.message_name.clone();

            match self.publisher.publish(entry).await {
                Ok(()) => {
                    if let Err(err) = self.store.mark_published(id).await {
                        tracing::error!(message_id = %id, error = %err, "published entry vanished from the outbox");
                    } else {
                        published += 1;
                    }
                },
                Err(err) => {
                    tracing::warn!(
                        message_id = %id,
                        message_name = %message_name,
                        error = %err,
                        "outbox delivery failed, entry stays pending",
                    );
                },
            }
        }

        Ok(published)
    }

    /// Polls [drain][Relay::drain] on the given interval until cancelled.
    pub async fn run(
        &self,
        poll_interval: Duration,
        token: CancellationToken,
    ) -> Result<(), S::Error> {
        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            self.drain().await?;

            tokio::select! {
                () = token.cancelled() => return Ok(()),
                () = tokio::time::sleep(poll_interval) => {},
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn entry(name: &str) -> Entry {
        Entry::new(message::Id::next(), name, name.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn pending_entries_are_returned_oldest_first() {
        let outbox = InMemory::default();

        let first = entry("OrderWasCreated");
        let second = entry("OrderItemWasAdded");

        outbox.add(first.clone()).await.unwrap();
        outbox.add(second.clone()).await.unwrap();

        let pending = outbox.pending(10).await.unwrap();
        assert_eq!(vec![first.id, second.id], pending.iter().map(|e| e.id).collect::<Vec<_>>());

        let limited = outbox.pending(1).await.unwrap();
        assert_eq!(1, limited.len());
    }

    #[tokio::test]
    async fn publishing_is_terminal() {
        let outbox = InMemory::default();

        let recorded = entry("OrderWasCreated");
        outbox.add(recorded.clone()).await.unwrap();

        outbox.mark_published(recorded.id).await.unwrap();

        assert!(outbox.pending(10).await.unwrap().is_empty());

        let published = outbox.backend.read()[0].clone();
        assert_eq!(State::Published, published.state);
        assert!(published.published_at.is_some());
    }

    #[tokio::test]
    async fn unknown_entries_cannot_be_marked() {
        let outbox = InMemory::default();

        let error = outbox
            .mark_published(message::Id::next())
            .await
            .expect_err("the entry does not exist");

        assert!(matches!(error, MarkError::NotFound(_)));
    }

    #[tokio::test]
    async fn the_relay_confirms_successful_deliveries_and_retries_failures() {
        let outbox = InMemory::default();

        let poisoned = entry("poisoned");
        outbox.add(entry("OrderWasCreated")).await.unwrap();
        outbox.add(poisoned.clone()).await.unwrap();

        let deliveries = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&deliveries);

        let relay = Relay::new(outbox.clone(), move |delivered: Entry| {
            let sink = Arc::clone(&sink);
            async move {
                if delivered.message_name == "poisoned" {
                    anyhow::bail!("the broker refused the message");
                }

                sink.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let published = relay.drain().await.unwrap();
        assert_eq!(1, published);
        assert_eq!(1, deliveries.load(Ordering::SeqCst));

        // The failed entry stays pending for the next poll.
        let pending = outbox.pending(10).await.unwrap();
        assert_eq!(vec![poisoned.id], pending.iter().map(|e| e.id).collect::<Vec<_>>());
    }
}
