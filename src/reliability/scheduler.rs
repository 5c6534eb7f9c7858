//! The scheduled-message queue: messages keyed by their due time, drained
//! by a [Worker] loop that republishes them through the
//! [Mediator][crate::mediator::Mediator].

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::mediator::Mediator;
use crate::message::{self, Envelope, Message};

/// A message scheduled for later publication.
#[derive(Debug, Clone, PartialEq)]
pub struct Scheduled<M> {
    /// The id assigned to the scheduled message, used to cancel it.
    pub id: message::Id,
    /// The message to publish once due.
    pub message: M,
    /// The instant the message becomes due at.
    pub due_at: DateTime<Utc>,
}

/// Interface to schedule, cancel and drain time-keyed messages.
#[async_trait]
pub trait Queue<M>: Send + Sync
where
    M: Send + Sync,
{
    /// The error type returned by the concrete implementation.
    type Error: Send + Sync;

    /// Schedules the message for publication at `due_at`, returning the id
    /// to use for cancellation.
    async fn schedule(&self, message: M, due_at: DateTime<Utc>) -> Result<message::Id, Self::Error>;

    /// Cancels a scheduled message. Returns `false` when the id is unknown,
    /// already drained, or already cancelled.
    async fn cancel(&self, id: message::Id) -> Result<bool, Self::Error>;

    /// Removes and returns every message with `due_at <= now`, ordered by
    /// due time, ties broken by scheduling order.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Scheduled<M>>, Self::Error>;
}

#[derive(Debug)]
struct Backend<M> {
    entries: BTreeMap<(DateTime<Utc>, u64), Scheduled<M>>,
    index: HashMap<message::Id, (DateTime<Utc>, u64)>,
    insertions: u64,
}

impl<M> Default for Backend<M> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::default(),
            index: HashMap::default(),
            insertions: 0,
        }
    }
}

/// In-memory implementation of the scheduler [Queue] trait.
#[derive(Debug, Clone)]
pub struct InMemory<M> {
    backend: Arc<Mutex<Backend<M>>>,
}

impl<M> Default for InMemory<M> {
    fn default() -> Self {
        Self {
            backend: Arc::default(),
        }
    }
}

#[async_trait]
impl<M> Queue<M> for InMemory<M>
where
    M: Send + Sync,
{
    type Error = Infallible;

    async fn schedule(&self, message: M, due_at: DateTime<Utc>) -> Result<message::Id, Self::Error> {
        let mut backend = self.backend.lock();

        let id = message::Id::next();
        let key = (due_at, backend.insertions);
        backend.insertions += 1;

        backend.entries.insert(key, Scheduled { id, message, due_at });
        backend.index.insert(id, key);

        Ok(id)
    }

    async fn cancel(&self, id: message::Id) -> Result<bool, Self::Error> {
        let mut backend = self.backend.lock();

        match backend.index.remove(&id) {
            Some(key) => Ok(backend.entries.remove(&key).is_some()),
            None => Ok(false),
        }
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Scheduled<M>>, Self::Error> {
        let mut backend = self.backend.lock();

        let keys: Vec<(DateTime<Utc>, u64)> = backend
            .entries
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();

        let mut due = Vec::with_capacity(keys.len());

        for key in keys {
            if let Some(scheduled) = backend.entries.remove(&key) {
                backend.index.remove(&scheduled.id);
                due.push(scheduled);
            }
        }

        Ok(due)
    }
}

/// Drains due messages from a scheduler [Queue] and republishes them as
/// Events through the [Mediator].
#[derive(Debug)]
pub struct Worker<M, Q>
where
    Q: Queue<M>,
    M: Send + Sync,
{
    queue: Q,
    mediator: Mediator,
    marker: std::marker::PhantomData<fn(M)>,
}

impl<M, Q> Worker<M, Q>
where
    M: Message + Clone + Send + Sync + 'static,
    Q: Queue<M>,
{
    /// Creates a new [Worker] draining the given queue into the mediator.
    pub fn new(queue: Q, mediator: Mediator) -> Self {
        Self {
            queue,
            mediator,
            marker: std::marker::PhantomData,
        }
    }

    /// Publishes every message due by now.
    ///
    /// Returns the number of messages published in this tick.
    pub async fn tick(&self) -> Result<usize, Q::Error> {
        let due = self.queue.due(Utc::now()).await?;
        let mut published = 0;

        for scheduled in due {
            let id = scheduled.id;

            match self.mediator.publish(Envelope::from(scheduled.message)).await {
                Ok(()) => published += 1,
                Err(err) => {
                    tracing::error!(
                        scheduled_id = %id,
                        error = %err,
                        "failed to publish scheduled message",
                    );
                },
            }
        }

        Ok(published)
    }

    /// Polls [tick][Worker::tick] on the given interval until cancelled.
    pub async fn run(
        &self,
        poll_interval: Duration,
        token: CancellationToken,
    ) -> Result<(), Q::Error> {
        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            self.tick().await?;

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

    #[tokio::test]
    async fn due_messages_drain_in_due_then_insertion_order() {
        let queue = InMemory::<&'static str>::default();
        let now = Utc::now();

        queue
            .schedule("late", now + chrono::Duration::seconds(60))
            .await
            .unwrap();
        queue
            .schedule("second", now + chrono::Duration::seconds(10))
            .await
            .unwrap();
        queue
            .schedule("first", now + chrono::Duration::seconds(5))
            .await
            .unwrap();
        queue
            .schedule("second-bis", now + chrono::Duration::seconds(10))
            .await
            .unwrap();

        let due = queue
            .due(now + chrono::Duration::seconds(30))
            .await
            .unwrap();

        let messages: Vec<_> = due.iter().map(|scheduled| scheduled.message).collect();
        assert_eq!(vec!["first", "second", "second-bis"], messages);

        // Drained messages are gone; the late one is still scheduled.
        assert!(queue
            .due(now + chrono::Duration::seconds(30))
            .await
            .unwrap()
            .is_empty());

        let late = queue
            .due(now + chrono::Duration::seconds(120))
            .await
            .unwrap();
        assert_eq!(1, late.len());
        assert_eq!("late", late[0].message);
    }

    #[tokio::test]
    async fn future_messages_are_never_returned_early() {
        let queue = InMemory::<&'static str>::default();
        let now = Utc::now();

        queue
            .schedule("tomorrow", now + chrono::Duration::days(1))
            .await
            .unwrap();

        assert!(queue.due(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_messages_are_not_drained() {
        let queue = InMemory::<&'static str>::default();
        let now = Utc::now();

        let id = queue.schedule("cancelled", now).await.unwrap();
        queue.schedule("kept", now).await.unwrap();

        assert!(queue.cancel(id).await.unwrap());
        assert!(!queue.cancel(id).await.unwrap());

        let due = queue.due(now).await.unwrap();
        assert_eq!(1, due.len());
        assert_eq!("kept", due[0].message);
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct ReminderDue {
        note: &'static str,
    }

    impl Message for ReminderDue {
        fn name(&self) -> &'static str {
            "ReminderDue"
        }
    }

    #[tokio::test]
    async fn the_worker_republishes_due_messages_through_the_mediator() {
        let deliveries = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&deliveries);

        let mediator = Mediator::builder()
            .subscribe::<ReminderDue, _>(move |_: Envelope<ReminderDue>| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build()
            .expect("the registry should build");

        let queue = InMemory::<ReminderDue>::default();
        queue
            .schedule(ReminderDue { note: "now" }, Utc::now())
            .await
            .unwrap();
        queue
            .schedule(
                ReminderDue { note: "later" },
                Utc::now() + chrono::Duration::days(1),
            )
            .await
            .unwrap();

        let worker = Worker::new(queue, mediator);

        let published = worker.tick().await.unwrap();
        assert_eq!(1, published);
        assert_eq!(1, deliveries.load(Ordering::SeqCst));
    }
}
