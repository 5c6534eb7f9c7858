//! The dead-letter queue: a FIFO of messages whose processing failed,
//! retaining the failure code and attempt count for later inspection or
//! re-processing.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{Code, Error};
use crate::mediator::{Context, EventHandler};
use crate::message::{Envelope, Message};

/// The failure recorded with a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInfo {
    /// The stable code of the failure.
    pub code: Code,
    /// The human-readable failure message.
    pub message: String,
    /// Number of attempts performed before the message was dead-lettered.
    pub attempts: u32,
}

impl From<&Error> for FailureInfo {
    fn from(error: &Error) -> Self {
        Self {
            code: error.code(),
            message: error.message().to_owned(),
            attempts: error.attempts().unwrap_or(1),
        }
    }
}

/// A dead-lettered message.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<M> {
    /// The message whose processing failed.
    pub message: M,
    /// The failure that dead-lettered the message.
    pub error: FailureInfo,
    /// The instant the message was dead-lettered at.
    pub enqueued_at: DateTime<Utc>,
}

/// Interface to enqueue and consume dead-lettered messages, FIFO.
#[async_trait]
pub trait Queue<M>: Send + Sync
where
    M: Send + Sync,
{
    /// The error type returned by the concrete implementation.
    type Error: Send + Sync;

    /// Appends a failed message to the back of the queue.
    async fn enqueue(&self, message: M, error: &Error) -> Result<(), Self::Error>;

    /// Removes and returns the oldest dead-lettered message, if any.
    async fn dequeue(&self) -> Result<Option<Entry<M>>, Self::Error>;

    /// Returns up to `limit` entries from the front of the queue
    /// without consuming them.
    async fn peek(&self, limit: usize) -> Result<Vec<Entry<M>>, Self::Error>;
}

/// In-memory implementation of the dead-letter [Queue] trait.
#[derive(Debug, Clone)]
pub struct InMemory<M> {
    backend: Arc<Mutex<VecDeque<Entry<M>>>>,
}

impl<M> Default for InMemory<M> {
    fn default() -> Self {
        Self {
            backend: Arc::default(),
        }
    }
}

impl<M> InMemory<M> {
    /// Number of dead-lettered messages currently queued.
    pub fn len(&self) -> usize {
        self.backend.lock().len()
    }

    /// Reports whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.backend.lock().is_empty()
    }
}

#[async_trait]
impl<M> Queue<M> for InMemory<M>
where
    M: Clone + Send + Sync,
{
    type Error = Infallible;

    async fn enqueue(&self, message: M, error: &Error) -> Result<(), Self::Error> {
        self.backend.lock().push_back(Entry {
            message,
            error: FailureInfo::from(error),
            enqueued_at: Utc::now(),
        });

        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Entry<M>>, Self::Error> {
        Ok(self.backend.lock().pop_front())
    }

    async fn peek(&self, limit: usize) -> Result<Vec<Entry<M>>, Self::Error> {
        Ok(self.backend.lock().iter().take(limit).cloned().collect())
    }
}

/// [EventHandler] decorator forwarding failed events to a dead-letter
/// [Queue].
///
/// The failure still surfaces to the publisher, which logs it without
/// failing the publish call under the default policy.
#[derive(Debug, Clone)]
pub struct Interceptor<H, Q> {
    inner: H,
    queue: Q,
}

impl<H, Q> Interceptor<H, Q> {
    /// Wraps the handler, dead-lettering the events it fails on.
    pub fn new(inner: H, queue: Q) -> Self {
        Self { inner, queue }
    }
}

#[async_trait]
impl<T, H, Q> EventHandler<T> for Interceptor<H, Q>
where
    T: Message + Clone + Send + Sync + 'static,
    H: EventHandler<T>,
    Q: Queue<Envelope<T>>,
    <Q as Queue<Envelope<T>>>::Error: std::fmt::Debug,
{
    async fn handle(&self, event: Envelope<T>, ctx: &Context) -> Result<(), Error> {
        match self.inner.handle(event.clone(), ctx).await {
            Ok(()) => Ok(()),
            Err(error) => {
                if let Err(enqueue_error) = self.queue.enqueue(event, &error).await {
                    tracing::error!(
                        error = ?enqueue_error,
                        "failed to dead-letter the event",
                    );
                }

                Err(error)
            },
        }
    }
}
