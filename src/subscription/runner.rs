//! The catch-up [Runner]: drives a persistent [Subscription] over the global
//! order of an Event Store, delivering matching events to its
//! [Processor][super::Processor] and checkpointing progress after every
//! observed position.

use std::marker::PhantomData;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

use crate::event::store::Streamer;
use crate::event::{Persisted, SequenceNumber, SequenceSelect};
use crate::message;
use crate::subscription::{Processor, Status, Store};

/// What a [Runner] does with the subscription checkpoint when the
/// processor fails on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointStrategy {
    /// Log the failure and advance past the event, so a one-off processor
    /// bug does not stall the subscription.
    #[default]
    AdvanceAndLog,

    /// Persist the last good position and stop, surfacing the failure:
    /// the next run retries the same event.
    Halt,
}

/// All possible error types returned by [`Runner::run_once`] and [`Runner::run`].
#[derive(Debug, thiserror::Error)]
pub enum RunError<StreamErr, StoreErr> {
    /// The named subscription is not registered in the subscription store.
    #[error("subscription '{0}' is not registered")]
    UnknownSubscription(String),

    /// Another runner already holds the claim for this subscription name.
    #[error("subscription '{0}' already has a live runner")]
    AlreadyClaimed(String),

    /// The Event Store failed while streaming the global order.
    #[error("event store failed while streaming events: {0}")]
    Stream(#[source] StreamErr),

    /// The subscription store failed while loading or saving progress.
    #[error("failed to persist subscription progress: {0}")]
    Store(#[source] StoreErr),

    /// The processor failed and the [CheckpointStrategy::Halt] strategy
    /// stopped the run at the failed position.
    #[error("processor failed at position {position}: {source}")]
    Processor {
        /// The global position of the event the processor failed on.
        position: SequenceNumber,
        /// The processor failure.
        #[source]
        source: anyhow::Error,
    },
}

/// Drives one named, persistent [Subscription] over an Event Store.
///
/// Each poll reads a batch from the global order past the recorded position,
/// delivers the events whose stream matches the subscription pattern to the
/// processor, and advances the position over every observed event --
/// matching or not -- so the next poll resumes where this one left off.
#[derive(Debug)]
pub struct Runner<Evt, S, C, P>
where
    Evt: message::Message + Send + Sync,
    S: Streamer<Evt>,
    C: Store,
    P: Processor<Evt>,
{
    name: String,
    store: S,
    subscriptions: C,
    processor: P,
    batch_size: usize,
    strategy: CheckpointStrategy,
    evt: PhantomData<Evt>,
}

impl<Evt, S, C, P> Runner<Evt, S, C, P>
where
    Evt: message::Message + Send + Sync,
    S: Streamer<Evt>,
    <S as Streamer<Evt>>::Error: Send + Sync,
    C: Store,
    P: Processor<Evt>,
{
    /// Creates a new [Runner] for the named subscription.
    pub fn new(name: impl Into<String>, store: S, subscriptions: C, processor: P) -> Self {
        Self {
            name: name.into(),
            store,
            subscriptions,
            processor,
            batch_size: crate::config::DEFAULT_BATCH_SIZE,
            strategy: CheckpointStrategy::default(),
            evt: PhantomData,
        }
    }

    /// Overrides the number of events read from the global order per poll.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Overrides the [CheckpointStrategy] applied on processor failures.
    #[must_use]
    pub fn with_strategy(mut self, strategy: CheckpointStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Performs a single catch-up poll.
    ///
    /// Returns the number of events processed successfully in this poll.
    /// Paused subscriptions observe nothing and return 0.
    pub async fn run_once(&self) -> Result<usize, RunError<S::Error, C::Error>> {
        let mut subscription = self
            .subscriptions
            .load(&self.name)
            .await
            .map_err(RunError::Store)?
            .ok_or_else(|| RunError::UnknownSubscription(self.name.clone()))?;

        if subscription.status == Status::Paused {
            return Ok(0);
        }

        let batch: Vec<Persisted<Evt>> = self
            .store
            .stream_all(SequenceSelect::From(subscription.position + 1))
            .take(self.batch_size)
            .try_collect()
            .await
            .map_err(RunError::Stream)?;

        let mut processed = 0;

        for event in batch {
            let position = event.sequence_number;

            if subscription.pattern.matches(&event.stream_id) {
                match self.processor.process(event).await {
                    Ok(()) => {
                        subscription.processed += 1;
                        processed += 1;
                    },
                    Err(err) => match self.strategy {
                        CheckpointStrategy::AdvanceAndLog => {
                            tracing::error!(
                                subscription = %self.name,
                                position,
                                error = %err,
                                "processor failed, advancing past the event",
                            );
                        },
                        CheckpointStrategy::Halt => {
                            // Persist the last good position so the next
                            // run retries from the failed event.
                            self.subscriptions
                                .save(subscription)
                                .await
                                .map_err(RunError::Store)?;

                            return Err(RunError::Processor {
                                position,
                                source: err,
                            });
                        },
                    },
                }
            }

            subscription.position = position;
        }

        self.subscriptions
            .save(subscription)
            .await
            .map_err(RunError::Store)?;

        Ok(processed)
    }

    /// Runs the subscription until cancelled: polls with [`run_once`],
    /// sleeping `poll_interval` whenever the subscription is caught up.
    ///
    /// The subscription name is claimed for the duration of the run, so a
    /// second concurrent runner for the same name is refused.
    ///
    /// [`run_once`]: Runner::run_once
    pub async fn run(
        &self,
        poll_interval: Duration,
        token: CancellationToken,
    ) -> Result<(), RunError<S::Error, C::Error>> {
        if !self
            .subscriptions
            .claim(&self.name)
            .await
            .map_err(RunError::Store)?
        {
            return Err(RunError::AlreadyClaimed(self.name.clone()));
        }

        let result = self.run_claimed(poll_interval, &token).await;

        self.subscriptions
            .release(&self.name)
            .await
            .map_err(RunError::Store)?;

        result
    }

    async fn run_claimed(
        &self,
        poll_interval: Duration,
        token: &CancellationToken,
    ) -> Result<(), RunError<S::Error, C::Error>> {
        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            let processed = self.run_once().await?;

            if processed == 0 {
                tokio::select! {
                    () = token.cancelled() => return Ok(()),
                    () = tokio::time::sleep(poll_interval) => {},
                }
            }
        }
    }
}
