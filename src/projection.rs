//! Contains support for Projections: named read models built by reducing
//! the events of the store into derived state, with their progress tracked
//! in a checkpoint store so they can resume and be rebuilt from scratch.

use std::marker::PhantomData;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};

use crate::event::store::Streamer;
use crate::event::{Persisted, SequenceSelect};
use crate::message;

/// A Projection is an optimized read model (or materialized view)
/// of one or more Event Streams, assembled by left-folding its previous
/// state and a number of ordered, consecutive events.
#[async_trait]
pub trait Projection: Send + Sync {
    /// The Domain Event type reduced by this Projection.
    type Event: message::Message + Send + Sync;

    /// The unique name of the Projection, keying its checkpoint.
    fn name(&self) -> &str;

    /// Updates the Projection state using the provided event.
    async fn project(&self, event: Persisted<Self::Event>) -> anyhow::Result<()>;

    /// Clears the derived state, so the Projection can be rebuilt by
    /// replaying the whole store.
    async fn reset(&self) -> anyhow::Result<()>;
}

pub mod checkpoint {
    //! The mapping from projection name to the last processed global
    //! position.

    use std::collections::HashMap;
    use std::convert::Infallible;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::RwLock;

    use crate::event::SequenceNumber;

    /// Interface to persist the progress of named Projections.
    #[async_trait]
    pub trait Store: Send + Sync {
        /// The error type returned by the concrete implementation.
        type Error: Send + Sync;

        /// Returns the last processed global position of the named
        /// projection, 0 if it has never run.
        async fn get(&self, name: &str) -> Result<SequenceNumber, Self::Error>;

        /// Records the last processed global position of the named projection.
        async fn save(&self, name: &str, position: SequenceNumber) -> Result<(), Self::Error>;
    }

    /// In-memory implementation of the checkpoint [Store] trait.
    #[derive(Debug, Clone, Default)]
    pub struct InMemory {
        backend: Arc<RwLock<HashMap<String, SequenceNumber>>>,
    }

    #[async_trait]
    impl Store for InMemory {
        type Error = Infallible;

        async fn get(&self, name: &str) -> Result<SequenceNumber, Self::Error> {
            Ok(self.backend.read().get(name).copied().unwrap_or_default())
        }

        async fn save(&self, name: &str, position: SequenceNumber) -> Result<(), Self::Error> {
            self.backend.write().insert(name.to_owned(), position);

            Ok(())
        }
    }
}

/// All possible error types returned by [`Projector::run_once`].
#[derive(Debug, thiserror::Error)]
pub enum ProjectError<StreamErr, CheckpointErr> {
    /// The Event Store failed while streaming the global order.
    #[error("event store failed while streaming events: {0}")]
    Stream(#[source] StreamErr),

    /// The checkpoint store failed while loading or saving progress.
    #[error("failed to persist projection checkpoint: {0}")]
    Checkpoint(#[source] CheckpointErr),

    /// The projection reset failed during a rebuild.
    #[error("projection failed to reset: {0}")]
    Reset(#[source] anyhow::Error),
}

/// Couples a [Projection] with an Event Store and a
/// [checkpoint Store][checkpoint::Store], feeding it the global order of
/// events from its last recorded position.
#[derive(Debug)]
pub struct Projector<P, S, C>
where
    P: Projection,
    S: Streamer<P::Event>,
    C: checkpoint::Store,
{
    projection: P,
    store: S,
    checkpoints: C,
    batch_size: usize,
    evt: PhantomData<P::Event>,
}

impl<P, S, C> Projector<P, S, C>
where
    P: Projection,
    S: Streamer<P::Event>,
    <S as Streamer<P::Event>>::Error: Send + Sync,
    C: checkpoint::Store,
{
    /// Creates a new [Projector] for the given [Projection].
    pub fn new(projection: P, store: S, checkpoints: C) -> Self {
        Self {
            projection,
            store,
            checkpoints,
            batch_size: crate::config::DEFAULT_BATCH_SIZE,
            evt: PhantomData,
        }
    }

    /// Overrides the number of events read from the global order per poll.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Returns the wrapped [Projection].
    pub fn projection(&self) -> &P {
        &self.projection
    }

    /// Feeds the projection one batch of events past its checkpoint.
    ///
    /// Projection failures are logged and the checkpoint still advances,
    /// so a one-off fault does not stall the read model; use
    /// [rebuild][Projector::rebuild] to recover a consistent state.
    ///
    /// Returns the number of events observed in this poll.
    pub async fn run_once(&self) -> Result<usize, ProjectError<S::Error, C::Error>> {
        let name = self.projection.name().to_owned();

        let mut position = self
            .checkpoints
            .get(&name)
            .await
            .map_err(ProjectError::Checkpoint)?;

        let batch: Vec<Persisted<P::Event>> = self
            .store
            .stream_all(SequenceSelect::From(position + 1))
            .take(self.batch_size)
            .try_collect()
            .await
            .map_err(ProjectError::Stream)?;

        let observed = batch.len();

        for event in batch {
            let sequence_number = event.sequence_number;

            if let Err(err) = self.projection.project(event).await {
                tracing::error!(
                    projection = %name,
                    position = sequence_number,
                    error = %err,
                    "projection failed, advancing past the event",
                );
            }

            position = sequence_number;
        }

        self.checkpoints
            .save(&name, position)
            .await
            .map_err(ProjectError::Checkpoint)?;

        Ok(observed)
    }

    /// Polls [run_once][Projector::run_once] until the projection is caught
    /// up with the store.
    pub async fn catch_up(&self) -> Result<(), ProjectError<S::Error, C::Error>> {
        while self.run_once().await? > 0 {}

        Ok(())
    }

    /// Clears the derived state, rewinds the checkpoint to 0 and replays
    /// the whole store, rebuilding the read model in full.
    pub async fn rebuild(&self) -> Result<(), ProjectError<S::Error, C::Error>> {
        self.projection
            .reset()
            .await
            .map_err(ProjectError::Reset)?;

        self.checkpoints
            .save(self.projection.name(), 0)
            .await
            .map_err(ProjectError::Checkpoint)?;

        self.catch_up().await
    }
}
