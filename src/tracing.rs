//! Module containing some extension traits to support code instrumentation
//! using the `tracing` crate.

use std::fmt::{Debug, Display};
use std::marker::PhantomData;

use async_trait::async_trait;
use tracing::instrument;

use crate::aggregate::repository::{self, Repository};
use crate::aggregate::{Aggregate, Root};
use crate::event::store::{AppendError, Appender, Streamer};
use crate::event::{Envelope, SequenceSelect, StreamId, VersionSelect};
use crate::version::Version;
use crate::{event, message, version};

/// [`event::Store`] type wrapper that provides instrumentation
/// features through the `tracing` crate.
#[derive(Debug, Clone)]
pub struct InstrumentedEventStore<T, Evt>
where
    T: event::Store<Evt>,
    Evt: message::Message + Send + Sync,
{
    store: T,
    event: PhantomData<Evt>,
}

#[async_trait]
impl<T, Evt> Streamer<Evt> for InstrumentedEventStore<T, Evt>
where
    T: event::Store<Evt>,
    Evt: message::Message + Send + Sync,
    <T as Streamer<Evt>>::Error: Debug + Send + Sync,
{
    type Error = <T as Streamer<Evt>>::Error;

    #[instrument(name = "event::Store.stream", skip(self))]
    fn stream(&self, id: &StreamId, select: VersionSelect) -> event::Stream<Evt, Self::Error> {
        self.store.stream(id, select)
    }

    #[instrument(name = "event::Store.stream_all", skip(self))]
    fn stream_all(&self, select: SequenceSelect) -> event::Stream<Evt, Self::Error> {
        self.store.stream_all(select)
    }

    #[instrument(name = "event::Store.stream_version", ret, skip(self))]
    async fn stream_version(&self, id: &StreamId) -> Result<Version, Self::Error> {
        self.store.stream_version(id).await
    }
}

#[async_trait]
impl<T, Evt> Appender<Evt> for InstrumentedEventStore<T, Evt>
where
    T: event::Store<Evt>,
    Evt: message::Message + Send + Sync,
    <T as Streamer<Evt>>::Error: Debug + Send + Sync,
{
    #[instrument(
        name = "event::Store.append",
        ret,
        err,
        skip(self, events),
        fields(events = events.len())
    )]
    async fn append(
        &self,
        id: StreamId,
        version_check: version::Check,
        events: Vec<Envelope<Evt>>,
    ) -> Result<Version, AppendError> {
        self.store.append(id, version_check, events).await
    }
}

/// Extension trait for any [`event::Store`] type to provide
/// instrumentation features through the `tracing` crate.
pub trait EventStoreExt<Evt>: event::Store<Evt> + Sized
where
    Evt: message::Message + Send + Sync,
{
    /// Returns an instrumented version of the [`event::Store`] instance.
    fn with_tracing(self) -> InstrumentedEventStore<Self, Evt> {
        InstrumentedEventStore {
            store: self,
            event: PhantomData,
        }
    }
}

impl<T, Evt> EventStoreExt<Evt> for T
where
    T: event::Store<Evt>,
    Evt: message::Message + Send + Sync,
{
}

/// [Repository] type wrapper that provides instrumentation
/// features through the `tracing` crate.
#[derive(Debug, Clone)]
pub struct InstrumentedRepository<T, R, Inner>
where
    T: Aggregate,
    R: Root<T>,
    Inner: Repository<T, R>,
{
    inner: Inner,
    aggregate: PhantomData<T>,
    root: PhantomData<R>,
}

#[async_trait]
impl<T, R, Inner> Repository<T, R> for InstrumentedRepository<T, R, Inner>
where
    T: Aggregate,
    T::Id: Debug,
    R: Root<T> + Debug,
    Inner: Repository<T, R>,
    Inner::GetError: Debug + Display,
    Inner::SaveError: Display,
{
    type GetError = Inner::GetError;
    type SaveError = Inner::SaveError;

    #[instrument(name = "aggregate::Repository.get", ret, err, skip(self))]
    async fn get(&self, id: &T::Id) -> Result<R, repository::GetError<Self::GetError>> {
        self.inner.get(id).await
    }

    #[instrument(
        name = "aggregate::Repository.save",
        err,
        skip(self, root),
        fields(aggregate_id = ?root.aggregate_id())
    )]
    async fn save(&self, root: &mut R) -> Result<(), Self::SaveError> {
        self.inner.save(root).await
    }
}

/// Extension trait for any [Repository] type to provide
/// instrumentation features through the `tracing` crate.
pub trait RepositoryExt<T, R>: Repository<T, R> + Sized
where
    T: Aggregate,
    R: Root<T>,
{
    /// Returns an instrumented version of the [Repository] instance.
    fn with_tracing(self) -> InstrumentedRepository<T, R, Self> {
        InstrumentedRepository {
            inner: self,
            aggregate: PhantomData,
            root: PhantomData,
        }
    }
}

impl<T, R, I> RepositoryExt<T, R> for I
where
    T: Aggregate,
    R: Root<T>,
    I: Repository<T, R>,
{
}
