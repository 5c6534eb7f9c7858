//! Module containing the definition of a [Repository], to fetch and store
//! Aggregate Roots from an Event [Store][crate::event::Store].
//!
//! Two implementations are provided: [EventSourced], which rehydrates
//! Aggregates by replaying their whole Event Stream, and [Snapshotting],
//! which seeds the replay from the newest recorded Snapshot and also
//! supports point-in-time reconstruction.

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::TryStreamExt;

use crate::aggregate::{self, Aggregate, Context, Root};
use crate::event::store::{AppendError, Appender, Streamer};
use crate::serde::Serde;
use crate::version::Version;
use crate::{event, snapshot, version};

/// Error returned by a call to [Repository::get].
/// This type is used to check whether an Aggregate Root has been found or not.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum GetError<I> {
    /// This error is returned by [Repository::get] when the
    /// desired Aggregate [Root] could not be found in the data store.
    #[error("aggregate root was not found")]
    NotFound,

    /// Error variant returned by [Repository::get] when the underlying
    /// concrete implementation has encountered an error.
    #[error("failed to get aggregate root: {0}")]
    Inner(#[from] I),
}

/// This error is returned while rehydrating an Aggregate [Root]
/// from its Event Stream.
#[derive(Debug, thiserror::Error)]
pub enum RehydrateError<R, S> {
    /// The [Aggregate] returned an error while applying a Domain Event
    /// during the _rehydration_ phase.
    ///
    /// This usually implies the Event Stream for the Aggregate
    /// contains corrupted or unexpected data.
    #[error("failed to rehydrate aggregate from event stream: {0}")]
    Rehydrate(#[source] R),

    /// The Event [Store][event::Store] returned an unexpected error
    /// while streaming back the Aggregate's Event Stream.
    #[error("event store failed while streaming events: {0}")]
    Stream(#[source] S),
}

/// A Repository is an object that allows to load and save
/// an [Aggregate Root][Root] from and to a persistent data store.
#[async_trait]
pub trait Repository<T, R>: Send + Sync
where
    T: Aggregate,
    R: Root<T>,
{
    /// Error type returned by the concrete implementation of the trait.
    /// It is returned in [get][Repository::get] using [GetError::Inner].
    type GetError: Send + Sync;

    /// Error type returned by the concrete implementation of the trait.
    type SaveError: Send + Sync;

    /// Loads an Aggregate Root instance from the data store,
    /// referenced by its unique identifier.
    async fn get(&self, id: &T::Id) -> Result<R, GetError<Self::GetError>>;

    /// Saves a new version of an Aggregate Root instance to the data store.
    ///
    /// On success, the uncommitted events buffered by the Root have been
    /// appended to its Event Stream and the buffer has been drained.
    async fn save(&self, root: &mut R) -> Result<(), Self::SaveError>;
}

async fn rehydrate<T, S>(
    store: &S,
    id: &event::StreamId,
    select: event::VersionSelect,
    up_to: Option<Version>,
    seed: Option<Context<T>>,
) -> Result<Option<Context<T>>, RehydrateError<T::Error, S::Error>>
where
    T: Aggregate,
    S: Streamer<T::Event>,
{
    store
        .stream(id, select)
        .try_take_while(|persisted| {
            let keep = up_to.map_or(true, |v| persisted.version <= v);
            futures::future::ready(Ok(keep))
        })
        .map_ok(|persisted| persisted.event)
        .map_err(RehydrateError::Stream)
        .try_fold(seed, |ctx: Option<Context<T>>, event| async {
            let new_ctx_result = match ctx {
                None => Context::rehydrate_from(event),
                Some(ctx) => ctx.apply_rehydrated_event(event),
            };

            Ok(Some(new_ctx_result.map_err(RehydrateError::Rehydrate)?))
        })
        .await
}

async fn append_uncommitted<T, R, S>(store: &S, root: &mut R) -> Result<(), AppendError>
where
    T: Aggregate,
    R: Root<T>,
    S: Appender<T::Event>,
{
    let events_to_commit = root.ctx_mut().take_uncommitted_events();

    if events_to_commit.is_empty() {
        return Ok(());
    }

    let stream_id = aggregate::stream_id::<T>(root.aggregate_id());
    let expected_version = root.version() - (events_to_commit.len() as Version);

    store
        .append(
            stream_id,
            version::Check::MustBe(expected_version),
            events_to_commit,
        )
        .await?;

    Ok(())
}

/// An Event-sourced implementation of the [Repository] interface.
///
/// It uses an [Event Store][event::Store] instance to stream Domain Events
/// for a particular Aggregate, and append uncommitted Domain Events
/// recorded by an Aggregate Root.
#[derive(Debug, Clone)]
pub struct EventSourced<T, R, S>
where
    T: Aggregate,
    R: Root<T>,
    S: event::Store<T::Event>,
{
    store: S,
    aggregate: PhantomData<T>,
    root: PhantomData<R>,
}

impl<T, R, S> From<S> for EventSourced<T, R, S>
where
    T: Aggregate,
    R: Root<T>,
    S: event::Store<T::Event>,
{
    fn from(store: S) -> Self {
        Self {
            store,
            aggregate: PhantomData,
            root: PhantomData,
        }
    }
}

impl<T, R, S> EventSourced<T, R, S>
where
    T: Aggregate,
    R: Root<T>,
    S: event::Store<T::Event>,
    <S as Streamer<T::Event>>::Error: Send + Sync,
{
    /// Reconstructs the state of the Aggregate as it was when its Event
    /// Stream was at the specified [Version], by pure replay.
    ///
    /// Versions beyond the current stream version clamp to the current one.
    /// Returns `None` for streams that do not exist.
    pub async fn state_at_version(
        &self,
        id: &T::Id,
        version: Version,
    ) -> Result<Option<R>, RehydrateError<T::Error, <S as Streamer<T::Event>>::Error>> {
        let stream_id = aggregate::stream_id::<T>(id);

        let ctx = rehydrate::<T, S>(
            &self.store,
            &stream_id,
            event::VersionSelect::All,
            Some(version),
            None,
        )
        .await?;

        Ok(ctx.map(R::from))
    }
}

#[async_trait]
impl<T, R, S> Repository<T, R> for EventSourced<T, R, S>
where
    T: Aggregate,
    R: Root<T>,
    T::Id: Clone,
    S: event::Store<T::Event>,
    <S as Streamer<T::Event>>::Error: Send + Sync,
{
    type GetError = RehydrateError<T::Error, <S as Streamer<T::Event>>::Error>;
    type SaveError = AppendError;

    async fn get(&self, id: &T::Id) -> Result<R, GetError<Self::GetError>> {
        let stream_id = aggregate::stream_id::<T>(id);

        let ctx =
            rehydrate::<T, S>(&self.store, &stream_id, event::VersionSelect::All, None, None)
                .await
                .map_err(GetError::Inner)?;

        ctx.map(R::from).ok_or(GetError::NotFound)
    }

    async fn save(&self, root: &mut R) -> Result<(), Self::SaveError> {
        append_uncommitted::<T, R, S>(&self.store, root).await
    }
}

/// A [Repository] implementation that seeds Aggregate rehydration from the
/// newest recorded [Snapshot][snapshot::Snapshot], replaying only the events
/// appended after it.
///
/// Snapshots are opportunistic: any failure loading or decoding one falls
/// back to a full replay. New snapshots are taken on save, every
/// `interval` stream versions.
#[derive(Debug, Clone)]
pub struct Snapshotting<T, R, S, SS, Ser>
where
    T: Aggregate,
    R: Root<T>,
    S: event::Store<T::Event>,
    SS: snapshot::Store,
    Ser: Serde<T>,
{
    store: S,
    snapshots: SS,
    serde: Ser,
    interval: Version,
    aggregate: PhantomData<T>,
    root: PhantomData<R>,
}

impl<T, R, S, SS, Ser> Snapshotting<T, R, S, SS, Ser>
where
    T: Aggregate,
    R: Root<T>,
    S: event::Store<T::Event>,
    SS: snapshot::Store,
    <SS as snapshot::Store>::Error: Debug,
    Ser: Serde<T>,
    <Ser as Serde<T>>::Error: Debug,
    <S as Streamer<T::Event>>::Error: Send + Sync,
{
    /// Creates a new [Snapshotting] repository over the given Event Store
    /// and Snapshot store, taking a snapshot every `interval` versions.
    pub fn new(store: S, snapshots: SS, serde: Ser, interval: Version) -> Self {
        Self {
            store,
            snapshots,
            serde,
            interval,
            aggregate: PhantomData,
            root: PhantomData,
        }
    }

    async fn seed_at(&self, stream_id: &event::StreamId, up_to: Option<Version>) -> Option<Context<T>> {
        let loaded = match up_to {
            None => self.snapshots.load_latest(stream_id).await,
            Some(version) => self.snapshots.load_at_version(stream_id, version).await,
        };

        let snapshot = match loaded {
            Ok(snapshot) => snapshot?,
            Err(err) => {
                tracing::warn!(stream_id = %stream_id, error = ?err, "failed to load snapshot, replaying the full stream");
                return None;
            },
        };

        match self.serde.deserialize(&snapshot.payload) {
            Ok(state) => Some(Context::rehydrate_from_state(state, snapshot.version)),
            Err(err) => {
                tracing::warn!(stream_id = %stream_id, error = ?err, "failed to decode snapshot, replaying the full stream");
                None
            },
        }
    }

    async fn rehydrate_through_snapshot(
        &self,
        stream_id: &event::StreamId,
        up_to: Option<Version>,
    ) -> Result<Option<Context<T>>, RehydrateError<T::Error, <S as Streamer<T::Event>>::Error>>
    {
        let seed = self.seed_at(stream_id, up_to).await;

        let select = match &seed {
            Some(ctx) => event::VersionSelect::From(ctx.version() + 1),
            None => event::VersionSelect::All,
        };

        rehydrate::<T, S>(&self.store, stream_id, select, up_to, seed).await
    }

    /// Reconstructs the state of the Aggregate as it was when its Event
    /// Stream was at the specified [Version].
    ///
    /// The newest snapshot at or below the target version seeds the replay;
    /// versions beyond the current stream version clamp to the current one.
    /// Returns `None` for streams that do not exist.
    pub async fn state_at_version(
        &self,
        id: &T::Id,
        version: Version,
    ) -> Result<Option<R>, RehydrateError<T::Error, <S as Streamer<T::Event>>::Error>> {
        let stream_id = aggregate::stream_id::<T>(id);

        let ctx = self
            .rehydrate_through_snapshot(&stream_id, Some(version))
            .await?;

        Ok(ctx.map(R::from))
    }

    async fn take_snapshot(&self, root: &R) {
        let stream_id = aggregate::stream_id::<T>(root.aggregate_id());
        let version = root.version();

        let last_snapshot_version = match self.snapshots.load_latest(&stream_id).await {
            Ok(snapshot) => snapshot.map(|s| s.version).unwrap_or_default(),
            Err(err) => {
                tracing::warn!(stream_id = %stream_id, error = ?err, "failed to load latest snapshot, skipping snapshot");
                return;
            },
        };

        if self.interval == 0 || version < last_snapshot_version + self.interval {
            return;
        }

        let payload = match self.serde.serialize(root.state()) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(stream_id = %stream_id, error = ?err, "failed to encode snapshot, skipping snapshot");
                return;
            },
        };

        if let Err(err) = self
            .snapshots
            .save(snapshot::Snapshot::new(stream_id.clone(), version, payload))
            .await
        {
            tracing::warn!(stream_id = %stream_id, error = ?err, "failed to record snapshot");
        } else {
            tracing::debug!(stream_id = %stream_id, version, "snapshot recorded");
        }
    }
}

#[async_trait]
impl<T, R, S, SS, Ser> Repository<T, R> for Snapshotting<T, R, S, SS, Ser>
where
    T: Aggregate,
    R: Root<T>,
    T::Id: Clone,
    S: event::Store<T::Event>,
    SS: snapshot::Store,
    <SS as snapshot::Store>::Error: Debug,
    Ser: Serde<T>,
    <Ser as Serde<T>>::Error: Debug,
    <S as Streamer<T::Event>>::Error: Send + Sync,
{
    type GetError = RehydrateError<T::Error, <S as Streamer<T::Event>>::Error>;
    type SaveError = AppendError;

    async fn get(&self, id: &T::Id) -> Result<R, GetError<Self::GetError>> {
        let stream_id = aggregate::stream_id::<T>(id);

        let ctx = self
            .rehydrate_through_snapshot(&stream_id, None)
            .await
            .map_err(GetError::Inner)?;

        ctx.map(R::from).ok_or(GetError::NotFound)
    }

    async fn save(&self, root: &mut R) -> Result<(), Self::SaveError> {
        append_uncommitted::<T, R, S>(&self.store, root).await?;
        self.take_snapshot(root).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_order_domain::{Order, OrderRoot};
    use crate::event::store::InMemory;
    use crate::serde::Json;
    use crate::snapshot::Store as SnapshotStore;

    type OrderRepository = EventSourced<Order, OrderRoot, InMemory<<Order as Aggregate>::Event>>;
    type SnapshottingOrderRepository = Snapshotting<
        Order,
        OrderRoot,
        InMemory<<Order as Aggregate>::Event>,
        snapshot::InMemory,
        Json<Order>,
    >;

    #[tokio::test]
    async fn saved_roots_are_rehydrated_to_the_same_state() {
        let store = InMemory::default();
        let repository = OrderRepository::from(store);

        let mut order = OrderRoot::create("A".to_owned()).expect("order should be created");
        order.add_item(50, 2).expect("item should be added");
        order.add_item(100, 1).expect("item should be added");

        repository.save(&mut order).await.expect("save should not fail");

        let rehydrated = repository
            .get(&"A".to_owned())
            .await
            .expect("the order should be found");

        assert_eq!(3, rehydrated.version());
        assert_eq!(200, rehydrated.state().total_amount);
        assert_eq!(2, rehydrated.state().item_count);
    }

    #[tokio::test]
    async fn missing_roots_are_not_found() {
        let repository = OrderRepository::from(InMemory::default());

        let result = repository.get(&"missing".to_owned()).await;

        assert!(matches!(result, Err(GetError::NotFound)));
    }

    #[tokio::test]
    async fn saving_twice_without_changes_is_a_no_op() {
        let repository = OrderRepository::from(InMemory::default());

        let mut order = OrderRoot::create("A".to_owned()).expect("order should be created");

        repository.save(&mut order).await.expect("save should not fail");
        repository
            .save(&mut order)
            .await
            .expect("saving with an empty buffer should not fail");
    }

    #[tokio::test]
    async fn state_at_version_clamps_to_the_current_version() {
        let store = InMemory::default();
        let repository = OrderRepository::from(store);

        let mut order = OrderRoot::create("A".to_owned()).expect("order should be created");
        order.add_item(50, 2).expect("item should be added");
        repository.save(&mut order).await.expect("save should not fail");

        let at_1 = repository
            .state_at_version(&"A".to_owned(), 1)
            .await
            .expect("replay should not fail")
            .expect("the stream exists");
        assert_eq!(1, at_1.version());
        assert_eq!(0, at_1.state().total_amount);

        let beyond = repository
            .state_at_version(&"A".to_owned(), 10)
            .await
            .expect("replay should not fail")
            .expect("the stream exists");
        assert_eq!(2, beyond.version());
        assert_eq!(100, beyond.state().total_amount);

        assert!(repository
            .state_at_version(&"missing".to_owned(), 1)
            .await
            .expect("replay should not fail")
            .is_none());
    }

    #[tokio::test]
    async fn snapshotting_repository_round_trips_through_snapshots() {
        let store = InMemory::default();
        let snapshots = snapshot::InMemory::default();
        let repository = SnapshottingOrderRepository::new(
            store,
            snapshots.clone(),
            Json::default(),
            2,
        );

        let mut order = OrderRoot::create("A".to_owned()).expect("order should be created");
        order.add_item(10, 1).expect("item should be added");
        repository.save(&mut order).await.expect("save should not fail");

        // The save crossed the snapshot interval.
        let stream_id = aggregate::stream_id::<Order>(&"A".to_owned());
        let latest = snapshots
            .load_latest(&stream_id)
            .await
            .unwrap()
            .expect("a snapshot should have been recorded");
        assert_eq!(2, latest.version);

        let mut order = repository
            .get(&"A".to_owned())
            .await
            .expect("the order should be found");
        assert_eq!(2, order.version());
        assert_eq!(10, order.state().total_amount);

        order.add_item(20, 2).expect("item should be added");
        repository.save(&mut order).await.expect("save should not fail");

        let rehydrated = repository
            .get(&"A".to_owned())
            .await
            .expect("the order should be found");
        assert_eq!(3, rehydrated.version());
        assert_eq!(50, rehydrated.state().total_amount);
    }

    #[tokio::test]
    async fn snapshot_seeded_time_travel_matches_pure_replay() {
        let store = InMemory::default();
        let repository = SnapshottingOrderRepository::new(
            store.clone(),
            snapshot::InMemory::default(),
            Json::default(),
            3,
        );

        let mut order = OrderRoot::create("T".to_owned()).expect("order should be created");
        order.add_item(10, 1).expect("item should be added");
        order.add_item(20, 1).expect("item should be added");
        repository.save(&mut order).await.expect("save should not fail");

        order.add_item(30, 1).expect("item should be added");
        order.add_item(40, 1).expect("item should be added");
        repository.save(&mut order).await.expect("save should not fail");

        let snapshotted = repository
            .state_at_version(&"T".to_owned(), 4)
            .await
            .expect("replay should not fail")
            .expect("the stream exists");

        let replayed = EventSourced::<Order, OrderRoot, _>::from(store)
            .state_at_version(&"T".to_owned(), 4)
            .await
            .expect("replay should not fail")
            .expect("the stream exists");

        assert_eq!(replayed.version(), snapshotted.version());
        assert_eq!(replayed.state(), snapshotted.state());
    }
}
