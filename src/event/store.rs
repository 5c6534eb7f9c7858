//! Contains the Event [Store] trait seams and the in-memory reference
//! implementation backing the rest of the crate.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{iter, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::event::{
    Envelope, Persisted, SequenceNumber, SequenceSelect, StreamId, VersionSelect,
};
use crate::{event, message, version};

const SUBSCRIBE_CHANNEL_DEFAULT_CAP: usize = 128;

/// Interface used to stream [Persisted] Domain Events
/// from an Event Store to an application.
#[async_trait]
pub trait Streamer<Evt>: Send + Sync
where
    Evt: message::Message + Send + Sync,
{
    /// The error type returned by the Store during a [`stream`] call.
    type Error: Send + Sync;

    /// Opens an Event Stream, effectively streaming all Domain Events
    /// of an Event Stream back in the application.
    fn stream(&self, id: &StreamId, select: VersionSelect) -> event::Stream<Evt, Self::Error>;

    /// Streams [Persisted] Domain Events from every Event Stream in the
    /// Store, ordered by their global [SequenceNumber].
    ///
    /// Used by catch-up Subscriptions and Projections; bound the result with
    /// [`StreamExt::take`] to read in batches.
    fn stream_all(&self, select: SequenceSelect) -> event::Stream<Evt, Self::Error>;

    /// Returns the current [Version][version::Version] of the specified
    /// Event Stream, 0 if the stream does not exist.
    async fn stream_version(&self, id: &StreamId) -> Result<version::Version, Self::Error>;
}

/// All possible error types returned by [`Appender::append`].
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// Error returned when [`Appender::append`] encounters a conflict error
    /// while appending the new Domain Events.
    #[error("failed to append new domain events: {0}")]
    Conflict(#[from] version::ConflictError),
    /// Error returned when the [Appender] implementation has encountered an error.
    #[error("failed to append new domain events, an error occurred: {0}")]
    Internal(#[from] anyhow::Error),
}

#[async_trait]
/// Interface used to append new Domain Events in an Event Store.
pub trait Appender<Evt>: Send + Sync
where
    Evt: message::Message + Send + Sync,
{
    /// Appends new Domain Events to the specified Event Stream.
    ///
    /// The result of this operation is the new [Version][version::Version]
    /// of the Event Stream with the specified Domain Events added to it.
    ///
    /// The append is atomic per stream: either every event lands at
    /// contiguous versions, or the stream is left untouched.
    async fn append(
        &self,
        id: StreamId,
        version_check: version::Check,
        events: Vec<Envelope<Evt>>,
    ) -> Result<version::Version, AppendError>;
}

/// Interface used to receive [Persisted] Domain Events as they are appended
/// to the Event Store, from the moment of subscribing onwards.
pub trait Subscriber<Evt>: Send + Sync
where
    Evt: message::Message + Send + Sync,
{
    /// The error type returned while reading from the live stream.
    type Error: Send + Sync;

    /// Subscribes to all new events persisted in the Event Store, from
    /// the moment of calling this function, in the future.
    ///
    /// Since this is a long-running stream, make sure not to *block*
    /// or await the full computation of the stream; prefer a `while let`
    /// consumer instead.
    fn subscribe_all(&self) -> event::Stream<'static, Evt, Self::Error>;
}

/// An [Event][Envelope] Store, used to store Domain Events in Event Streams -- a stream
/// of Domain Events -- and retrieve them.
///
/// Each Event Stream is represented by a unique [StreamId].
pub trait Store<Evt>: Streamer<Evt> + Appender<Evt> + Send + Sync
where
    Evt: message::Message + Send + Sync,
{
}

impl<T, Evt> Store<Evt> for T
where
    T: Streamer<Evt> + Appender<Evt> + Send + Sync,
    Evt: message::Message + Send + Sync,
{
}

/// Error returned by the [Subscriber] implementation of [InMemory] when the
/// receiving end of the broadcast channel lagged behind the appends.
#[derive(Debug, thiserror::Error)]
#[error("failed to read event from subscription channel: receiver lagged {0} messages")]
pub struct LaggedError(u64);

#[derive(Debug)]
struct StreamCell<Evt>
where
    Evt: message::Message,
{
    events: Vec<Persisted<Evt>>,
}

impl<Evt> Default for StreamCell<Evt>
where
    Evt: message::Message,
{
    fn default() -> Self {
        Self {
            events: Vec::default(),
        }
    }
}

/// In-memory implementation of the Event [Store] traits.
///
/// Appends to the same stream serialise on a per-stream mutex; appends to
/// different streams proceed in parallel. The global log lock is held only
/// while assigning [SequenceNumber]s and pushing the batch, so readers of
/// [`Streamer::stream_all`] never observe a partially-appended batch.
#[derive(Debug, Clone)]
pub struct InMemory<Evt>
where
    Evt: message::Message,
{
    streams: Arc<RwLock<HashMap<StreamId, Arc<Mutex<StreamCell<Evt>>>>>>,
    log: Arc<RwLock<Vec<Persisted<Evt>>>>,
    tx: broadcast::Sender<Persisted<Evt>>,
}

impl<Evt> InMemory<Evt>
where
    Evt: message::Message + Clone,
{
    /// Creates a new [InMemory] Store with the specified broadcast channel
    /// capacity, used by [`Subscriber::subscribe_all`] to notify live
    /// subscribers of newly appended events.
    pub fn new(subscribe_capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(subscribe_capacity);

        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            log: Arc::new(RwLock::new(Vec::new())),
            tx,
        }
    }
}

impl<Evt> Default for InMemory<Evt>
where
    Evt: message::Message + Clone,
{
    fn default() -> Self {
        Self::new(SUBSCRIBE_CHANNEL_DEFAULT_CAP)
    }
}

#[async_trait]
impl<Evt> Streamer<Evt> for InMemory<Evt>
where
    Evt: message::Message + Clone + Send + Sync + 'static,
{
    type Error = Infallible;

    fn stream(&self, id: &StreamId, select: VersionSelect) -> event::Stream<Evt, Self::Error> {
        let events = self
            .streams
            .read()
            .get(id)
            .map(|cell| cell.lock().events.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(move |evt| match select {
                VersionSelect::All => true,
                VersionSelect::From(v) => evt.version >= v,
            });

        iter(events).map(Ok).boxed()
    }

    fn stream_all(&self, select: SequenceSelect) -> event::Stream<Evt, Self::Error> {
        // The log is in global order already: positions are assigned under
        // the same lock that pushes the batch.
        let events = self
            .log
            .read()
            .iter()
            .filter(|evt| match select {
                SequenceSelect::All => true,
                SequenceSelect::From(n) => evt.sequence_number >= n,
            })
            .cloned()
            .collect::<Vec<_>>();

        iter(events).map(Ok).boxed()
    }

    async fn stream_version(&self, id: &StreamId) -> Result<version::Version, Self::Error> {
        Ok(self
            .streams
            .read()
            .get(id)
            .and_then(|cell| cell.lock().events.last().map(|evt| evt.version))
            .unwrap_or_default())
    }
}

#[async_trait]
impl<Evt> Appender<Evt> for InMemory<Evt>
where
    Evt: message::Message + Clone + Send + Sync + 'static,
{
    async fn append(
        &self,
        id: StreamId,
        version_check: version::Check,
        events: Vec<Envelope<Evt>>,
    ) -> Result<version::Version, AppendError> {
        let span = tracing::debug_span!("event::store::InMemory.append", stream_id = %id, events = events.len());
        let _enter = span.enter();

        let cell = {
            let mut streams = self.streams.write();
            Arc::clone(streams.entry(id.clone()).or_default())
        };

        // Serialises appends to this stream; other streams stay unaffected.
        let mut cell = cell.lock();

        let last_event_stream_version = cell.events.last().map(|evt| evt.version).unwrap_or_default();

        if let version::Check::MustBe(expected) = version_check {
            if last_event_stream_version != expected {
                return Err(AppendError::Conflict(version::ConflictError {
                    expected,
                    actual: last_event_stream_version,
                }));
            }
        }

        let recorded_at = Utc::now();

        let mut persisted_events: Vec<Persisted<Evt>> = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| Persisted {
                stream_id: id.clone(),
                version: last_event_stream_version + (i as u64) + 1,
                sequence_number: 0,
                recorded_at,
                event,
            })
            .collect();

        {
            let mut log = self.log.write();
            let mut next_sequence_number = (log.len() as SequenceNumber) + 1;

            for event in &mut persisted_events {
                event.sequence_number = next_sequence_number;
                next_sequence_number += 1;
            }

            log.extend(persisted_events.iter().cloned());
        }

        let new_last_event_stream_version = persisted_events
            .last()
            .map(|evt| evt.version)
            .unwrap_or(last_event_stream_version);

        cell.events.extend(persisted_events.iter().cloned());
        drop(cell);

        // Broadcasting can only fail when no live subscriber exists,
        // which is fine: appends happen without subscriptions too.
        for event in persisted_events {
            let _ = self.tx.send(event);
        }

        Ok(new_last_event_stream_version)
    }
}

impl<Evt> Subscriber<Evt> for InMemory<Evt>
where
    Evt: message::Message + Clone + Send + Sync + 'static,
{
    type Error = LaggedError;

    fn subscribe_all(&self) -> event::Stream<'static, Evt, Self::Error> {
        let rx = self.tx.subscribe();

        BroadcastStream::new(rx)
            .map(|result| {
                result.map_err(|err| match err {
                    BroadcastStreamRecvError::Lagged(n) => LaggedError(n),
                })
            })
            .boxed()
    }
}

/// Decorator type for an [`event::Store`] implementation that tracks the list of
/// recorded Domain Events through it.
///
/// Useful for testing purposes, i.e. asserting that Domain Events written through
/// this Event Store instance are the ones expected.
#[derive(Debug, Clone)]
pub struct Tracking<T, Evt>
where
    T: Store<Evt> + Send + Sync,
    Evt: message::Message + Send + Sync,
{
    store: T,
    events: Arc<RwLock<Vec<Persisted<Evt>>>>,
}

impl<T, Evt> Tracking<T, Evt>
where
    T: Store<Evt> + Send + Sync,
    Evt: message::Message + Clone + Send + Sync,
{
    /// Returns the list of recorded Domain Events through this decorator so far.
    pub fn recorded_events(&self) -> Vec<Persisted<Evt>> {
        self.events.read().clone()
    }

    /// Resets the list of recorded Domain Events through this decorator.
    pub fn reset_recorded_events(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl<T, Evt> Streamer<Evt> for Tracking<T, Evt>
where
    T: Store<Evt> + Send + Sync,
    Evt: message::Message + Clone + Send + Sync,
{
    type Error = <T as Streamer<Evt>>::Error;

    fn stream(&self, id: &StreamId, select: VersionSelect) -> event::Stream<Evt, Self::Error> {
        self.store.stream(id, select)
    }

    fn stream_all(&self, select: SequenceSelect) -> event::Stream<Evt, Self::Error> {
        self.store.stream_all(select)
    }

    async fn stream_version(&self, id: &StreamId) -> Result<version::Version, Self::Error> {
        self.store.stream_version(id).await
    }
}

#[async_trait]
impl<T, Evt> Appender<Evt> for Tracking<T, Evt>
where
    T: Store<Evt> + Send + Sync,
    Evt: message::Message + Clone + Send + Sync,
{
    async fn append(
        &self,
        id: StreamId,
        version_check: version::Check,
        events: Vec<Envelope<Evt>>,
    ) -> Result<version::Version, AppendError> {
        let new_version = self
            .store
            .append(id.clone(), version_check, events.clone())
            .await?;

        let events_size = events.len();
        let previous_version = new_version - (events_size as version::Version);

        // Global position and record time are backend-assigned; the
        // reconstruction here is sufficient for equality assertions.
        let mut persisted_events = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| Persisted {
                stream_id: id.clone(),
                version: previous_version + (i as version::Version) + 1,
                sequence_number: 0,
                recorded_at: Utc::now(),
                event,
            })
            .collect();

        self.events.write().append(&mut persisted_events);

        Ok(new_version)
    }
}

/// Extension trait that can be used to pull in supertypes implemented
/// in this module.
pub trait EventStoreExt<Evt>: Store<Evt> + Send + Sync + Sized
where
    Evt: message::Message + Clone + Send + Sync,
{
    /// Returns a [`Tracking`] instance that decorates the original [`event::Store`]
    /// instance this method has been called on.
    fn with_recorded_events_tracking(self) -> Tracking<Self, Evt> {
        Tracking {
            store: self,
            events: Arc::default(),
        }
    }
}

impl<T, Evt> EventStoreExt<Evt> for T
where
    T: Store<Evt> + Send + Sync,
    Evt: message::Message + Clone + Send + Sync,
{
}

#[cfg(test)]
mod test {
    use futures::TryStreamExt;
    use lazy_static::lazy_static;

    use super::*;
    use crate::message::tests::StringMessage;
    use crate::version::Version;

    lazy_static! {
        static ref EVENTS: Vec<Envelope<StringMessage>> = vec![
            Envelope::from(StringMessage("event-1")),
            Envelope::from(StringMessage("event-2")),
            Envelope::from(StringMessage("event-3")),
        ];
    }

    fn stream_id() -> StreamId {
        StreamId::new("stream:test")
    }

    #[tokio::test]
    async fn it_works() {
        let event_store = InMemory::<StringMessage>::default();

        let new_event_stream_version = event_store
            .append(stream_id(), version::Check::MustBe(0), EVENTS.clone())
            .await
            .expect("append should not fail");

        let expected_version = EVENTS.len() as Version;
        assert_eq!(expected_version, new_event_stream_version);

        let expected_events = EVENTS
            .clone()
            .into_iter()
            .enumerate()
            .map(|(i, event)| Persisted {
                stream_id: stream_id(),
                version: (i as Version) + 1,
                sequence_number: (i as SequenceNumber) + 1,
                recorded_at: Utc::now(),
                event,
            })
            .collect::<Vec<_>>();

        let event_stream: Vec<_> = event_store
            .stream(&stream_id(), VersionSelect::All)
            .try_collect()
            .await
            .expect("opening an event stream should not fail");

        assert_eq!(expected_events, event_stream);
        assert_eq!(
            expected_version,
            event_store
                .stream_version(&stream_id())
                .await
                .expect("stream version should be returned"),
        );
    }

    #[tokio::test]
    async fn tracking_store_works() {
        let event_store = InMemory::<StringMessage>::default();
        let tracking_event_store = event_store.with_recorded_events_tracking();

        tracking_event_store
            .append(stream_id(), version::Check::MustBe(0), EVENTS.clone())
            .await
            .expect("append should not fail");

        let event_stream: Vec<_> = tracking_event_store
            .stream(&stream_id(), VersionSelect::All)
            .try_collect()
            .await
            .expect("opening an event stream should not fail");

        assert_eq!(event_stream, tracking_event_store.recorded_events());
    }

    #[tokio::test]
    async fn version_conflict_checks_work_as_expected() {
        let event_store = InMemory::<StringMessage>::default();

        let append_error = event_store
            .append(stream_id(), version::Check::MustBe(3), EVENTS.clone())
            .await
            .expect_err("the event stream version should be zero");

        if let AppendError::Conflict(err) = append_error {
            return assert_eq!(
                version::ConflictError {
                    expected: 3,
                    actual: 0,
                },
                err
            );
        }

        panic!("expected conflict error, received: {append_error}")
    }

    #[tokio::test]
    async fn unknown_streams_have_version_zero() {
        let event_store = InMemory::<StringMessage>::default();

        let version = event_store
            .stream_version(&StreamId::new("stream:unknown"))
            .await
            .expect("stream version should be returned");

        assert_eq!(0, version);
    }

    #[tokio::test]
    async fn streaming_from_a_version_skips_earlier_events() {
        let event_store = InMemory::<StringMessage>::default();

        event_store
            .append(stream_id(), version::Check::Any, EVENTS.clone())
            .await
            .expect("append should not fail");

        let event_stream: Vec<_> = event_store
            .stream(&stream_id(), VersionSelect::From(3))
            .try_collect()
            .await
            .expect("opening an event stream should not fail");

        assert_eq!(1, event_stream.len());
        assert_eq!(3, event_stream[0].version);
    }

    #[tokio::test]
    async fn the_global_order_interleaves_streams_by_append_order() {
        let event_store = InMemory::<StringMessage>::default();

        let id_1 = StreamId::new("stream:one");
        let id_2 = StreamId::new("stream:two");

        for (id, event) in [
            (&id_1, StringMessage("a")),
            (&id_2, StringMessage("b")),
            (&id_1, StringMessage("c")),
            (&id_2, StringMessage("d")),
        ] {
            event_store
                .append(id.clone(), version::Check::Any, vec![Envelope::from(event)])
                .await
                .expect("append should not fail");
        }

        let all: Vec<_> = event_store
            .stream_all(SequenceSelect::All)
            .try_collect()
            .await
            .expect("streaming the global order should not fail");

        let sequence_numbers: Vec<_> = all.iter().map(|evt| evt.sequence_number).collect();
        assert_eq!(vec![1, 2, 3, 4], sequence_numbers);

        let stream_ids: Vec<_> = all.iter().map(|evt| evt.stream_id.as_str()).collect();
        assert_eq!(
            vec!["stream:one", "stream:two", "stream:one", "stream:two"],
            stream_ids
        );

        let tail: Vec<_> = event_store
            .stream_all(SequenceSelect::From(3))
            .try_collect()
            .await
            .expect("streaming the global order should not fail");

        assert_eq!(2, tail.len());
    }

    #[tokio::test]
    async fn live_subscribers_observe_appends_in_order() {
        let event_store = InMemory::<StringMessage>::default();
        let mut live = event_store.subscribe_all();

        event_store
            .append(stream_id(), version::Check::MustBe(0), EVENTS.clone())
            .await
            .expect("append should not fail");

        for expected_version in 1..=EVENTS.len() as Version {
            let event = live
                .try_next()
                .await
                .expect("the live stream should not fail")
                .expect("an event should have been broadcast");

            assert_eq!(expected_version, event.version);
        }
    }
}
