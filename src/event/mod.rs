//! Module `event` contains types and abstractions helpful for working
//! with Domain Events.

pub mod integrity;
pub mod store;

use std::fmt;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use crate::event::store::Store;
use crate::{message, version};

/// An Event is a [Message][message::Message] carrying the information about a Domain Event,
/// an occurrence in the system lifetime that is relevant for the Domain
/// that is being implemented.
pub type Envelope<T> = message::Envelope<T>;

/// Monotonic ordinal assigned to each [Persisted] event across all
/// Event Streams in the same Event [Store], 1-based.
///
/// Subscriptions use it to checkpoint their progress over the whole store.
pub type SequenceNumber = u64;

/// The identifier of an Event Stream: an opaque string.
///
/// Streams holding the events of an Aggregate instance follow the
/// `<AggregateName>-<Id>` convention, rendered by [StreamId::for_aggregate].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Creates a new [StreamId] from its raw string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Renders the identifier of the Event Stream holding the events
    /// of the specified Aggregate instance.
    pub fn for_aggregate(type_name: &str, id: impl fmt::Display) -> Self {
        Self(format!("{type_name}-{id}"))
    }

    /// Returns the raw string form of the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for StreamId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An [Event][Envelope] that has been persisted to the Event [Store].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persisted<Evt>
where
    Evt: message::Message,
{
    /// The id of the Event Stream the persisted Event belongs to.
    pub stream_id: StreamId,

    /// The version of the Event Stream when this Event has been recorded.
    ///
    /// This value is used for optimistic concurrency checks, to avoid
    /// data races in parallel command evaluations.
    ///
    /// Check the [Version][version::Version] type and module documentation for more info.
    pub version: version::Version,

    /// The position of this Event in the global order of the Event [Store].
    pub sequence_number: SequenceNumber,

    /// The instant the Event has been recorded at.
    pub recorded_at: DateTime<Utc>,

    /// The actual Domain Event carried by this envelope.
    pub event: Envelope<Evt>,
}

impl<Evt> Persisted<Evt>
where
    Evt: message::Message,
{
    /// Builds a persisted-event literal, useful for test expectations.
    ///
    /// The global position and record time are placeholders: both are
    /// backend-assigned and excluded from equality.
    pub fn new(stream_id: StreamId, version: version::Version, event: Envelope<Evt>) -> Self {
        Self {
            stream_id,
            version,
            sequence_number: 0,
            recorded_at: Utc::now(),
            event,
        }
    }
}

impl<Evt> PartialEq for Persisted<Evt>
where
    Evt: message::Message + PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        // Global position and record time are backend-assigned, and do not
        // affect equality of persisted events.
        self.stream_id == other.stream_id
            && self.version == other.version
            && self.event == other.event
    }
}

/// Specifies the slice of the Event Stream to select when calling [`store::Streamer::stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelect {
    /// Selects all [Event][Envelope]s in the Event Stream.
    All,

    /// Selects all [Event][Envelope]s in the Event Stream starting from the [Event]
    /// with the specified [Version][version::Version].
    From(version::Version),
}

/// Specifies the slice of the global Event [Store] order to select when
/// calling [`store::Streamer::stream_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceSelect {
    /// Selects all [Event][Envelope]s in the Event [Store].
    All,

    /// Selects all [Event][Envelope]s starting from the one with the
    /// specified [SequenceNumber].
    From(SequenceNumber),
}

/// Stream is a stream of [Persisted] Domain Events.
pub type Stream<'a, Evt, Err> = BoxStream<'a, Result<Persisted<Evt>, Err>>;
