//! This module contains the definition of a [Message] type, which
//! can be used to describe some sort of domain value such as a Domain Event,
//! a Command or a Query, and the [Envelope] that carries it through
//! the system.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// Represents a piece of domain data that occurs in the system.
///
/// Each Message has a specific name to it, which should ideally be
/// unique within the domain you're operating in. Example: a Domain Event
/// that represents when an Order was created can have a `name()`: `"OrderWasCreated"`.
pub trait Message {
    /// Returns the domain name of the [Message].
    fn name(&self) -> &'static str;
}

/// Unique identifier assigned to each [Envelope] when it enters the system.
///
/// Ids are monotonic within a single process. The counter backing them is
/// seeded from the wall clock (milliseconds) on first use, so that ids
/// remain unique across process restarts happening within the same second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(u64);

lazy_static! {
    static ref NEXT_ID: AtomicU64 = AtomicU64::new(chrono::Utc::now().timestamp_millis() as u64);
}

impl Id {
    /// Returns the next [Id] from the process-wide counter.
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Returns the numeric representation of the [Id].
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Optional metadata to attach to an [Envelope] to provide additional context
/// to the [Message] carried out.
pub type Metadata = HashMap<String, String>;

/// Represents a [Message] packaged for persistance and/or processing by other
/// parts of the system.
///
/// It carries the actual message (i.e. a payload), the [Id] assigned to it
/// on creation, and some optional [Metadata].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T>
where
    T: Message,
{
    /// The unique, monotonic identifier assigned to this message.
    pub id: Id,
    /// The message payload.
    pub message: T,
    /// Optional metadata to provide additional context to the message.
    pub metadata: Metadata,
}

impl<T> Envelope<T>
where
    T: Message,
{
    /// Adds a new entry in the [Envelope]'s [Metadata].
    #[must_use]
    pub fn with_metadata(mut self, key: String, value: String) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Returns the metadata value recorded under `key`, if any.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

impl<T> From<T> for Envelope<T>
where
    T: Message,
{
    fn from(message: T) -> Self {
        Envelope {
            id: Id::next(),
            message,
            metadata: Metadata::default(),
        }
    }
}

impl<T> PartialEq for Envelope<T>
where
    T: Message + PartialEq,
{
    fn eq(&self, other: &Envelope<T>) -> bool {
        // Id and metadata do not affect equality of messages.
        self.message == other.message
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct StringMessage(pub(crate) &'static str);

    impl Message for StringMessage {
        fn name(&self) -> &'static str {
            "string_payload"
        }
    }

    #[test]
    fn message_with_metadata_does_not_affect_equality() {
        let message = Envelope::from(StringMessage("hello"));

        let new_message = message
            .clone()
            .with_metadata("hello_world".into(), "test".into())
            .with_metadata("test_number".into(), 1.to_string());

        // Metadata does not affect equality of message.
        assert_eq!(message, new_message);
    }

    #[test]
    fn ids_are_monotonic() {
        let first = Id::next();
        let second = Id::next();
        let third = Id::next();

        assert!(first < second);
        assert!(second < third);
    }

    #[test]
    fn envelopes_receive_distinct_ids() {
        let a = Envelope::from(StringMessage("a"));
        let b = Envelope::from(StringMessage("b"));

        assert_ne!(a.id, b.id);
    }
}
