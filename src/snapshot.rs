//! Contains support for Snapshots: serialised Aggregate states recorded at a
//! specific Event Stream [Version], used to shortcut full stream replays.
//!
//! The [Store] keeps the full snapshot history of a stream, which also
//! enables point-in-time reconstruction: the newest snapshot at or below a
//! target version seeds the replay of the remaining events.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::event::StreamId;
use crate::version::Version;

/// A serialised Aggregate state, recorded when its Event Stream was at
/// the specified [Version].
///
/// The payload is opaque to the store: it is produced and consumed through
/// the [Serde][crate::serde::Serde] seam by the
/// [Snapshotting][crate::aggregate::Snapshotting] repository.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// The id of the Event Stream the snapshot belongs to.
    pub stream_id: StreamId,

    /// The version of the Event Stream at the time the snapshot was taken.
    pub version: Version,

    /// The serialised Aggregate state.
    pub payload: Vec<u8>,

    /// The instant the snapshot was taken at.
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    /// Creates a new [Snapshot] taken now.
    pub fn new(stream_id: StreamId, version: Version, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            version,
            payload,
            taken_at: Utc::now(),
        }
    }
}

/// Interface to save and retrieve [Snapshot]s of an Event Stream.
///
/// The store trusts the caller: it does not verify that replaying a payload
/// reproduces the stream state, nor that the recorded version exists.
#[async_trait]
pub trait Store: Send + Sync {
    /// The error type returned by the concrete implementation.
    type Error: Send + Sync;

    /// Records a new [Snapshot]. History is append-only: previous snapshots
    /// of the same stream are retained.
    async fn save(&self, snapshot: Snapshot) -> Result<(), Self::Error>;

    /// Returns the newest [Snapshot] of the specified stream, if any.
    async fn load_latest(&self, id: &StreamId) -> Result<Option<Snapshot>, Self::Error>;

    /// Returns the newest [Snapshot] with `snapshot.version <= version`, if any.
    async fn load_at_version(
        &self,
        id: &StreamId,
        version: Version,
    ) -> Result<Option<Snapshot>, Self::Error>;

    /// Returns all recorded [Snapshot]s of the specified stream,
    /// in ascending version order.
    async fn history(&self, id: &StreamId) -> Result<Vec<Snapshot>, Self::Error>;
}

/// In-memory implementation of the Snapshot [Store] trait.
#[derive(Debug, Clone, Default)]
pub struct InMemory {
    backend: Arc<RwLock<HashMap<StreamId, Vec<Snapshot>>>>,
}

#[async_trait]
impl Store for InMemory {
    type Error = Infallible;

    async fn save(&self, snapshot: Snapshot) -> Result<(), Self::Error> {
        let mut backend = self.backend.write();
        let history = backend.entry(snapshot.stream_id.clone()).or_default();

        // Keep the history ordered by version, whatever the save order.
        let position = history
            .iter()
            .position(|recorded| recorded.version > snapshot.version)
            .unwrap_or(history.len());

        history.insert(position, snapshot);

        Ok(())
    }

    async fn load_latest(&self, id: &StreamId) -> Result<Option<Snapshot>, Self::Error> {
        Ok(self
            .backend
            .read()
            .get(id)
            .and_then(|history| history.last())
            .cloned())
    }

    async fn load_at_version(
        &self,
        id: &StreamId,
        version: Version,
    ) -> Result<Option<Snapshot>, Self::Error> {
        Ok(self
            .backend
            .read()
            .get(id)
            .and_then(|history| {
                history
                    .iter()
                    .rev()
                    .find(|snapshot| snapshot.version <= version)
            })
            .cloned())
    }

    async fn history(&self, id: &StreamId) -> Result<Vec<Snapshot>, Self::Error> {
        Ok(self.backend.read().get(id).cloned().unwrap_or_default())
    }
}
