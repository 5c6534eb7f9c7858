//! Stream integrity checks: a stable hash over the ordered, canonicalised
//! contents of an Event Stream, and its verification counterpart.

use futures::TryStreamExt;
use sha2::{Digest, Sha256};

use crate::event::store::Streamer;
use crate::event::{Persisted, StreamId, VersionSelect};
use crate::message;
use crate::serde::Serde;

/// All possible error types returned by [hash_stream] and [verify_stream].
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError<StreamErr, CodecErr> {
    /// The Event Store failed while streaming the events to hash.
    #[error("event store failed while streaming events: {0}")]
    Stream(#[source] StreamErr),

    /// An event could not be canonicalised into its byte form.
    #[error("failed to canonicalise event for hashing: {0}")]
    Codec(#[source] CodecErr),
}

/// Computes the integrity hash of the specified Event Stream.
///
/// The hash covers every event in version order: the stream version of the
/// event followed by its canonical byte form through the provided [Serde].
/// Returns `None` for streams that do not exist (or are still empty).
pub async fn hash_stream<Evt, S, Ser>(
    streamer: &S,
    id: &StreamId,
    serde: &Ser,
) -> Result<Option<String>, IntegrityError<S::Error, Ser::Error>>
where
    Evt: message::Message + Send + Sync,
    S: Streamer<Evt>,
    Ser: Serde<Evt>,
{
    let events: Vec<Persisted<Evt>> = streamer
        .stream(id, VersionSelect::All)
        .try_collect()
        .await
        .map_err(IntegrityError::Stream)?;

    if events.is_empty() {
        return Ok(None);
    }

    let mut hasher = Sha256::new();

    for event in &events {
        hasher.update(event.version.to_be_bytes());
        hasher.update(
            serde
                .serialize(&event.event.message)
                .map_err(IntegrityError::Codec)?,
        );
    }

    Ok(Some(format!("sha256:{}", hex::encode(hasher.finalize()))))
}

/// Recomputes the integrity hash of the specified Event Stream and compares
/// it against an expected value.
pub async fn verify_stream<Evt, S, Ser>(
    streamer: &S,
    id: &StreamId,
    serde: &Ser,
    expected: &str,
) -> Result<bool, IntegrityError<S::Error, Ser::Error>>
where
    Evt: message::Message + Send + Sync,
    S: Streamer<Evt>,
    Ser: Serde<Evt>,
{
    let hash = hash_stream(streamer, id, serde).await?;

    Ok(hash.as_deref() == Some(expected))
}
