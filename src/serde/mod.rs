pub mod json;

pub use json::Json;

/// Byte codec consumed by the Outbox, the Snapshot store and stream
/// integrity hashing.
///
/// The crate never assumes a specific encoding: payloads travel as opaque
/// bytes, and both directions are fallible so a codec failure can degrade
/// gracefully (a snapshot that fails to encode is skipped, a snapshot that
/// fails to decode falls back to a full replay).
pub trait Serde<T>: Send + Sync {
    /// The error returned when encoding or decoding fails.
    type Error: Send + Sync;

    /// Encodes the value into its byte form.
    fn serialize(&self, value: &T) -> Result<Vec<u8>, Self::Error>;

    /// Decodes a value back from its byte form.
    fn deserialize(&self, data: &[u8]) -> Result<T, Self::Error>;
}
