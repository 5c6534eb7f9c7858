//! JSON implementation of the [Serde] codec seam.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::serde::Serde;

/// A [Serde] encoding values as JSON through the [serde_json] crate.
///
/// This is the reference codec of the crate: Snapshot payloads and Outbox
/// entries are readable on the wire, which keeps the volatile backends easy
/// to inspect. Adapters are free to plug denser encodings behind the same
/// seam.
#[derive(Debug)]
pub struct Json<T> {
    marker: PhantomData<fn() -> T>,
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self {
            marker: PhantomData,
        }
    }
}

impl<T> Serde<T> for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    type Error = serde_json::Error;

    fn serialize(&self, value: &T) -> Result<Vec<u8>, Self::Error> {
        serde_json::to_vec(value)
    }

    fn deserialize(&self, data: &[u8]) -> Result<T, Self::Error> {
        serde_json::from_slice(data)
    }
}
