//! Module for creating and managing long-running Subscriptions
//! to the events recorded in an Event [Store][crate::event::Store].
//!
//! Two shapes are available: **volatile** subscriptions through the
//! [Manager], fed by the store's live broadcast from the moment of
//! subscribing, and persistent **catch-up** subscriptions through the
//! [Runner][runner::Runner], which track their progress in a
//! [subscription Store][Store] and survive process restarts when backed
//! by a persistent adapter.

pub mod runner;

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use runner::{CheckpointStrategy, Runner};

use crate::event::{Persisted, SequenceNumber, StreamId};
use crate::{event, message};

/// A glob over [StreamId]s, where `*` matches any character sequence.
///
/// `Order-*` matches every stream of the `Order` Aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamPattern(String);

impl StreamPattern {
    /// Creates a new [StreamPattern] from its glob string form.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// Returns the glob string form of the pattern.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reports whether the pattern matches the specified [StreamId].
    pub fn matches(&self, id: &StreamId) -> bool {
        glob_match(&self.0, id.as_str())
    }
}

impl From<&str> for StreamPattern {
    fn from(pattern: &str) -> Self {
        Self(pattern.to_owned())
    }
}

impl fmt::Display for StreamPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Iterative glob matching with backtracking on the last `*`.
fn glob_match(pattern: &str, input: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let input: Vec<char> = input.chars().collect();

    let (mut p, mut i) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while i < input.len() {
        if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, i));
            p += 1;
        } else if p < pattern.len() && pattern[p] == input[i] {
            p += 1;
            i += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            i = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }

    p == pattern.len()
}

/// The lifecycle state of a [Subscription].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// The subscription processes new events when its runner polls.
    Active,
    /// The subscription retains its position but processes nothing.
    Paused,
}

/// A named, persistent consumer of the streams matching a [StreamPattern].
///
/// The `position` records the global [SequenceNumber] of the last event the
/// subscription has observed (matching its pattern or not); `processed`
/// counts the events its processor completed successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// The unique name of the subscription.
    pub name: String,
    /// The pattern selecting the streams this subscription consumes.
    pub pattern: StreamPattern,
    /// The global position of the last observed event.
    pub position: SequenceNumber,
    /// Number of events processed successfully.
    pub processed: u64,
    /// The lifecycle state of the subscription.
    pub status: Status,
}

impl Subscription {
    /// Creates a new [Status::Active] subscription starting from the
    /// beginning of the global order.
    pub fn new(name: impl Into<String>, pattern: StreamPattern) -> Self {
        Self {
            name: name.into(),
            pattern,
            position: 0,
            processed: 0,
            status: Status::Active,
        }
    }
}

/// Interface to persist [Subscription]s, used by catch-up
/// [Runner][runner::Runner]s to record their progress.
///
/// The store also arbitrates runner exclusivity: [claim][Store::claim]
/// admits at most one live runner per subscription name in a process.
#[async_trait]
pub trait Store: Send + Sync {
    /// The error type returned by the concrete implementation.
    type Error: Send + Sync;

    /// Records the current state of a [Subscription].
    async fn save(&self, subscription: Subscription) -> Result<(), Self::Error>;

    /// Returns the named [Subscription], if registered.
    async fn load(&self, name: &str) -> Result<Option<Subscription>, Self::Error>;

    /// Returns all registered [Subscription]s.
    async fn list(&self) -> Result<Vec<Subscription>, Self::Error>;

    /// Claims the named subscription for a runner. Returns `false` when
    /// another runner already holds the claim.
    async fn claim(&self, name: &str) -> Result<bool, Self::Error>;

    /// Releases a previously claimed subscription.
    async fn release(&self, name: &str) -> Result<(), Self::Error>;
}

/// In-memory implementation of the subscription [Store] trait.
#[derive(Debug, Clone, Default)]
pub struct InMemory {
    backend: Arc<RwLock<HashMap<String, Subscription>>>,
    claimed: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl Store for InMemory {
    type Error = Infallible;

    async fn save(&self, subscription: Subscription) -> Result<(), Self::Error> {
        self.backend
            .write()
            .insert(subscription.name.clone(), subscription);

        Ok(())
    }

    async fn load(&self, name: &str) -> Result<Option<Subscription>, Self::Error> {
        Ok(self.backend.read().get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<Subscription>, Self::Error> {
        let mut subscriptions: Vec<_> = self.backend.read().values().cloned().collect();
        subscriptions.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(subscriptions)
    }

    async fn claim(&self, name: &str) -> Result<bool, Self::Error> {
        Ok(self.claimed.lock().insert(name.to_owned()))
    }

    async fn release(&self, name: &str) -> Result<(), Self::Error> {
        self.claimed.lock().remove(name);

        Ok(())
    }
}

/// A software component able to process [Persisted] Domain Events delivered
/// by a subscription.
#[async_trait]
pub trait Processor<Evt>: Send + Sync
where
    Evt: message::Message + Send + Sync,
{
    /// Processes a single [Persisted] Domain Event.
    ///
    /// Failures are reported to the subscription machinery, which applies
    /// its checkpoint strategy; retry semantics are the processor's own
    /// responsibility.
    async fn process(&self, event: Persisted<Evt>) -> anyhow::Result<()>;
}

#[async_trait]
impl<Evt, F, Fut> Processor<Evt> for F
where
    Evt: message::Message + Send + Sync + 'static,
    F: Send + Sync + Fn(Persisted<Evt>) -> Fut,
    Fut: Send + std::future::Future<Output = anyhow::Result<()>>,
{
    async fn process(&self, event: Persisted<Evt>) -> anyhow::Result<()> {
        self(event).await
    }
}

/// Detaches a volatile subscription created through [Manager::subscribe]
/// when dropped or explicitly unsubscribed.
#[derive(Debug)]
pub struct Handle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Handle {
    /// Detaches the subscription: its processor observes no further events.
    pub fn unsubscribe(self) {
        self.token.cancel();
        self.task.abort();
    }
}

/// Hands out **volatile** subscriptions over the live event feed of an
/// Event Store: the processor observes every event appended from the moment
/// of subscribing whose stream matches the pattern, and nothing before.
#[derive(Debug, Clone)]
pub struct Manager<S> {
    subscriber: S,
}

impl<S> Manager<S> {
    /// Creates a new [Manager] over the given live event [Subscriber][event::store::Subscriber].
    pub fn new(subscriber: S) -> Self {
        Self { subscriber }
    }

    /// Starts a volatile subscription for the streams matching `pattern`,
    /// delivering events to `processor` on a background task.
    pub fn subscribe<Evt, P>(&self, pattern: StreamPattern, processor: P) -> Handle
    where
        Evt: message::Message + Send + Sync + 'static,
        S: event::store::Subscriber<Evt>,
        <S as event::store::Subscriber<Evt>>::Error: fmt::Display + Send + 'static,
        P: Processor<Evt> + 'static,
    {
        let mut live = self.subscriber.subscribe_all();
        let token = CancellationToken::new();
        let child = token.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = child.cancelled() => break,
                    next = live.next() => match next {
                        None => break,
                        Some(Err(err)) => {
                            tracing::warn!(pattern = %pattern, error = %err, "live subscription fell behind");
                        },
                        Some(Ok(event)) => {
                            if !pattern.matches(&event.stream_id) {
                                continue;
                            }

                            if let Err(err) = processor.process(event).await {
                                tracing::error!(pattern = %pattern, error = %err, "subscription processor failed");
                            }
                        },
                    },
                }
            }
        });

        Handle { token, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_match_prefix_globs() {
        let pattern = StreamPattern::from("Order-*");

        assert!(pattern.matches(&StreamId::new("Order-1")));
        assert!(pattern.matches(&StreamId::new("Order-")));
        assert!(!pattern.matches(&StreamId::new("Customer-1")));
        assert!(!pattern.matches(&StreamId::new("Order")));
    }

    #[test]
    fn patterns_match_multiple_wildcards() {
        let pattern = StreamPattern::from("*-audit-*");

        assert!(pattern.matches(&StreamId::new("Order-audit-2024")));
        assert!(pattern.matches(&StreamId::new("-audit-")));
        assert!(!pattern.matches(&StreamId::new("Order-log-2024")));
    }

    #[test]
    fn literal_patterns_match_exactly() {
        let pattern = StreamPattern::from("Order-1");

        assert!(pattern.matches(&StreamId::new("Order-1")));
        assert!(!pattern.matches(&StreamId::new("Order-12")));
    }

    #[test]
    fn the_sole_wildcard_matches_everything() {
        let pattern = StreamPattern::from("*");

        assert!(pattern.matches(&StreamId::new("Order-1")));
        assert!(pattern.matches(&StreamId::new("")));
    }

    #[tokio::test]
    async fn subscriptions_can_be_saved_and_listed() {
        let store = InMemory::default();

        store
            .save(Subscription::new("orders", StreamPattern::from("Order-*")))
            .await
            .unwrap();
        store
            .save(Subscription::new("audit", StreamPattern::from("*")))
            .await
            .unwrap();

        let loaded = store
            .load("orders")
            .await
            .unwrap()
            .expect("the subscription should be registered");
        assert_eq!(0, loaded.position);
        assert_eq!(Status::Active, loaded.status);

        let names: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|sub| sub.name)
            .collect();
        assert_eq!(vec!["audit".to_owned(), "orders".to_owned()], names);
    }

    #[tokio::test]
    async fn only_one_claim_per_name_is_admitted() {
        let store = InMemory::default();

        assert!(store.claim("orders").await.unwrap());
        assert!(!store.claim("orders").await.unwrap());

        store.release("orders").await.unwrap();
        assert!(store.claim("orders").await.unwrap());
    }
}
