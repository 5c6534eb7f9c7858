mod setup;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use catga::event::store::Appender;
use catga::event::{Persisted, StreamId};
use catga::subscription::{
    self, CheckpointStrategy, Manager, Runner, Status, Store, StreamPattern, Subscription,
};
use catga::version::Check;

use setup::{OrderEvent, OrderStore};

fn created(order_id: &str) -> catga::event::Envelope<OrderEvent> {
    catga::event::Envelope::from(OrderEvent::Created {
        order_id: order_id.to_owned(),
        amount: 0,
    })
}

fn item_added(price: u64, quantity: u64) -> catga::event::Envelope<OrderEvent> {
    catga::event::Envelope::from(OrderEvent::ItemAdded { price, quantity })
}

async fn seed_three_streams(store: &OrderStore) {
    store
        .append(
            StreamId::new("Order-1"),
            Check::MustBe(0),
            vec![created("1"), item_added(10, 1)],
        )
        .await
        .expect("append should not fail");

    store
        .append(StreamId::new("Customer-1"), Check::MustBe(0), vec![created("c1")])
        .await
        .expect("append should not fail");

    store
        .append(StreamId::new("Order-2"), Check::MustBe(0), vec![created("2")])
        .await
        .expect("append should not fail");

    store
        .append(
            StreamId::new("Customer-1"),
            Check::MustBe(1),
            vec![item_added(99, 1)],
        )
        .await
        .expect("append should not fail");
}

#[tokio::test]
async fn catch_up_subscriptions_observe_only_their_pattern() {
    let store = OrderStore::default();
    seed_three_streams(&store).await;

    let subscriptions = subscription::InMemory::default();
    subscriptions
        .save(Subscription::new("orders", StreamPattern::from("Order-*")))
        .await
        .expect("the subscription should be saved");

    let count = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let counter = Arc::clone(&count);
    let streams = Arc::clone(&observed);

    let runner = Runner::new(
        "orders",
        store.clone(),
        subscriptions.clone(),
        move |event: Persisted<OrderEvent>| {
            let counter = Arc::clone(&counter);
            let streams = Arc::clone(&streams);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                streams.lock().push(event.stream_id.as_str().to_owned());
                Ok(())
            }
        },
    );

    let processed = runner.run_once().await.expect("the poll should not fail");

    // Order-1 holds two events, Order-2 one; Customer-1 is not observed.
    assert_eq!(3, processed);
    assert_eq!(3, count.load(Ordering::SeqCst));
    assert_eq!(
        vec!["Order-1".to_owned(), "Order-1".to_owned(), "Order-2".to_owned()],
        observed.lock().clone(),
    );

    // The checkpoint advanced past every observed position.
    let subscription = subscriptions
        .load("orders")
        .await
        .expect("the store should not fail")
        .expect("the subscription is registered");

    assert_eq!(5, subscription.position);
    assert_eq!(3, subscription.processed);
    assert_eq!(Status::Active, subscription.status);
}

#[tokio::test]
async fn catch_up_subscriptions_deliver_exactly_once_per_event() {
    let store = OrderStore::default();
    seed_three_streams(&store).await;

    let subscriptions = subscription::InMemory::default();
    subscriptions
        .save(Subscription::new("orders", StreamPattern::from("Order-*")))
        .await
        .expect("the subscription should be saved");

    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);

    let runner = Runner::new(
        "orders",
        store.clone(),
        subscriptions.clone(),
        move |_event: Persisted<OrderEvent>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
    )
    .with_batch_size(2)
    .with_strategy(CheckpointStrategy::AdvanceAndLog);

    // Small batches need several polls to catch up; the count never
    // exceeds one delivery per matching event.
    while runner.run_once().await.expect("the poll should not fail") > 0 {}

    assert_eq!(3, count.load(Ordering::SeqCst));

    // New events are picked up from the checkpoint.
    store
        .append(
            StreamId::new("Order-2"),
            Check::MustBe(1),
            vec![item_added(5, 1)],
        )
        .await
        .expect("append should not fail");

    while runner.run_once().await.expect("the poll should not fail") > 0 {}

    assert_eq!(4, count.load(Ordering::SeqCst));
}

#[tokio::test]
async fn volatile_subscriptions_observe_appends_from_now_on() {
    let store = OrderStore::default();

    // Appended before subscribing: never observed.
    store
        .append(StreamId::new("Order-1"), Check::MustBe(0), vec![created("1")])
        .await
        .expect("append should not fail");

    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);

    let manager = Manager::new(store.clone());
    let handle = manager.subscribe(
        StreamPattern::from("Order-*"),
        move |_event: Persisted<OrderEvent>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
    );

    // Give the background task a chance to start listening.
    tokio::time::sleep(Duration::from_millis(20)).await;

    store
        .append(
            StreamId::new("Order-1"),
            Check::MustBe(1),
            vec![item_added(10, 1)],
        )
        .await
        .expect("append should not fail");
    store
        .append(StreamId::new("Customer-1"), Check::MustBe(0), vec![created("c1")])
        .await
        .expect("append should not fail");

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(1, count.load(Ordering::SeqCst));

    handle.unsubscribe();

    store
        .append(
            StreamId::new("Order-1"),
            Check::MustBe(2),
            vec![item_added(20, 1)],
        )
        .await
        .expect("append should not fail");

    tokio::time::sleep(Duration::from_millis(50)).await;

    // Nothing is delivered after unsubscribing.
    assert_eq!(1, count.load(Ordering::SeqCst));
}
