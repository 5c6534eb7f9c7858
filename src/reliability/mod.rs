//! The delivery-guarantee substrate: idempotency cache, first-write-wins
//! inbox, transactional outbox, dead-letter queue, lease lock and
//! scheduled-message queue.
//!
//! Every store is a trait seam with a volatile in-memory reference
//! implementation; distributed adapters implement the same contracts.

pub mod dlq;
pub mod idempotency;
pub mod inbox;
pub mod lock;
pub mod outbox;
pub mod scheduler;
