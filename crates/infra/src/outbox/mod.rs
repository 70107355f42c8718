//! Outbound message queue.
//!
//! Callers enqueue through `Mailer`; the `OutboxProcessor` task delivers due
//! items with exponential back-off and gives up after a fixed number of
//! attempts.

pub mod mailer;
pub mod processor;
pub mod sender;
pub mod store;
pub mod types;

pub use mailer::Mailer;
pub use processor::{OUTBOX_TASK, OutboxProcessor, PassReport};
pub use sender::{MessageSender, SendError, TracingSender};
pub use store::{InMemoryOutboxStore, OutboxStore, OutboxStoreError};
pub use types::{
    DeliveryOutcome, DeliveryPolicy, Envelope, NewOutboxItem, OutboxItem, PERMANENT_FAILURE_THRESHOLD,
    PendingDelivery, Recipient, UNCONFIRMED_ERROR,
};
