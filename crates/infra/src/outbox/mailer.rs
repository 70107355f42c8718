//! Enqueue-and-nudge front door for outgoing mail.

use tracing::info;

use identityd_core::Clock;

use super::store::{OutboxStore, OutboxStoreError};
use super::types::{NewOutboxItem, OutboxItem};
use crate::scheduler::Nudger;

/// Queues messages and wakes the outbox task so delivery starts right away
/// instead of on the next interval.
pub struct Mailer<S, C> {
    store: S,
    clock: C,
    nudger: Nudger,
}

impl<S, C> Mailer<S, C>
where
    S: OutboxStore,
    C: Clock,
{
    pub fn new(store: S, clock: C, nudger: Nudger) -> Self {
        Self { store, clock, nudger }
    }

    /// Enqueue a message. The outbox task is only nudged once the item is
    /// persisted; a failed enqueue leaves the task alone.
    pub fn send(&self, message: NewOutboxItem) -> Result<OutboxItem, OutboxStoreError> {
        let item = self.store.enqueue(message, self.clock.now())?;
        info!(item_id = %item.id, recipient = %item.recipient, "outbox item queued");
        self.nudger.nudge();
        Ok(item)
    }
}
