//! Outbox storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use identityd_core::{AliasId, OutboxItemId};

use super::types::{DeliveryPolicy, NewOutboxItem, OutboxItem, PendingDelivery, Recipient};
use crate::retention::RetentionTarget;

/// Outbox store abstraction.
///
/// The processor is the only writer of attempt bookkeeping; callers only
/// enqueue.
pub trait OutboxStore: Send + Sync {
    /// Insert or update a recipient's address and confirmation state.
    fn upsert_recipient(&self, recipient: Recipient) -> Result<(), OutboxStoreError>;

    /// Queue a new item. Fails if the recipient is unknown.
    fn enqueue(&self, item: NewOutboxItem, created_at: DateTime<Utc>) -> Result<OutboxItem, OutboxStoreError>;

    fn get(&self, id: OutboxItemId) -> Result<Option<OutboxItem>, OutboxStoreError>;

    /// Items matching the selection predicate, oldest first, with recipients.
    ///
    /// Back-off is not applied here; the processor decides per item.
    fn due_items(&self, policy: &DeliveryPolicy) -> Result<Vec<PendingDelivery>, OutboxStoreError>;

    /// Persist an item's attempt bookkeeping (last attempt, count, error).
    fn save_attempt(&self, item: &OutboxItem) -> Result<(), OutboxStoreError>;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum OutboxStoreError {
    #[error("unknown recipient: {0}")]
    UnknownRecipient(AliasId),
    #[error("outbox item not found: {0}")]
    NotFound(OutboxItemId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl<T: OutboxStore + ?Sized> OutboxStore for Arc<T> {
    fn upsert_recipient(&self, recipient: Recipient) -> Result<(), OutboxStoreError> {
        (**self).upsert_recipient(recipient)
    }

    fn enqueue(&self, item: NewOutboxItem, created_at: DateTime<Utc>) -> Result<OutboxItem, OutboxStoreError> {
        (**self).enqueue(item, created_at)
    }

    fn get(&self, id: OutboxItemId) -> Result<Option<OutboxItem>, OutboxStoreError> {
        (**self).get(id)
    }

    fn due_items(&self, policy: &DeliveryPolicy) -> Result<Vec<PendingDelivery>, OutboxStoreError> {
        (**self).due_items(policy)
    }

    fn save_attempt(&self, item: &OutboxItem) -> Result<(), OutboxStoreError> {
        (**self).save_attempt(item)
    }
}

fn poisoned<T>(_: T) -> OutboxStoreError {
    OutboxStoreError::Storage("outbox lock poisoned".to_string())
}

/// In-memory outbox for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    items: RwLock<HashMap<OutboxItemId, OutboxItem>>,
    recipients: RwLock<HashMap<AliasId, Recipient>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert an item as-is, bypassing enqueue defaults. Useful for seeding
    /// items with prior attempt history.
    pub fn insert(&self, item: OutboxItem) -> Result<(), OutboxStoreError> {
        if !self.recipients.read().map_err(poisoned)?.contains_key(&item.recipient) {
            return Err(OutboxStoreError::UnknownRecipient(item.recipient));
        }
        self.items.write().map_err(poisoned)?.insert(item.id, item);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn upsert_recipient(&self, recipient: Recipient) -> Result<(), OutboxStoreError> {
        self.recipients
            .write()
            .map_err(poisoned)?
            .insert(recipient.id, recipient);
        Ok(())
    }

    fn enqueue(&self, item: NewOutboxItem, created_at: DateTime<Utc>) -> Result<OutboxItem, OutboxStoreError> {
        let item = OutboxItem::from_new(item, created_at);
        self.insert(item.clone())?;
        Ok(item)
    }

    fn get(&self, id: OutboxItemId) -> Result<Option<OutboxItem>, OutboxStoreError> {
        Ok(self.items.read().map_err(poisoned)?.get(&id).cloned())
    }

    fn due_items(&self, policy: &DeliveryPolicy) -> Result<Vec<PendingDelivery>, OutboxStoreError> {
        let items = self.items.read().map_err(poisoned)?;
        let recipients = self.recipients.read().map_err(poisoned)?;

        let mut due: Vec<PendingDelivery> = items
            .values()
            .filter(|item| item.is_due(policy))
            .filter_map(|item| {
                recipients.get(&item.recipient).map(|recipient| PendingDelivery {
                    item: item.clone(),
                    recipient: recipient.clone(),
                })
            })
            .collect();

        due.sort_by_key(|p| (p.item.created_at, p.item.id));
        Ok(due)
    }

    fn save_attempt(&self, item: &OutboxItem) -> Result<(), OutboxStoreError> {
        let mut items = self.items.write().map_err(poisoned)?;
        let stored = items
            .get_mut(&item.id)
            .ok_or(OutboxStoreError::NotFound(item.id))?;
        stored.last_attempt_at = item.last_attempt_at;
        stored.attempt_count = item.attempt_count;
        stored.last_error = item.last_error.clone();
        Ok(())
    }
}

impl RetentionTarget for InMemoryOutboxStore {
    fn entity(&self) -> &'static str {
        "outbox_items"
    }

    fn delete_created_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut items = self.items.write().map_err(poisoned)?;
        let before = items.len();
        items.retain(|_, item| item.created_at >= cutoff);
        Ok((before - items.len()) as u64)
    }
}
