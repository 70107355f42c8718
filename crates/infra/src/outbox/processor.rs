//! Outbox delivery pass.

use serde::Serialize;
use tracing::{debug, error, info};

use identityd_core::Clock;

use super::sender::MessageSender;
use super::store::{OutboxStore, OutboxStoreError};
use super::types::{DeliveryOutcome, DeliveryPolicy, OutboxItem, PendingDelivery, Recipient};
use crate::scheduler::{RunContext, Task};

/// Task name used for registration and nudging.
pub const OUTBOX_TASK: &str = "outbox";

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub delivered: usize,
    pub failed: usize,
    pub rejected: usize,
    pub backing_off: usize,
    pub persist_errors: usize,
}

impl PassReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed + self.rejected
    }
}

/// Attempts delivery of every due outbox item.
///
/// Each item is handled independently: a send failure is recorded on the item
/// and the pass moves on; bookkeeping is persisted per item before the next
/// one is looked at.
pub struct OutboxProcessor<S, M, C> {
    store: S,
    sender: M,
    clock: C,
    policy: DeliveryPolicy,
}

impl<S, M, C> OutboxProcessor<S, M, C>
where
    S: OutboxStore,
    M: MessageSender,
    C: Clock,
{
    pub fn new(store: S, sender: M, clock: C) -> Self {
        Self {
            store,
            sender,
            clock,
            policy: DeliveryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    /// Run one pass over the due items.
    ///
    /// Only a failure to read the due set aborts the pass. Failures to persist
    /// an individual item are counted in the report.
    pub fn process_pass(&self) -> Result<PassReport, OutboxStoreError> {
        let mut report = PassReport::default();

        for PendingDelivery { mut item, recipient } in self.store.due_items(&self.policy)? {
            let now = self.clock.now();

            if item.is_backing_off(&self.policy, now) {
                debug!(
                    item_id = %item.id,
                    attempt_count = item.attempt_count,
                    earliest_retry = ?item.earliest_retry(&self.policy),
                    "not processing outbox item due to back-off policy"
                );
                report.backing_off += 1;
                continue;
            }

            let outcome = self.attempt(&item, &recipient);
            match &outcome {
                DeliveryOutcome::Delivered => report.delivered += 1,
                DeliveryOutcome::Failed(_) => report.failed += 1,
                DeliveryOutcome::Rejected => report.rejected += 1,
            }

            item.record_attempt(&outcome, now, &self.policy);
            if let Err(e) = self.store.save_attempt(&item) {
                error!(item_id = %item.id, error = %e, "failed to persist outbox bookkeeping");
                report.persist_errors += 1;
            }
        }

        Ok(report)
    }

    fn attempt(&self, item: &OutboxItem, recipient: &Recipient) -> DeliveryOutcome {
        if !recipient.is_confirmed() && !item.send_if_unconfirmed {
            info!(
                item_id = %item.id,
                recipient = %recipient.id,
                "not sending outbox item: recipient is unconfirmed"
            );
            return DeliveryOutcome::Rejected;
        }

        match self.sender.send(&item.envelope(&recipient.address)) {
            Ok(()) => {
                debug!(item_id = %item.id, attempt = item.attempt_count + 1, "outbox item sent");
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                error!(
                    item_id = %item.id,
                    attempt = item.attempt_count + 1,
                    error = %e,
                    "exception while sending outbox item"
                );
                DeliveryOutcome::Failed(e.to_string())
            }
        }
    }
}

impl<S, M, C> Task for OutboxProcessor<S, M, C>
where
    S: OutboxStore + 'static,
    M: MessageSender + 'static,
    C: Clock + 'static,
{
    fn name(&self) -> &str {
        OUTBOX_TASK
    }

    fn run(&self, ctx: &RunContext) -> anyhow::Result<()> {
        let report = self.process_pass()?;
        info!(
            iteration = ctx.iteration,
            attempted = report.attempted(),
            delivered = report.delivered,
            failed = report.failed,
            rejected = report.rejected,
            backing_off = report.backing_off,
            "outbox pass finished"
        );
        if report.persist_errors > 0 {
            anyhow::bail!(
                "outbox pass could not persist {} of {} attempts",
                report.persist_errors,
                report.attempted()
            );
        }
        Ok(())
    }
}
