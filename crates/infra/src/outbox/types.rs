//! Outbox item model and delivery policy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use identityd_core::{AliasId, OutboxItemId};

/// Attempts after which a failing item is abandoned.
pub const PERMANENT_FAILURE_THRESHOLD: u32 = 10;

/// Error recorded when the recipient has not confirmed their address.
pub const UNCONFIRMED_ERROR: &str = "Unconfirmed";

/// Selection and back-off rules for outbox delivery.
///
/// Back-off is fixed: an item that has been attempted `n` times may be retried
/// `2^n` minutes after its last attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    pub permanent_failure_threshold: u32,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            permanent_failure_threshold: PERMANENT_FAILURE_THRESHOLD,
        }
    }
}

impl DeliveryPolicy {
    pub fn new(permanent_failure_threshold: u32) -> Self {
        Self {
            permanent_failure_threshold,
        }
    }

    /// Wait required after `attempt_count` attempts.
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        // Capped so `last_attempt + backoff` stays inside chrono's date range.
        Duration::minutes(1i64 << attempt_count.min(30))
    }
}

/// A message waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: OutboxItemId,
    pub recipient: AliasId,
    pub from: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    /// Deliver even if the recipient has not confirmed their address.
    pub send_if_unconfirmed: bool,
    pub created_at: DateTime<Utc>,
    /// `None` means never attempted.
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    /// Empty/`None` means the last attempt succeeded (or none happened).
    pub last_error: Option<String>,
}

impl OutboxItem {
    pub fn from_new(new: NewOutboxItem, created_at: DateTime<Utc>) -> Self {
        Self {
            id: OutboxItemId::new(),
            recipient: new.recipient,
            from: new.from,
            reply_to: new.reply_to,
            subject: new.subject,
            body_text: new.body_text,
            body_html: new.body_html,
            send_if_unconfirmed: new.send_if_unconfirmed,
            created_at,
            last_attempt_at: None,
            attempt_count: 0,
            last_error: None,
        }
    }

    pub fn has_error(&self) -> bool {
        self.last_error.as_deref().is_some_and(|e| !e.is_empty())
    }

    pub fn never_attempted(&self) -> bool {
        self.last_attempt_at.is_none()
    }

    /// Failed and out of attempts; never selected again.
    pub fn is_terminal(&self, policy: &DeliveryPolicy) -> bool {
        self.has_error() && self.attempt_count >= policy.permanent_failure_threshold
    }

    /// Selection predicate: never tried, or failed with attempts remaining.
    pub fn is_due(&self, policy: &DeliveryPolicy) -> bool {
        self.never_attempted()
            || (self.has_error() && self.attempt_count < policy.permanent_failure_threshold)
    }

    /// Earliest instant a retry is allowed; `None` if never attempted.
    pub fn earliest_retry(&self, policy: &DeliveryPolicy) -> Option<DateTime<Utc>> {
        self.last_attempt_at
            .map(|at| at + policy.backoff(self.attempt_count))
    }

    pub fn is_backing_off(&self, policy: &DeliveryPolicy, now: DateTime<Utc>) -> bool {
        self.earliest_retry(policy).is_some_and(|earliest| now < earliest)
    }

    /// Apply the bookkeeping for one processing attempt.
    pub fn record_attempt(&mut self, outcome: &DeliveryOutcome, now: DateTime<Utc>, policy: &DeliveryPolicy) {
        self.last_attempt_at = Some(now);
        self.attempt_count = self.attempt_count.saturating_add(1);
        match outcome {
            DeliveryOutcome::Delivered => self.last_error = None,
            DeliveryOutcome::Failed(error) => self.last_error = Some(error.clone()),
            DeliveryOutcome::Rejected => {
                self.last_error = Some(UNCONFIRMED_ERROR.to_string());
                self.attempt_count = self.attempt_count.max(policy.permanent_failure_threshold);
            }
        }
    }

    pub fn envelope(&self, to: &str) -> Envelope {
        Envelope {
            from: self.from.clone(),
            reply_to: self.reply_to.clone(),
            to: to.to_string(),
            subject: self.subject.clone(),
            text: self.body_text.clone(),
            html: self.body_html.clone(),
        }
    }
}

/// Input for enqueueing a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboxItem {
    pub recipient: AliasId,
    pub from: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub send_if_unconfirmed: bool,
}

/// Addressee of outbox items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: AliasId,
    pub address: String,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Recipient {
    pub fn is_confirmed(&self) -> bool {
        self.confirmed_at.is_some()
    }
}

/// A due item together with its recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub item: OutboxItem,
    pub recipient: Recipient,
}

/// What the sender is asked to deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope {
    pub from: String,
    pub reply_to: Option<String>,
    pub to: String,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
}

/// Result of one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Transient failure; retried with back-off.
    Failed(String),
    /// Recipient unconfirmed and unconfirmed delivery not permitted.
    Rejected,
}
