//! Append-only log of authentication attempts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use identityd_core::{AccountId, AliasId, AttemptId};

/// A stored authentication attempt.
///
/// Immutable once written. `sequence` is assigned by the log on append and is
/// strictly increasing, which gives attempts sharing a timestamp a total order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: AttemptId,
    pub sequence: u64,
    pub account_id: AccountId,
    pub alias_id: AliasId,
    /// Client/channel the attempt came through (e.g. "web", "mobile").
    pub client: String,
    pub created_at: DateTime<Utc>,
    pub success: bool,
}

impl AttemptRecord {
    /// Total order used for "most recent": creation time, then insertion sequence.
    pub fn ordering_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.sequence)
    }
}

/// An attempt about to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttempt {
    pub account_id: AccountId,
    pub alias_id: AliasId,
    pub client: String,
    pub created_at: DateTime<Utc>,
    pub success: bool,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttemptLogError {
    #[error("attempt log storage error: {0}")]
    Storage(String),
}

/// Attempt log boundary.
///
/// Authentication paths only ever append; the retention sweeper is the only
/// component allowed to delete (through its own capability in infra).
pub trait AttemptLog: Send + Sync {
    /// Append a new attempt and return it with its assigned id and sequence.
    fn append(&self, attempt: NewAttempt) -> Result<AttemptRecord, AttemptLogError>;

    /// Attempts for an account created at or after `since`.
    ///
    /// When `client` is given only attempts through that client are returned.
    /// Results are ordered oldest first by [`AttemptRecord::ordering_key`].
    fn attempts_since(
        &self,
        account_id: AccountId,
        client: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptRecord>, AttemptLogError>;
}

impl<T: AttemptLog + ?Sized> AttemptLog for Arc<T> {
    fn append(&self, attempt: NewAttempt) -> Result<AttemptRecord, AttemptLogError> {
        (**self).append(attempt)
    }

    fn attempts_since(
        &self,
        account_id: AccountId,
        client: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptRecord>, AttemptLogError> {
        (**self).attempts_since(account_id, client, since)
    }
}

impl<T: AttemptLog + ?Sized> AttemptLog for &T {
    fn append(&self, attempt: NewAttempt) -> Result<AttemptRecord, AttemptLogError> {
        (**self).append(attempt)
    }

    fn attempts_since(
        &self,
        account_id: AccountId,
        client: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptRecord>, AttemptLogError> {
        (**self).attempts_since(account_id, client, since)
    }
}
