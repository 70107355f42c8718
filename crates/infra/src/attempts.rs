//! In-memory attempt log.

use std::sync::RwLock;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use identityd_auth::{AttemptLog, AttemptLogError, AttemptRecord, NewAttempt};
use identityd_core::{AccountId, AttemptId};

use crate::retention::RetentionTarget;

fn poisoned<T>(_: T) -> AttemptLogError {
    AttemptLogError::Storage("attempt log lock poisoned".to_string())
}

#[derive(Debug, Default)]
struct Inner {
    next_sequence: u64,
    rows: Vec<AttemptRecord>,
}

/// In-memory attempt log for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAttemptLog {
    inner: RwLock<Inner>,
}

impl InMemoryAttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttemptLog for InMemoryAttemptLog {
    fn append(&self, attempt: NewAttempt) -> Result<AttemptRecord, AttemptLogError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        inner.next_sequence += 1;
        let record = AttemptRecord {
            id: AttemptId::new(),
            sequence: inner.next_sequence,
            account_id: attempt.account_id,
            alias_id: attempt.alias_id,
            client: attempt.client,
            created_at: attempt.created_at,
            success: attempt.success,
        };
        inner.rows.push(record.clone());
        Ok(record)
    }

    fn attempts_since(
        &self,
        account_id: AccountId,
        client: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<AttemptRecord>, AttemptLogError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut out: Vec<AttemptRecord> = inner
            .rows
            .iter()
            .filter(|r| r.account_id == account_id)
            .filter(|r| client.is_none_or(|c| r.client == c))
            .filter(|r| r.created_at >= since)
            .cloned()
            .collect();
        out.sort_by_key(AttemptRecord::ordering_key);
        Ok(out)
    }
}

impl RetentionTarget for InMemoryAttemptLog {
    fn entity(&self) -> &'static str {
        "login_attempts"
    }

    fn delete_created_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let before = inner.rows.len();
        inner.rows.retain(|r| r.created_at >= cutoff);
        Ok((before - inner.rows.len()) as u64)
    }
}
