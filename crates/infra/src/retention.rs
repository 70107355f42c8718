//! Periodic deletion of rows older than a configured horizon.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use identityd_core::{Clock, DomainError, DomainResult};

use crate::scheduler::{RunContext, Task};

/// A table whose old rows can be swept by creation time.
pub trait RetentionTarget: Send + Sync {
    /// Short entity name, used in task names and logs (e.g. `login_attempts`).
    fn entity(&self) -> &'static str;

    /// Delete every row created strictly before `cutoff`; returns the count.
    fn delete_created_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;
}

impl<T: RetentionTarget + ?Sized> RetentionTarget for Arc<T> {
    fn entity(&self) -> &'static str {
        (**self).entity()
    }

    fn delete_created_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        (**self).delete_created_before(cutoff)
    }
}

/// Deletes rows of one target older than `horizon_days`.
///
/// Registered as `retention:<entity>`, so several sweepers can share a
/// registry.
pub struct RetentionSweeper<T, C> {
    name: String,
    target: T,
    clock: C,
    horizon: Duration,
}

impl<T, C> RetentionSweeper<T, C>
where
    T: RetentionTarget,
    C: Clock,
{
    pub fn new(target: T, clock: C, horizon_days: u32) -> DomainResult<Self> {
        if horizon_days == 0 {
            return Err(DomainError::validation(format!(
                "retention horizon for {} must be at least one day",
                target.entity()
            )));
        }
        Ok(Self {
            name: format!("retention:{}", target.entity()),
            target,
            clock,
            horizon: Duration::days(i64::from(horizon_days)),
        })
    }

    /// Rows created before this instant are eligible for deletion.
    pub fn cutoff(&self) -> DateTime<Utc> {
        self.clock.now() - self.horizon
    }

    pub fn sweep(&self) -> anyhow::Result<u64> {
        let cutoff = self.cutoff();
        let deleted = self.target.delete_created_before(cutoff)?;
        info!(
            entity = self.target.entity(),
            %cutoff,
            deleted,
            "retention sweep finished"
        );
        Ok(deleted)
    }
}

impl<T, C> Task for RetentionSweeper<T, C>
where
    T: RetentionTarget + 'static,
    C: Clock + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _ctx: &RunContext) -> anyhow::Result<()> {
        self.sweep().map(|_| ())
    }
}
