//! Time-windowed consecutive-failure lockout.
//!
//! An account is locked while the number of failed attempts since its most
//! recent success, counted only inside the trailing window, is at or above the
//! configured threshold. The check is read-only and must run before the
//! password is verified and before the current attempt is recorded.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use identityd_core::{AccountId, Clock, DomainError, DomainResult};

use crate::attempt::{AttemptLog, AttemptLogError, AttemptRecord};

/// Which attempts count towards a lockout.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockoutScope {
    /// Failures through any client count against the account.
    #[default]
    Account,
    /// Failures only count against the client they came through.
    Client,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LockoutPolicy {
    window: Duration,
    max_failures: u32,
    scope: LockoutScope,
}

impl LockoutPolicy {
    pub fn new(window_mins: u32, max_failures: u32) -> DomainResult<Self> {
        if window_mins == 0 {
            return Err(DomainError::validation("lockout window must be at least one minute"));
        }
        if max_failures == 0 {
            return Err(DomainError::validation("lockout threshold must be at least 1"));
        }
        Ok(Self {
            window: Duration::minutes(i64::from(window_mins)),
            max_failures,
            scope: LockoutScope::Account,
        })
    }

    pub fn with_scope(mut self, scope: LockoutScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    pub fn scope(&self) -> LockoutScope {
        self.scope
    }

    /// Oldest creation time still inside the window (inclusive).
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.window
    }

    /// Decide the lockout state from an account's attempt history.
    ///
    /// `attempts` may be in any order and may include attempts outside the
    /// window; both are handled here.
    pub fn evaluate(&self, attempts: &[AttemptRecord], now: DateTime<Utc>) -> LockoutStatus {
        let run = failure_run(attempts, self.window_start(now));
        let count = run.len() as u32;

        if count < self.max_failures {
            return LockoutStatus::Open {
                consecutive_failures: count,
            };
        }

        // The lock lifts once enough of the oldest failures in the run have
        // aged out that fewer than `max_failures` remain.
        let pivot = run[(self.max_failures - 1) as usize];
        LockoutStatus::Locked {
            consecutive_failures: count,
            locked_until: pivot.created_at + self.window,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockoutStatus {
    Open {
        consecutive_failures: u32,
    },
    Locked {
        consecutive_failures: u32,
        /// Earliest instant after which the current failures no longer lock.
        locked_until: DateTime<Utc>,
    },
}

impl LockoutStatus {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockoutStatus::Locked { .. })
    }

    pub fn consecutive_failures(&self) -> u32 {
        match self {
            LockoutStatus::Open {
                consecutive_failures,
            }
            | LockoutStatus::Locked {
                consecutive_failures,
                ..
            } => *consecutive_failures,
        }
    }
}

/// Failures since the most recent success, newest first, restricted to
/// attempts created at or after `window_start`.
fn failure_run(attempts: &[AttemptRecord], window_start: DateTime<Utc>) -> Vec<&AttemptRecord> {
    let mut in_window: Vec<&AttemptRecord> = attempts
        .iter()
        .filter(|a| a.created_at >= window_start)
        .collect();
    in_window.sort_by_key(|a| std::cmp::Reverse(a.ordering_key()));

    in_window.into_iter().take_while(|a| !a.success).collect()
}

/// Number of consecutive failures since the most recent success inside the window.
pub fn consecutive_failures(attempts: &[AttemptRecord], window_start: DateTime<Utc>) -> u32 {
    failure_run(attempts, window_start).len() as u32
}

/// Reads the attempt log and applies a [`LockoutPolicy`].
#[derive(Debug)]
pub struct LockoutGuard<L, C> {
    log: L,
    clock: C,
    policy: LockoutPolicy,
}

impl<L, C> LockoutGuard<L, C>
where
    L: AttemptLog,
    C: Clock,
{
    pub fn new(log: L, clock: C, policy: LockoutPolicy) -> Self {
        Self { log, clock, policy }
    }

    pub fn policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Current lockout state for an account attempting to log in via `client`.
    pub fn check(&self, account_id: AccountId, client: &str) -> Result<LockoutStatus, AttemptLogError> {
        let now = self.clock.now();
        let scope_client = match self.policy.scope {
            LockoutScope::Account => None,
            LockoutScope::Client => Some(client),
        };
        let attempts = self
            .log
            .attempts_since(account_id, scope_client, self.policy.window_start(now))?;
        Ok(self.policy.evaluate(&attempts, now))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use identityd_core::{AliasId, AttemptId, ManualClock};
    use proptest::prelude::*;

    use super::*;
    use crate::attempt::NewAttempt;

    pub(crate) fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2018-03-12T08:30:52Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    /// Minimal in-process log for exercising the guard.
    #[derive(Debug, Default)]
    pub(crate) struct VecLog {
        rows: Mutex<Vec<AttemptRecord>>,
    }

    impl VecLog {
        pub(crate) fn rows(&self) -> Vec<AttemptRecord> {
            self.rows.lock().unwrap().clone()
        }
    }

    impl AttemptLog for VecLog {
        fn append(&self, attempt: NewAttempt) -> Result<AttemptRecord, AttemptLogError> {
            let mut rows = self.rows.lock().unwrap();
            let record = AttemptRecord {
                id: AttemptId::new(),
                sequence: rows.len() as u64 + 1,
                account_id: attempt.account_id,
                alias_id: attempt.alias_id,
                client: attempt.client,
                created_at: attempt.created_at,
                success: attempt.success,
            };
            rows.push(record.clone());
            Ok(record)
        }

        fn attempts_since(
            &self,
            account_id: AccountId,
            client: Option<&str>,
            since: DateTime<Utc>,
        ) -> Result<Vec<AttemptRecord>, AttemptLogError> {
            let rows = self.rows.lock().unwrap();
            let mut out: Vec<_> = rows
                .iter()
                .filter(|a| {
                    a.account_id == account_id
                        && a.created_at >= since
                        && client.is_none_or(|c| a.client == c)
                })
                .cloned()
                .collect();
            out.sort_by_key(|a| a.ordering_key());
            Ok(out)
        }
    }

    fn record(seq: u64, created_at: DateTime<Utc>, success: bool) -> AttemptRecord {
        AttemptRecord {
            id: AttemptId::new(),
            sequence: seq,
            account_id: AccountId::new(),
            alias_id: AliasId::new(),
            client: "web".to_string(),
            created_at,
            success,
        }
    }

    fn history(now: DateTime<Utc>, offsets_mins: &[(i64, bool)]) -> Vec<AttemptRecord> {
        offsets_mins
            .iter()
            .enumerate()
            .map(|(i, (mins, ok))| record(i as u64 + 1, now - Duration::minutes(*mins), *ok))
            .collect()
    }

    #[test]
    fn success_inside_window_resets_the_run() {
        let now = t0();
        let attempts = history(now, &[(7, false), (6, false), (5, true), (4, false)]);
        let policy = LockoutPolicy::new(15, 3).unwrap();

        let status = policy.evaluate(&attempts, now);
        assert_eq!(status, LockoutStatus::Open { consecutive_failures: 1 });
    }

    #[test]
    fn simultaneous_failures_both_count() {
        let now = t0();
        let attempts = history(now, &[(5, false), (5, false)]);
        let policy = LockoutPolicy::new(15, 2).unwrap();

        let status = policy.evaluate(&attempts, now);
        assert!(status.is_locked());
        assert_eq!(status.consecutive_failures(), 2);
    }

    #[test]
    fn same_timestamp_ties_are_broken_by_sequence() {
        let now = t0();
        let at = now - Duration::minutes(2);
        // Success was inserted after the failure at the same instant, so it is newer.
        let attempts = vec![record(1, at, false), record(2, at, true)];
        let policy = LockoutPolicy::new(15, 1).unwrap();
        assert!(!policy.evaluate(&attempts, now).is_locked());

        // Reversed insertion order: the failure is newest and locks.
        let attempts = vec![record(1, at, true), record(2, at, false)];
        assert!(policy.evaluate(&attempts, now).is_locked());
    }

    #[test]
    fn failures_outside_window_are_ignored() {
        let now = t0();
        let attempts = history(now, &[(40, false), (30, false), (16, false), (3, false)]);
        let policy = LockoutPolicy::new(15, 2).unwrap();

        assert_eq!(
            policy.evaluate(&attempts, now),
            LockoutStatus::Open { consecutive_failures: 1 }
        );
    }

    #[test]
    fn window_start_is_inclusive() {
        let now = t0();
        let attempts = history(now, &[(15, false), (1, false)]);
        let policy = LockoutPolicy::new(15, 2).unwrap();

        assert!(policy.evaluate(&attempts, now).is_locked());
    }

    #[test]
    fn locked_until_is_when_the_threshold_failure_ages_out() {
        let now = t0();
        let attempts = history(now, &[(10, false), (8, false), (6, false), (2, false)]);
        let policy = LockoutPolicy::new(15, 3).unwrap();

        match policy.evaluate(&attempts, now) {
            LockoutStatus::Locked {
                consecutive_failures,
                locked_until,
            } => {
                assert_eq!(consecutive_failures, 4);
                // Failures at -10 and -8 must both expire; -8 is the third newest.
                assert_eq!(locked_until, now - Duration::minutes(8) + Duration::minutes(15));
                assert!(!policy.evaluate(&attempts, locked_until + Duration::seconds(1)).is_locked());
                assert!(policy.evaluate(&attempts, locked_until).is_locked());
            }
            other => panic!("expected lock, got {other:?}"),
        }
    }

    #[test]
    fn policy_rejects_degenerate_configuration() {
        assert!(LockoutPolicy::new(0, 3).is_err());
        assert!(LockoutPolicy::new(15, 0).is_err());
    }

    #[test]
    fn guard_scopes_to_account_or_client() {
        let now = t0();
        let clock = ManualClock::new(now);
        let log = VecLog::default();
        let account = AccountId::new();
        let alias = AliasId::new();

        for (client, mins) in [("web", 3), ("mobile", 2), ("mobile", 1)] {
            log.append(NewAttempt {
                account_id: account,
                alias_id: alias,
                client: client.to_string(),
                created_at: now - Duration::minutes(mins),
                success: false,
            })
            .unwrap();
        }

        let account_wide = LockoutGuard::new(&log, &clock, LockoutPolicy::new(15, 3).unwrap());
        assert!(account_wide.check(account, "web").unwrap().is_locked());

        let per_client = LockoutGuard::new(
            &log,
            &clock,
            LockoutPolicy::new(15, 3).unwrap().with_scope(LockoutScope::Client),
        );
        assert_eq!(
            per_client.check(account, "web").unwrap(),
            LockoutStatus::Open { consecutive_failures: 1 }
        );
        assert_eq!(per_client.check(account, "mobile").unwrap().consecutive_failures(), 2);

        // Other accounts are unaffected.
        assert!(!account_wide.check(AccountId::new(), "web").unwrap().is_locked());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Each additional failure with no interleaved success raises the count by one.
        #[test]
        fn failure_count_is_monotonic(n in 1usize..30) {
            let now = t0();
            let window_start = now - Duration::minutes(60);
            let mut attempts = Vec::new();
            let mut previous = 0;
            for i in 0..n {
                attempts.push(record(i as u64 + 1, window_start + Duration::seconds(i as i64), false));
                let count = consecutive_failures(&attempts, window_start);
                prop_assert_eq!(count, previous + 1);
                previous = count;
            }
        }

        /// A success anywhere resets the count to the failures recorded after it.
        #[test]
        fn success_resets_count(outcomes in prop::collection::vec(any::<bool>(), 1..40)) {
            let now = t0();
            let window_start = now - Duration::minutes(60);
            let attempts: Vec<_> = outcomes
                .iter()
                .enumerate()
                .map(|(i, ok)| record(i as u64 + 1, window_start + Duration::seconds(i as i64), *ok))
                .collect();

            let expected = outcomes.iter().rev().take_while(|ok| !**ok).count() as u32;
            prop_assert_eq!(consecutive_failures(&attempts, window_start), expected);
        }
    }
}
