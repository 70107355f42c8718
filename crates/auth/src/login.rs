//! Password login gated by the lockout guard.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use identityd_core::{AccountId, AliasId, Clock};

use crate::attempt::{AttemptLog, AttemptLogError, NewAttempt};
use crate::credentials::{CredentialError, CredentialVerifier};
use crate::lockout::{LockoutGuard, LockoutPolicy, LockoutStatus};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error(transparent)]
    AttemptLog(#[from] AttemptLogError),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// A password login for one alias through one client.
#[derive(Debug, Clone, Copy)]
pub struct LoginRequest<'a> {
    pub account_id: AccountId,
    pub alias_id: AliasId,
    pub client: &'a str,
    pub password: &'a str,
    /// Stored digest for the account.
    pub digest: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Accepted,
    Rejected,
    /// Temporarily unavailable; the password was not checked.
    LockedOut { locked_until: DateTime<Utc> },
}

/// Runs the login sequence: lockout check, password check, attempt append.
pub struct Authenticator<L, V, C> {
    guard: LockoutGuard<L, C>,
    verifier: V,
    record_locked_attempts: bool,
}

impl<L, V, C> Authenticator<L, V, C>
where
    L: AttemptLog,
    V: CredentialVerifier,
    C: Clock,
{
    pub fn new(log: L, verifier: V, clock: C, policy: LockoutPolicy) -> Self {
        Self {
            guard: LockoutGuard::new(log, clock, policy),
            verifier,
            record_locked_attempts: false,
        }
    }

    /// Also append a failed attempt when a login is refused for lockout.
    ///
    /// Off by default: recording refused attempts keeps extending the lock for
    /// as long as someone keeps trying.
    pub fn record_locked_attempts(mut self, record: bool) -> Self {
        self.record_locked_attempts = record;
        self
    }

    pub fn guard(&self) -> &LockoutGuard<L, C> {
        &self.guard
    }

    pub fn login(&self, request: LoginRequest<'_>) -> Result<LoginOutcome, AuthError> {
        let status = self.guard.check(request.account_id, request.client)?;

        if let LockoutStatus::Locked {
            consecutive_failures,
            locked_until,
        } = status
        {
            warn!(
                account_id = %request.account_id,
                client = request.client,
                consecutive_failures,
                %locked_until,
                "login refused: account locked out"
            );
            if self.record_locked_attempts {
                self.append(&request, false)?;
            }
            return Ok(LoginOutcome::LockedOut { locked_until });
        }

        let ok = self.verifier.verify(request.password, request.digest)?;
        self.append(&request, ok)?;

        debug!(account_id = %request.account_id, client = request.client, success = ok, "login attempt recorded");
        Ok(if ok {
            LoginOutcome::Accepted
        } else {
            LoginOutcome::Rejected
        })
    }

    fn append(&self, request: &LoginRequest<'_>, success: bool) -> Result<(), AttemptLogError> {
        self.guard.log().append(NewAttempt {
            account_id: request.account_id,
            alias_id: request.alias_id,
            client: request.client.to_string(),
            created_at: self.guard.clock().now(),
            success,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use identityd_core::ManualClock;

    use super::*;
    use crate::lockout::tests::{VecLog, t0};

    /// Treats the digest as the plaintext; "!" marks an unparsable digest.
    struct PlainVerifier;

    impl CredentialVerifier for PlainVerifier {
        fn hash(&self, plaintext: &str) -> Result<String, CredentialError> {
            Ok(plaintext.to_string())
        }

        fn verify(&self, plaintext: &str, digest: &str) -> Result<bool, CredentialError> {
            if digest == "!" {
                return Err(CredentialError::MalformedDigest("bang".to_string()));
            }
            Ok(plaintext == digest)
        }
    }

    fn setup(max_failures: u32) -> (Arc<VecLog>, Arc<ManualClock>, Authenticator<Arc<VecLog>, PlainVerifier, Arc<ManualClock>>) {
        let log = Arc::new(VecLog::default());
        let clock = Arc::new(ManualClock::new(t0()));
        let auth = Authenticator::new(
            log.clone(),
            PlainVerifier,
            clock.clone(),
            LockoutPolicy::new(15, max_failures).unwrap(),
        );
        (log, clock, auth)
    }

    fn request<'a>(account_id: AccountId, alias_id: AliasId, password: &'a str) -> LoginRequest<'a> {
        LoginRequest {
            account_id,
            alias_id,
            client: "web",
            password,
            digest: "correct horse",
        }
    }

    #[test]
    fn records_each_checked_attempt() {
        let (log, _clock, auth) = setup(3);
        let (account, alias) = (AccountId::new(), AliasId::new());

        assert_eq!(auth.login(request(account, alias, "wrong")).unwrap(), LoginOutcome::Rejected);
        assert_eq!(
            auth.login(request(account, alias, "correct horse")).unwrap(),
            LoginOutcome::Accepted
        );

        let rows = log.rows();
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].success);
        assert!(rows[1].success);
    }

    #[test]
    fn locked_out_login_skips_password_check_and_log() {
        let (log, clock, auth) = setup(2);
        let (account, alias) = (AccountId::new(), AliasId::new());

        auth.login(request(account, alias, "a")).unwrap();
        clock.advance(Duration::minutes(1));
        auth.login(request(account, alias, "b")).unwrap();
        clock.advance(Duration::minutes(1));

        // Even the right password is refused while locked.
        let outcome = auth.login(request(account, alias, "correct horse")).unwrap();
        assert_eq!(
            outcome,
            LoginOutcome::LockedOut {
                locked_until: t0() + Duration::minutes(15)
            }
        );
        assert_eq!(log.rows().len(), 2);

        // Once the first failure ages out the account opens again.
        clock.set(t0() + Duration::minutes(15) + Duration::seconds(1));
        assert_eq!(
            auth.login(request(account, alias, "correct horse")).unwrap(),
            LoginOutcome::Accepted
        );
    }

    #[test]
    fn locked_attempts_can_be_recorded() {
        let (log, _clock, auth) = setup(1);
        let auth = auth.record_locked_attempts(true);
        let (account, alias) = (AccountId::new(), AliasId::new());

        auth.login(request(account, alias, "nope")).unwrap();
        let outcome = auth.login(request(account, alias, "correct horse")).unwrap();

        assert!(matches!(outcome, LoginOutcome::LockedOut { .. }));
        let rows = log.rows();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| !r.success));
    }

    #[test]
    fn verifier_errors_propagate_without_recording() {
        let (log, _clock, auth) = setup(3);
        let mut req = request(AccountId::new(), AliasId::new(), "x");
        req.digest = "!";

        let err = auth.login(req).unwrap_err();
        assert!(matches!(err, AuthError::Credential(CredentialError::MalformedDigest(_))));
        assert!(log.rows().is_empty());
    }
}
