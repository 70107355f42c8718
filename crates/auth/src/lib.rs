//! `identityd-auth`: authentication gatekeeping.
//!
//! Decoupled from HTTP and storage: the attempt log and the credential hasher
//! are capabilities supplied by the caller.

pub mod attempt;
pub mod credentials;
pub mod lockout;
pub mod login;

pub use attempt::{AttemptLog, AttemptLogError, AttemptRecord, NewAttempt};
pub use credentials::{CredentialError, CredentialVerifier};
pub use lockout::{LockoutGuard, LockoutPolicy, LockoutScope, LockoutStatus, consecutive_failures};
pub use login::{AuthError, Authenticator, LoginOutcome, LoginRequest};
