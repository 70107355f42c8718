//! `identityd-core`: shared primitives for the identity backend.
//!
//! Pure building blocks only: identifiers, time, and the domain error model.
//! Storage, scheduling and transport live in `identityd-infra`.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{AccountId, AliasId, AttemptId, OutboxItemId};
