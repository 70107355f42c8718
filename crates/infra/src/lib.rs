//! Infrastructure layer: scheduler, outbox delivery, retention, storage and
//! configuration.

pub mod attempts;
pub mod config;
pub mod outbox;
pub mod postgres;
pub mod retention;
pub mod scheduler;


pub use attempts::InMemoryAttemptLog;
pub use config::{ConfigError, Settings};
pub use postgres::{PostgresRetention, PostgresStore, RetainedTable};
pub use retention::{RetentionSweeper, RetentionTarget};
pub use scheduler::{Nudger, RunContext, SchedulerError, Task, TaskRegistry, WakeReason};
