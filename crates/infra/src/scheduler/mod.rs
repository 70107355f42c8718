//! Periodic task scheduler with debounced wake-up.
//!
//! ## Design
//!
//! - One dedicated thread per task; runs of the same task never overlap
//! - Each loop waits up to its interval, then runs the task
//! - `Nudger::nudge` wakes a waiting loop immediately, or latches a single
//!   extra run if the task is mid-run (any number of nudges collapse into one)
//! - Task errors and panics are logged and retried on the next wake
//! - Shutdown lets an in-flight run finish before the thread exits
//!
//! ## Components
//!
//! - `Task`: the unit of periodic work
//! - `TaskRunner`: owns one task's thread and wake signal
//! - `TaskRegistry`: process-wide set of runners, passed around explicitly

pub mod registry;
pub mod runner;
pub mod task;

pub use registry::TaskRegistry;
pub use runner::{Nudger, RunnerStats, TaskRunner};
pub use task::{RunContext, Task, WakeReason};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task already started: {0}")]
    AlreadyStarted(String),

    #[error("task already registered: {0}")]
    DuplicateTask(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("task {0} has a zero interval")]
    ZeroInterval(String),

    #[error("failed to spawn thread for task {name}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("run statistics lock poisoned for task {0}")]
    StatsPoisoned(String),
}
