//! Process-wide set of task runners.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::SchedulerError;
use super::runner::{Nudger, RunnerStats, TaskRunner};
use super::task::Task;

struct Entry {
    runner: TaskRunner,
    interval: Duration,
}

/// Holds one runner per task, built once at startup and handed to whoever
/// needs to nudge or stop tasks.
#[derive(Default)]
pub struct TaskRegistry {
    entries: Vec<Entry>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task to run every `interval`. Names must be unique.
    pub fn register(&mut self, task: Arc<dyn Task>, interval: Duration) -> Result<Nudger, SchedulerError> {
        let name = task.name().to_string();
        if self.entries.iter().any(|e| e.runner.name() == name) {
            return Err(SchedulerError::DuplicateTask(name));
        }
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval(name));
        }

        let runner = TaskRunner::new(task);
        let nudger = runner.nudger();
        self.entries.push(Entry { runner, interval });
        Ok(nudger)
    }

    /// Start every registered task that has not been started yet. A task whose
    /// loop has already exited stays stopped.
    pub fn start_all(&mut self) -> Result<(), SchedulerError> {
        for entry in &mut self.entries {
            if entry.runner.is_started() {
                continue;
            }
            entry.runner.start(entry.interval)?;
        }
        info!(tasks = self.entries.len(), "scheduler started");
        Ok(())
    }

    pub fn nudger(&self, name: &str) -> Option<Nudger> {
        self.find(name).map(TaskRunner::nudger)
    }

    pub fn nudge(&self, name: &str) -> Result<(), SchedulerError> {
        self.find(name)
            .map(TaskRunner::nudge)
            .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))
    }

    pub fn stats(&self, name: &str) -> Option<RunnerStats> {
        self.find(name).map(TaskRunner::stats)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.runner.name())
    }

    /// Stop all tasks: signal every loop first, then wait for each.
    pub fn shutdown(mut self) {
        for entry in &self.entries {
            entry.runner.request_shutdown();
        }
        for entry in &mut self.entries {
            entry.runner.shutdown();
        }
        info!("scheduler stopped");
    }

    fn find(&self, name: &str) -> Option<&TaskRunner> {
        self.entries
            .iter()
            .map(|e| &e.runner)
            .find(|r| r.name() == name)
    }
}

impl core::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (e.runner.name(), e.interval)))
            .finish()
    }
}
