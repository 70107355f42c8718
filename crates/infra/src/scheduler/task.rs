use std::sync::Arc;

/// Why the loop woke up for this run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WakeReason {
    /// The interval elapsed without a nudge.
    Interval,
    /// Someone called `nudge` (possibly while the previous run was in flight).
    Nudge,
}

/// Per-run information handed to a task.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// 1-based run counter for this task since start.
    pub iteration: u64,
    pub wake: WakeReason,
}

/// A periodic unit of work.
///
/// `run` is called from the task's own thread and is never called
/// concurrently with itself. Returning an error (or panicking) fails only the
/// current run; the scheduler keeps going.
pub trait Task: Send + Sync + 'static {
    /// Stable name used for logging, thread naming and registry lookups.
    fn name(&self) -> &str;

    fn run(&self, ctx: &RunContext) -> anyhow::Result<()>;
}

impl<T: Task> Task for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn run(&self, ctx: &RunContext) -> anyhow::Result<()> {
        (**self).run(ctx)
    }
}
