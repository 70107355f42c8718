//! Single-task execution loop.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info};

use super::SchedulerError;
use super::task::{RunContext, Task, WakeReason};

#[derive(Debug, Default)]
struct WakeState {
    /// Single-slot "run again" request. A flag, not a counter.
    pending: bool,
    shutdown: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Wake {
    Interval,
    Nudge,
    Shutdown,
}

/// Auto-resetting wake signal shared between a loop and its nudgers.
#[derive(Debug, Default)]
struct WakeSignal {
    state: Mutex<WakeState>,
    cond: Condvar,
}

impl WakeSignal {
    fn nudge(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending = true;
        self.cond.notify_one();
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.shutdown = true;
        self.cond.notify_all();
    }

    /// Block until nudged, shut down, or `timeout` elapses.
    ///
    /// A pending nudge is consumed. Shutdown wins over a pending nudge.
    fn wait(&self, timeout: Duration) -> Wake {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |s| !s.pending && !s.shutdown)
            .unwrap_or_else(PoisonError::into_inner);

        if state.shutdown {
            Wake::Shutdown
        } else if state.pending {
            state.pending = false;
            Wake::Nudge
        } else {
            Wake::Interval
        }
    }
}

/// Cloneable handle that asks a task to run as soon as possible.
#[derive(Debug, Clone)]
pub struct Nudger {
    task: Arc<str>,
    signal: Arc<WakeSignal>,
}

impl Nudger {
    pub fn nudge(&self) {
        debug!(task = %self.task, "nudge");
        self.signal.nudge();
    }

    pub fn task(&self) -> &str {
        &self.task
    }
}

/// Runtime statistics for one task loop.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunnerStats {
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub last_error: Option<String>,
    pub last_run_ms: Option<u64>,
}

/// Owns the thread that drives one [`Task`].
pub struct TaskRunner {
    task: Arc<dyn Task>,
    name: Arc<str>,
    signal: Arc<WakeSignal>,
    stats: Arc<Mutex<RunnerStats>>,
    started: bool,
    join: Option<thread::JoinHandle<()>>,
}

impl TaskRunner {
    pub fn new(task: Arc<dyn Task>) -> Self {
        let name: Arc<str> = Arc::from(task.name());
        Self {
            task,
            name,
            signal: Arc::new(WakeSignal::default()),
            stats: Arc::new(Mutex::new(RunnerStats::default())),
            started: false,
            join: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the loop. The first run happens after `interval` or on the first nudge.
    pub fn start(&mut self, interval: Duration) -> Result<(), SchedulerError> {
        if self.started {
            return Err(SchedulerError::AlreadyStarted(self.name.to_string()));
        }
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval(self.name.to_string()));
        }

        let name = self.name.clone();
        let task = self.task.clone();
        let signal = self.signal.clone();
        let stats = self.stats.clone();

        let join = thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || supervise(&name, task.as_ref(), &signal, &stats, interval))
            .map_err(|source| SchedulerError::Spawn {
                name: self.name.to_string(),
                source,
            })?;

        self.started = true;
        self.join = Some(join);
        Ok(())
    }

    pub fn nudge(&self) {
        self.signal.nudge();
    }

    pub fn nudger(&self) -> Nudger {
        Nudger {
            task: self.name.clone(),
            signal: self.signal.clone(),
        }
    }

    pub fn stats(&self) -> RunnerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether `start` has succeeded, even if the loop has since exited.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Whether the loop thread is alive.
    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Ask the loop to stop after any in-flight run. Does not wait.
    pub fn request_shutdown(&self) {
        self.signal.shutdown();
    }

    /// Request shutdown and wait for the loop thread to exit.
    pub fn shutdown(&mut self) {
        self.request_shutdown();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!(task = %self.name, "task thread panicked during shutdown");
            }
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.signal.shutdown();
    }
}

impl core::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("name", &self.name)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

/// Thread body: runs the loop and reports anything that escapes it.
fn supervise(
    name: &str,
    task: &dyn Task,
    signal: &WakeSignal,
    stats: &Mutex<RunnerStats>,
    interval: Duration,
) {
    info!(task = name, interval_secs = interval.as_secs_f64(), "task loop started");

    match panic::catch_unwind(AssertUnwindSafe(|| run_loop(name, task, signal, stats, interval))) {
        Ok(Ok(())) => info!(task = name, "task loop stopped"),
        Ok(Err(e)) => error!(task = name, fatal = true, error = %e, "task loop terminated"),
        Err(payload) => error!(
            task = name,
            fatal = true,
            panic = %panic_message(payload.as_ref()),
            "task loop terminated"
        ),
    }
}

fn run_loop(
    name: &str,
    task: &dyn Task,
    signal: &WakeSignal,
    stats: &Mutex<RunnerStats>,
    interval: Duration,
) -> Result<(), SchedulerError> {
    let mut iteration = 0u64;

    loop {
        let wake = match signal.wait(interval) {
            Wake::Shutdown => return Ok(()),
            Wake::Nudge => WakeReason::Nudge,
            Wake::Interval => WakeReason::Interval,
        };
        iteration += 1;

        let ctx = RunContext { iteration, wake };
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.run(&ctx)));
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(payload) => Some(format!("panic: {}", panic_message(payload.as_ref()))),
        };

        {
            let mut s = stats
                .lock()
                .map_err(|_| SchedulerError::StatsPoisoned(name.to_string()))?;
            s.last_run_ms = Some(elapsed_ms);
            match &failure {
                None => s.runs_completed += 1,
                Some(e) => {
                    s.runs_failed += 1;
                    s.last_error = Some(e.clone());
                }
            }
        }

        match failure {
            None => info!(task = name, iteration, ?wake, elapsed_ms, "task run completed"),
            Some(e) => error!(task = name, iteration, ?wake, elapsed_ms, error = %e, "task run failed"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::mpsc;

    use super::*;

    /// Poll `cond` until it holds or `timeout` passes.
    pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    /// Poison a runner's statistics lock so its loop fails on the next run.
    pub(crate) fn poison_stats(runner: &TaskRunner) {
        let stats = runner.stats.clone();
        let _ = thread::spawn(move || {
            let _guard = stats.lock().unwrap();
            panic!("poisoning stats");
        })
        .join();
    }

    const LONG: Duration = Duration::from_secs(3600);

    #[derive(Default)]
    struct Counting {
        runs: AtomicU64,
    }

    impl Task for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn run(&self, _ctx: &RunContext) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Announces each run start and blocks until released.
    struct Gated {
        started: Mutex<mpsc::Sender<RunContext>>,
        release: Mutex<mpsc::Receiver<()>>,
        runs: AtomicU64,
    }

    impl Task for Gated {
        fn name(&self) -> &str {
            "gated"
        }

        fn run(&self, ctx: &RunContext) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let _ = self.started.lock().unwrap().send(ctx.clone());
            let _ = self.release.lock().unwrap().recv_timeout(Duration::from_secs(5));
            Ok(())
        }
    }

    struct Flaky {
        runs: AtomicU64,
    }

    impl Task for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn run(&self, ctx: &RunContext) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match ctx.iteration {
                1 => anyhow::bail!("store unavailable"),
                2 => panic!("boom"),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn runs_on_interval_without_nudges() {
        let task = Arc::new(Counting::default());
        let mut runner = TaskRunner::new(task.clone());
        runner.start(Duration::from_millis(20)).unwrap();

        assert!(wait_until(Duration::from_secs(2), || task.runs.load(Ordering::SeqCst) >= 3));
        runner.shutdown();
    }

    #[test]
    fn nudge_while_waiting_runs_immediately() {
        let task = Arc::new(Counting::default());
        let mut runner = TaskRunner::new(task.clone());
        runner.start(LONG).unwrap();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);

        runner.nudge();
        assert!(wait_until(Duration::from_secs(2), || task.runs.load(Ordering::SeqCst) == 1));
        runner.shutdown();
    }

    #[test]
    fn nudges_during_a_run_collapse_into_one_extra_run() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let task = Arc::new(Gated {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
            runs: AtomicU64::new(0),
        });
        let mut runner = TaskRunner::new(task.clone());
        runner.start(LONG).unwrap();
        let nudger = runner.nudger();

        nudger.nudge();
        let first = started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.wake, WakeReason::Nudge);

        for _ in 0..5 {
            nudger.nudge();
        }
        release_tx.send(()).unwrap();

        let second = started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(second.iteration, 2);
        assert_eq!(second.wake, WakeReason::Nudge);
        release_tx.send(()).unwrap();

        // No third run: the flurry was a single pending request.
        assert!(started_rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(task.runs.load(Ordering::SeqCst), 2);

        runner.shutdown();
    }

    #[test]
    fn failing_and_panicking_runs_do_not_stop_the_loop() {
        let task = Arc::new(Flaky {
            runs: AtomicU64::new(0),
        });
        let mut runner = TaskRunner::new(task.clone());
        runner.start(LONG).unwrap();

        for expected in 1..=3 {
            runner.nudge();
            assert!(wait_until(Duration::from_secs(2), || {
                let s = runner.stats();
                s.runs_completed + s.runs_failed == expected
            }));
        }

        let stats = runner.stats();
        assert_eq!(stats.runs_failed, 2);
        assert_eq!(stats.runs_completed, 1);
        assert_eq!(stats.last_error.as_deref(), Some("panic: boom"));
        assert!(runner.is_running());

        runner.shutdown();
        assert!(!runner.is_running());
    }

    #[test]
    fn starting_twice_is_rejected() {
        let mut runner = TaskRunner::new(Arc::new(Counting::default()));
        runner.start(LONG).unwrap();

        assert!(matches!(runner.start(LONG), Err(SchedulerError::AlreadyStarted(name)) if name == "counting"));
        runner.shutdown();
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut runner = TaskRunner::new(Arc::new(Counting::default()));
        assert!(matches!(runner.start(Duration::ZERO), Err(SchedulerError::ZeroInterval(_))));
    }

    #[test]
    fn shutdown_waits_for_in_flight_run() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let task = Arc::new(Gated {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
            runs: AtomicU64::new(0),
        });
        let mut runner = TaskRunner::new(task.clone());
        runner.start(LONG).unwrap();

        runner.nudge();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        runner.request_shutdown();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            release_tx.send(()).unwrap();
        });
        runner.shutdown();
        releaser.join().unwrap();

        assert_eq!(runner.stats().runs_completed, 1);
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn loop_failure_ends_only_that_task() {
        let broken_task = Arc::new(Counting::default());
        let healthy_task = Arc::new(Counting::default());
        let mut broken = TaskRunner::new(broken_task.clone());
        let mut healthy = TaskRunner::new(healthy_task.clone());

        poison_stats(&broken);
        broken.start(Duration::from_millis(10)).unwrap();
        healthy.start(Duration::from_millis(10)).unwrap();

        assert!(wait_until(Duration::from_secs(2), || !broken.is_running()));
        assert!(broken.is_started());
        assert_eq!(broken_task.runs.load(Ordering::SeqCst), 1);

        assert!(wait_until(Duration::from_secs(2), || {
            healthy_task.runs.load(Ordering::SeqCst) >= 3
        }));
        assert!(healthy.is_running());
        assert_eq!(healthy.stats().runs_failed, 0);

        broken.shutdown();
        healthy.shutdown();
    }
}
