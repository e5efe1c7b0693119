//! Named periodic-task scheduler.
//!
//! Each task runs on its own tokio task driven by [`tokio::time::interval_at`].
//! Re-registering a name aborts the previous task before the new one is
//! spawned, so a name never owns more than one live timer. Every tick checks
//! the task's liveness flag at entry; a tick that was already queued when the
//! task was removed is a no-op.

use crate::core::error::{TimerTaskError, panic_message};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Callback invoked on every tick. An `Err` is logged; the schedule continues.
pub type TaskCallback = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

struct PeriodicTask {
    interval: Duration,
    alive: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    fn stop(self) {
        self.alive.store(false, Ordering::Release);
        self.handle.abort();
    }

    fn is_running(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.handle.is_finished()
    }
}

/// Scheduler of named periodic tasks. Clones share the same task table.
#[derive(Clone, Default)]
pub struct TimerManager {
    tasks: Arc<Mutex<HashMap<String, PeriodicTask>>>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` to run every `interval` under `name`.
    ///
    /// Any task already registered under `name` is stopped first. With
    /// `run_immediately` the callback runs once, synchronously, before the
    /// schedule starts. Must be called from within a tokio runtime.
    pub fn add_periodic_task(
        &self,
        name: &str,
        callback: TaskCallback,
        interval: Duration,
        run_immediately: bool,
    ) {
        // A zero period would make `interval_at` panic.
        let interval = interval.max(Duration::from_millis(1));

        let previous = self.lock().remove(name);
        if let Some(previous) = previous {
            debug!(
                event = "timer_task_replaced",
                task = name,
                old_interval_ms = previous.interval.as_millis() as u64,
                new_interval_ms = interval.as_millis() as u64,
                "Replacing periodic task"
            );
            previous.stop();
        }

        if run_immediately {
            run_tick(name, &callback);
        }

        let alive = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(tick_loop(
            name.to_string(),
            callback,
            interval,
            alive.clone(),
        ));

        let replaced = self.lock().insert(
            name.to_string(),
            PeriodicTask {
                interval,
                alive,
                handle,
            },
        );
        // The immediate run may itself have registered this name.
        if let Some(raced) = replaced {
            raced.stop();
        }
    }

    /// Stop and forget the task registered under `name`. Unknown names are a no-op.
    pub fn remove_periodic_task(&self, name: &str) {
        if let Some(task) = self.lock().remove(name) {
            task.stop();
            debug!(event = "timer_task_removed", task = name, "Periodic task removed");
        }
    }

    /// Stop every registered task.
    pub fn stop_all_tasks(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, task) in drained {
            task.stop();
        }
        if count > 0 {
            debug!(event = "timer_tasks_stopped", count, "All periodic tasks stopped");
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lock().get(name).is_some_and(PeriodicTask::is_running)
    }

    /// Interval of the task registered under `name`.
    pub fn interval_of(&self, name: &str) -> Option<Duration> {
        self.lock().get(name).map(|t| t.interval)
    }

    pub fn task_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PeriodicTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn tick_loop(name: String, callback: TaskCallback, interval: Duration, alive: Arc<AtomicBool>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !alive.load(Ordering::Acquire) {
            break;
        }
        run_tick(&name, &callback);
    }
}

/// Run one tick, containing both `Err` returns and panics.
fn run_tick(name: &str, callback: &TaskCallback) {
    let outcome = catch_unwind(AssertUnwindSafe(|| callback()));
    let err = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(source)) => TimerTaskError::Failed {
            name: name.to_string(),
            source,
        },
        Err(payload) => TimerTaskError::Panicked {
            name: name.to_string(),
            message: panic_message(payload.as_ref()),
        },
    };
    warn!(event = "timer_task_error", task = name, error = %err, "Periodic task tick failed");
}
