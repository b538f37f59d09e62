//! Shared timeout watchdog
//!
//! One long-lived thread checks every running timed task. Each watch is
//! polled at its own interval, and the wait between polls is a condvar
//! timeout until the earliest pending check, so an idle watchdog sleeps.

use crate::task::TaskId;
use crate::timed::Stopwatch;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Name of the watchdog thread
pub(crate) const THREAD_NAME: &str = "raya-watchdog";

pub(crate) type TimeoutCallback = Box<dyn FnOnce() + Send>;

static WATCHDOG: OnceCell<Arc<Watchdog>> = OnceCell::new();

/// A timed task under observation
struct Watch {
    id: u64,
    task: TaskId,
    timeout: Duration,
    interval: Duration,

    /// Next time the stopwatch is read
    check_at: Instant,

    stopwatch: Arc<Mutex<Stopwatch>>,

    /// Taken when the timeout fires
    on_timeout: Arc<Mutex<Option<TimeoutCallback>>>,
}

/// A timeout ready to be reported
struct Expired {
    task: TaskId,
    elapsed: Duration,
    timeout: Duration,
    callback: TimeoutCallback,
}

impl Watch {
    /// Returns false once the watch is finished
    fn check(&mut self, now: Instant, expired: &mut Vec<Expired>) -> bool {
        if now < self.check_at {
            return true;
        }
        self.check_at = now + self.interval;

        let elapsed = {
            let mut stopwatch = self.stopwatch.lock();
            let elapsed = stopwatch.elapsed();
            if elapsed <= self.timeout {
                return true;
            }
            stopwatch.stop();
            elapsed
        };

        if let Some(callback) = self.on_timeout.lock().take() {
            expired.push(Expired {
                task: self.task,
                elapsed,
                timeout: self.timeout,
                callback,
            });
        }
        false
    }
}

struct WatchState {
    watches: Vec<Watch>,
    next_id: u64,
}

/// Timeout watchdog shared by every timed task in the process
pub(crate) struct Watchdog {
    state: Mutex<WatchState>,

    /// Signalled when a watch is added
    notify: Condvar,
}

impl Watchdog {
    /// The process-wide watchdog, started on first use
    pub(crate) fn global() -> io::Result<&'static Arc<Watchdog>> {
        WATCHDOG.get_or_try_init(Self::start)
    }

    fn start() -> io::Result<Arc<Self>> {
        let watchdog = Arc::new(Self {
            state: Mutex::new(WatchState {
                watches: Vec::new(),
                next_id: 0,
            }),
            notify: Condvar::new(),
        });

        let worker = watchdog.clone();
        thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || worker.run_loop())?;

        Ok(watchdog)
    }

    /// Watch a stopwatch until the returned handle is dropped
    pub(crate) fn watch(
        self: &Arc<Self>,
        task: TaskId,
        timeout: Duration,
        interval: Duration,
        stopwatch: Arc<Mutex<Stopwatch>>,
        on_timeout: Arc<Mutex<Option<TimeoutCallback>>>,
    ) -> WatchHandle {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.watches.push(Watch {
            id,
            task,
            timeout,
            interval,
            check_at: Instant::now() + interval,
            stopwatch,
            on_timeout,
        });
        self.notify.notify_one();

        WatchHandle {
            watchdog: self.clone(),
            id,
        }
    }

    fn unwatch(&self, id: u64) {
        self.state.lock().watches.retain(|watch| watch.id != id);
    }

    /// Number of active watches
    #[cfg(test)]
    fn watch_count(&self) -> usize {
        self.state.lock().watches.len()
    }

    /// Watchdog thread main loop
    fn run_loop(&self) {
        debug!("timeout watchdog started");

        let mut state = self.state.lock();
        loop {
            let now = Instant::now();
            let mut expired = Vec::new();
            state.watches.retain_mut(|watch| watch.check(now, &mut expired));

            if !expired.is_empty() {
                // Callbacks run unlocked so they may start other timed tasks
                MutexGuard::unlocked(&mut state, || {
                    for timeout in expired {
                        fire(timeout);
                    }
                });
                continue;
            }

            match state.watches.iter().map(|watch| watch.check_at).min() {
                Some(next) => {
                    self.notify.wait_until(&mut state, next);
                }
                None => self.notify.wait(&mut state),
            }
        }
    }
}

fn fire(expired: Expired) {
    debug!(
        task = %expired.task,
        elapsed = ?expired.elapsed,
        timeout = ?expired.timeout,
        "task timed out"
    );
    if panic::catch_unwind(AssertUnwindSafe(expired.callback)).is_err() {
        warn!(task = %expired.task, "timeout callback panicked");
    }
}

/// Removes its watch when dropped
pub(crate) struct WatchHandle {
    watchdog: Arc<Watchdog>,
    id: u64,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.watchdog.unwatch(self.id);
    }
}
