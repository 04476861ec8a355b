//! Background refresh loop
//!
//! Phases: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//!
//! The loop waits on a condition variable until the period elapses or a
//! stop or forced update is requested. Both flags are checked before every
//! wait and again after every wakeup, so a request made while a cycle is
//! running is seen as soon as the cycle ends. Forced updates set a flag
//! rather than count, so any number of requests before the next wakeup
//! produce one cycle.

use derive_more::Display;
use mastermind_common::Result;
use parking_lot::{Condvar, Mutex};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Name of the background thread
pub const REFRESH_THREAD_NAME: &str = "mastermind-refresh";

/// One refresh cycle, run by the scheduler
pub trait RefreshCycle: Send + Sync + 'static {
    fn run_cycle(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum SchedulerPhase {
    #[display("stopped")]
    Stopped,
    #[display("starting")]
    Starting,
    #[display("running")]
    Running,
    #[display("stopping")]
    Stopping,
}

struct Control {
    phase: SchedulerPhase,
    stop_requested: bool,
    force_pending: bool,
}

struct Shared {
    control: Mutex<Control>,
    wake: Condvar,
}

pub struct RefreshScheduler {
    period: Duration,
    shared: Arc<Shared>,
    /// Serializes start and stop; holds the loop thread while running
    lifecycle: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshScheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    phase: SchedulerPhase::Stopped,
                    stop_requested: false,
                    force_pending: false,
                }),
                wake: Condvar::new(),
            }),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.shared.control.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() == SchedulerPhase::Running
    }

    /// Run one cycle on the calling thread, then start the loop
    ///
    /// Returns `Ok(false)` if the scheduler was not stopped. The initial
    /// cycle must not call back into `start` or `stop`.
    pub fn start(&self, cycle: Arc<dyn RefreshCycle>) -> Result<bool> {
        let mut lifecycle = self.lifecycle.lock();
        {
            let mut control = self.shared.control.lock();
            if control.phase != SchedulerPhase::Stopped {
                debug!("Refresh scheduler already {}, start ignored", control.phase);
                return Ok(false);
            }
            control.phase = SchedulerPhase::Starting;
            control.stop_requested = false;
            // The initial cycle below serves any earlier force request
            control.force_pending = false;
        }
        info!("Starting refresh scheduler (period {:?})", self.period);

        // Best effort; failures are recorded per dataset
        run_guarded(cycle.as_ref());

        let shared = Arc::clone(&self.shared);
        let period = self.period;
        let spawned = thread::Builder::new()
            .name(REFRESH_THREAD_NAME.to_string())
            .spawn(move || refresh_loop(&shared, period, cycle.as_ref()));

        let mut control = self.shared.control.lock();
        match spawned {
            Ok(handle) => {
                *lifecycle = Some(handle);
                control.phase = SchedulerPhase::Running;
                info!("Refresh scheduler running");
                Ok(true)
            }
            Err(e) => {
                control.phase = SchedulerPhase::Stopped;
                error!("Failed to spawn refresh thread: {}", e);
                Err(e.into())
            }
        }
    }

    /// Stop the loop and wait for it to exit
    ///
    /// Called from the loop thread itself (for instance by a callback) the
    /// loop exits after the current cycle and is not joined.
    pub fn stop(&self) {
        let handle = {
            let mut lifecycle = self.lifecycle.lock();
            let mut control = self.shared.control.lock();
            if control.phase == SchedulerPhase::Stopped {
                debug!("Refresh scheduler already stopped");
                return;
            }
            control.phase = SchedulerPhase::Stopping;
            control.stop_requested = true;
            lifecycle.take()
        };
        self.shared.wake.notify_all();
        info!("Stopping refresh scheduler");

        // Joined without the lifecycle lock so a cycle may still call start
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            warn!("Refresh scheduler stopped from its own thread, not joining");
            return;
        }
        if handle.join().is_err() {
            error!("Refresh thread panicked");
            mark_stopped(&self.shared);
        }
        info!("Refresh scheduler stopped");
    }

    /// Request a cycle ahead of schedule; never blocks on the cycle
    pub fn force_update(&self) {
        self.shared.control.lock().force_pending = true;
        self.shared.wake.notify_all();
        debug!("Forced refresh requested");
    }
}

fn run_guarded(cycle: &dyn RefreshCycle) {
    if catch_unwind(AssertUnwindSafe(|| cycle.run_cycle())).is_err() {
        error!("Refresh cycle panicked");
    }
}

fn mark_stopped(shared: &Shared) {
    let mut control = shared.control.lock();
    control.phase = SchedulerPhase::Stopped;
    control.stop_requested = false;
}

fn refresh_loop(shared: &Shared, period: Duration, cycle: &dyn RefreshCycle) {
    debug!("Refresh loop started");
    loop {
        {
            let mut control = shared.control.lock();
            let deadline = Instant::now() + period;
            while !control.stop_requested && !control.force_pending {
                if shared.wake.wait_until(&mut control, deadline).timed_out() {
                    break;
                }
            }
            if control.stop_requested {
                break;
            }
            if control.force_pending {
                debug!("Running forced refresh");
            }
            control.force_pending = false;
        }
        run_guarded(cycle);
    }
    mark_stopped(shared);
    debug!("Refresh loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        cycles: AtomicUsize,
        /// While true, cycles past the first block until it is cleared
        hold: Mutex<bool>,
        released: Condvar,
    }

    impl RefreshCycle for Counting {
        fn run_cycle(&self) {
            let n = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
            if n > 1 {
                let mut hold = self.hold.lock();
                while *hold {
                    self.released.wait(&mut hold);
                }
            }
        }
    }

    impl Counting {
        fn count(&self) -> usize {
            self.cycles.load(Ordering::SeqCst)
        }

        fn release(&self) {
            *self.hold.lock() = false;
            self.released.notify_all();
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_start_runs_initial_cycle() {
        let scheduler = RefreshScheduler::new(Duration::from_secs(60));
        let cycle = Arc::new(Counting::default());

        assert!(scheduler.start(cycle.clone()).unwrap());
        assert_eq!(cycle.count(), 1);
        assert!(scheduler.is_running());

        // Second start is a no-op
        assert!(!scheduler.start(cycle.clone()).unwrap());
        assert_eq!(cycle.count(), 1);

        scheduler.stop();
        assert_eq!(scheduler.phase(), SchedulerPhase::Stopped);
        scheduler.stop();
    }

    #[test]
    fn test_forces_before_start_served_by_initial_cycle() {
        let scheduler = RefreshScheduler::new(Duration::from_secs(60));
        let cycle = Arc::new(Counting::default());

        scheduler.force_update();
        scheduler.force_update();
        scheduler.start(cycle.clone()).unwrap();
        assert_eq!(cycle.count(), 1);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(cycle.count(), 1);

        scheduler.force_update();
        assert!(wait_for(|| cycle.count() == 2));
        scheduler.stop();
    }

    #[test]
    fn test_forces_during_cycle_coalesce() {
        let scheduler = RefreshScheduler::new(Duration::from_secs(60));
        let cycle = Arc::new(Counting::default());
        *cycle.hold.lock() = true;
        scheduler.start(cycle.clone()).unwrap();

        // Second cycle starts and blocks inside run_cycle
        scheduler.force_update();
        assert!(wait_for(|| cycle.count() == 2));

        scheduler.force_update();
        scheduler.force_update();
        scheduler.force_update();
        cycle.release();

        assert!(wait_for(|| cycle.count() == 3));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(cycle.count(), 3);
        scheduler.stop();
    }

    #[test]
    fn test_period_drives_cycles() {
        let scheduler = RefreshScheduler::new(Duration::from_millis(10));
        let cycle = Arc::new(Counting::default());
        scheduler.start(cycle.clone()).unwrap();

        assert!(wait_for(|| cycle.count() >= 4));
        scheduler.stop();

        let stopped_at = cycle.count();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(cycle.count(), stopped_at);
    }

    #[test]
    fn test_stop_wakes_long_wait() {
        let scheduler = RefreshScheduler::new(Duration::from_secs(3600));
        scheduler.start(Arc::new(Counting::default())).unwrap();

        let started = Instant::now();
        scheduler.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_restart_after_stop() {
        let scheduler = RefreshScheduler::new(Duration::from_secs(60));
        let cycle = Arc::new(Counting::default());

        scheduler.start(cycle.clone()).unwrap();
        scheduler.stop();
        scheduler.start(cycle.clone()).unwrap();
        assert_eq!(cycle.count(), 2);
        assert!(scheduler.is_running());
        scheduler.stop();
    }

    struct StopsItself {
        scheduler: Mutex<Option<Arc<RefreshScheduler>>>,
        cycles: AtomicUsize,
    }

    impl RefreshCycle for StopsItself {
        fn run_cycle(&self) {
            if self.cycles.fetch_add(1, Ordering::SeqCst) == 1
                && let Some(scheduler) = self.scheduler.lock().take()
            {
                scheduler.stop();
            }
        }
    }

    #[test]
    fn test_stop_from_loop_thread() {
        let scheduler = Arc::new(RefreshScheduler::new(Duration::from_millis(10)));
        let cycle = Arc::new(StopsItself {
            scheduler: Mutex::new(Some(Arc::clone(&scheduler))),
            cycles: AtomicUsize::new(0),
        });

        scheduler.start(cycle.clone()).unwrap();
        assert!(wait_for(|| scheduler.phase() == SchedulerPhase::Stopped));
        assert_eq!(cycle.cycles.load(Ordering::SeqCst), 2);
    }

    struct Panics;

    impl RefreshCycle for Panics {
        fn run_cycle(&self) {
            panic!("cycle failed");
        }
    }

    #[test]
    fn test_panicking_cycle_keeps_loop_alive() {
        let scheduler = RefreshScheduler::new(Duration::from_millis(10));
        scheduler.start(Arc::new(Panics)).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(scheduler.is_running());
        scheduler.stop();
    }
}
