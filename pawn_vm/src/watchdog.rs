//! Cooperative timeout enforcement.
//!
//! A watchdog thread samples an [`ExecutionMonitor`] every half interval.
//! When it sees the same execution frame on two consecutive samples it
//! declares a timeout: every loop edge of every compiled function is
//! redirected into its timeout stub and the interpreter's poll starts
//! reporting. The thread then sleeps until the script side acknowledges,
//! which restores the loop edges before any further script code runs.
//!
//! ```text
//!  Idle ──enter──▶ Running ──same frame──▶ SuspectedTimeout ──same frame──▶ TimedOut
//!   ▲                 ▲                                                         │
//!   └──── depth 0 ────┴─────────────────────── acknowledge ─────────────────────┘
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::environment::CodeRegistry;

// =============================================================================
// Execution Monitor
// =============================================================================

/// Shared view of whether script code is running.
///
/// The depth counts nested invocations across every thread using the
/// environment, so the watchdog sees one frame while any script runs.
#[derive(Debug, Default)]
pub struct ExecutionMonitor {
    depth: AtomicUsize,
    frame_id: AtomicU64,
    timeout_pending: AtomicBool,
}

impl ExecutionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that an invocation started. A new frame begins when nothing
    /// else was running.
    pub fn enter(&self) {
        if self.depth.fetch_add(1, Ordering::SeqCst) == 0 {
            self.frame_id.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Note that an invocation finished; returns the remaining depth.
    pub fn leave(&self) -> usize {
        self.depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.depth() > 0
    }

    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id.load(Ordering::SeqCst)
    }

    /// Whether a timeout was declared and not yet acknowledged.
    #[inline]
    pub fn timeout_pending(&self) -> bool {
        self.timeout_pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_timeout_pending(&self, pending: bool) {
        self.timeout_pending.store(pending, Ordering::Release);
    }
}

// =============================================================================
// Watchdog Timer
// =============================================================================

/// Where the watchdog is in its detection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogPhase {
    /// No script is running.
    Idle,
    /// A script is running and made progress since the last sample.
    Running,
    /// One sample saw no progress.
    SuspectedTimeout,
    /// Loop edges are patched; waiting for the script side.
    TimedOut,
}

#[derive(Debug)]
struct WatchState {
    phase: WatchdogPhase,
    terminate: bool,
    timed_out: bool,
}

#[derive(Debug)]
struct WatchdogShared {
    timeout: Duration,
    state: Mutex<WatchState>,
    cv: Condvar,
    registry: Arc<CodeRegistry>,
    monitor: Arc<ExecutionMonitor>,
}

/// The background thread and its handshake state.
///
/// Dropping the timer stops the thread and restores any patched code.
#[derive(Debug)]
pub struct WatchdogTimer {
    shared: Arc<WatchdogShared>,
    thread: Option<JoinHandle<()>>,
}

impl WatchdogTimer {
    /// Spawn the watchdog thread.
    pub(crate) fn start(
        timeout: Duration,
        registry: Arc<CodeRegistry>,
        monitor: Arc<ExecutionMonitor>,
    ) -> io::Result<Self> {
        let shared = Arc::new(WatchdogShared {
            timeout,
            state: Mutex::new(WatchState {
                phase: WatchdogPhase::Idle,
                terminate: false,
                timed_out: false,
            }),
            cv: Condvar::new(),
            registry,
            monitor,
        });
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("pawn-watchdog".to_string())
                .spawn(move || watch(&shared))?
        };
        info!(timeout_ms = timeout.as_millis() as u64, "watchdog started");
        Ok(WatchdogTimer {
            shared,
            thread: Some(thread),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    pub fn phase(&self) -> WatchdogPhase {
        self.shared.state.lock().phase
    }

    /// Restore loop edges after a timeout and let the thread resume.
    ///
    /// Returns `false` when no timeout was outstanding. The caller must not
    /// run script code again until this returns.
    pub(crate) fn acknowledge(&self) -> bool {
        let mut state = self.shared.state.lock();
        if !state.timed_out {
            return false;
        }
        let edges = self.shared.registry.unpatch_all();
        state.timed_out = false;
        state.phase = WatchdogPhase::Running;
        self.shared.monitor.set_timeout_pending(false);
        self.shared.cv.notify_all();
        debug!(edges, "timeout acknowledged");
        true
    }
}

impl Drop for WatchdogTimer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.terminate = true;
            self.shared.cv.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("watchdog thread panicked");
            }
        }
        info!("watchdog stopped");
    }
}

/// Body of the watchdog thread.
fn watch(shared: &WatchdogShared) {
    let interval = (shared.timeout / 2).max(Duration::from_millis(1));
    let mut last_frame = None;
    let mut state = shared.state.lock();

    while !state.terminate {
        shared.cv.wait_for(&mut state, interval);
        if state.terminate {
            break;
        }

        if !shared.monitor.is_running() {
            state.phase = WatchdogPhase::Idle;
            last_frame = None;
            continue;
        }
        let frame = shared.monitor.frame_id();
        if last_frame != Some(frame) {
            state.phase = WatchdogPhase::Running;
            last_frame = Some(frame);
            continue;
        }

        match state.phase {
            WatchdogPhase::Idle | WatchdogPhase::Running => {
                state.phase = WatchdogPhase::SuspectedTimeout;
            }
            WatchdogPhase::SuspectedTimeout => {
                state.phase = WatchdogPhase::TimedOut;
                state.timed_out = true;
                shared.monitor.set_timeout_pending(true);
                let edges = shared.registry.patch_all();
                warn!(frame, edges, "script timed out");

                while state.timed_out && !state.terminate {
                    shared.cv.wait(&mut state);
                }
                state.phase = WatchdogPhase::Running;
                last_frame = None;
            }
            WatchdogPhase::TimedOut => {}
        }
    }

    if state.timed_out {
        shared.registry.unpatch_all();
        shared.monitor.set_timeout_pending(false);
        state.timed_out = false;
    }
    state.phase = WatchdogPhase::Idle;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_monitor_frames() {
        let monitor = ExecutionMonitor::new();
        assert!(!monitor.is_running());
        monitor.enter();
        let frame = monitor.frame_id();
        monitor.enter();
        assert_eq!(monitor.frame_id(), frame);
        assert_eq!(monitor.leave(), 1);
        assert_eq!(monitor.leave(), 0);
        monitor.enter();
        assert_eq!(monitor.frame_id(), frame + 1);
        monitor.leave();
    }

    #[test]
    fn test_idle_watchdog_never_fires() {
        let monitor = Arc::new(ExecutionMonitor::new());
        let timer = WatchdogTimer::start(
            Duration::from_millis(4),
            Arc::new(CodeRegistry::default()),
            Arc::clone(&monitor),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(timer.phase(), WatchdogPhase::Idle);
        assert!(!monitor.timeout_pending());
        assert!(!timer.acknowledge());
    }

    #[test]
    fn test_stuck_frame_times_out_and_acknowledges() {
        let monitor = Arc::new(ExecutionMonitor::new());
        let registry = Arc::new(CodeRegistry::default());
        let timer = WatchdogTimer::start(
            Duration::from_millis(10),
            Arc::clone(&registry),
            Arc::clone(&monitor),
        )
        .unwrap();

        monitor.enter();
        assert!(wait_until(Duration::from_secs(5), || monitor.timeout_pending()));
        assert_eq!(timer.phase(), WatchdogPhase::TimedOut);
        assert_eq!(registry.patch_sweeps(), 1);

        assert!(timer.acknowledge());
        assert!(!monitor.timeout_pending());
        assert!(!timer.acknowledge());
        monitor.leave();
        assert!(wait_until(Duration::from_secs(5), || {
            timer.phase() == WatchdogPhase::Idle
        }));
    }

    #[test]
    fn test_drop_clears_outstanding_timeout() {
        let monitor = Arc::new(ExecutionMonitor::new());
        let timer = WatchdogTimer::start(
            Duration::from_millis(4),
            Arc::new(CodeRegistry::default()),
            Arc::clone(&monitor),
        )
        .unwrap();
        monitor.enter();
        assert!(wait_until(Duration::from_secs(5), || monitor.timeout_pending()));
        drop(timer);
        assert!(!monitor.timeout_pending());
        monitor.leave();
    }
}
