use crate::barrier::StartBarrier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Process-wide stop request. One-way: once set it stays set.
#[derive(Debug, Default)]
pub struct ShutdownFlag {
    set: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl ShutdownFlag {
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Returns true only for the call that performed the transition.
    pub fn set(&self) -> bool {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let first = !self.set.swap(true, Ordering::AcqRel);
        self.cond.notify_all();
        first
    }

    /// Sleep for `period` or until the flag is set. Returns whether it is set.
    pub fn sleep(&self, period: Duration) -> bool {
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let _ = self
            .cond
            .wait_timeout_while(guard, period, |_| !self.is_set())
            .unwrap_or_else(|e| e.into_inner());
        self.is_set()
    }
}

/// The only state shared across tasks of a session. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    inner: Arc<SessionInner>,
}

#[derive(Debug, Default)]
struct SessionInner {
    shutdown: ShutdownFlag,
    start: StartBarrier,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) -> &ShutdownFlag {
        &self.inner.shutdown
    }

    pub fn start_barrier(&self) -> &StartBarrier {
        &self.inner.start
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_set()
    }

    /// Set the shutdown flag and open the start barrier so no task stays parked.
    pub fn request_shutdown(&self) {
        if self.inner.shutdown.set() {
            tracing::info!("shutdown requested, stopping all tasks");
        }
        self.inner.start.release();
    }
}
