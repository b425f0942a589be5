use std::sync::{Condvar, Mutex, MutexGuard};

/// One-shot gate. Opens once, by any caller, and never closes again.
#[derive(Debug, Default)]
pub struct StartBarrier {
    released: Mutex<bool>,
    cond: Condvar,
}

impl StartBarrier {
    fn lock(&self) -> MutexGuard<'_, bool> {
        // A panicking waiter cannot leave the flag half-written.
        self.released.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the gate and wake every waiter. Idempotent.
    pub fn release(&self) {
        let mut released = self.lock();
        if !*released {
            *released = true;
            tracing::debug!("start barrier released");
        }
        self.cond.notify_all();
    }

    #[cfg(test)]
    pub fn is_released(&self) -> bool {
        *self.lock()
    }

    /// Block until [`release`](Self::release) has been called.
    pub fn wait(&self) {
        let mut released = self.lock();
        while !*released {
            released = self.cond.wait(released).unwrap_or_else(|e| e.into_inner());
        }
    }
}
