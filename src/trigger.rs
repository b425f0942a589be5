use crate::channels::HIGH_THRESHOLD;
use crate::device::DeviceHandle;
use crate::error::DeviceOp;
use crate::session::SessionState;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Triggered,
    Shutdown,
}

/// The watcher's result, with the controller handle it owned. The handle is
/// left open: the controller device may be streaming through another handle.
pub struct TriggerExit {
    pub outcome: TriggerOutcome,
    pub handle: Box<dyn DeviceHandle>,
}

/// Polls the controller device's trigger line and opens the start barrier.
///
/// Owns the controller handle exclusively while it runs. Whatever the exit
/// path, the barrier is released so no stream worker stays parked.
pub struct TriggerWatcher {
    device: String,
    handle: Box<dyn DeviceHandle>,
    line: String,
    tick: Duration,
    session: SessionState,
}

impl TriggerWatcher {
    pub fn new(
        device: impl Into<String>,
        handle: Box<dyn DeviceHandle>,
        line: impl Into<String>,
        tick: Duration,
        session: SessionState,
    ) -> Self {
        TriggerWatcher {
            device: device.into(),
            handle,
            line: line.into(),
            tick,
            session,
        }
    }

    pub fn run(self) -> TriggerExit {
        tracing::info!(device = %self.device, line = %self.line, "waiting for high input");
        let outcome = self.watch();
        self.session.start_barrier().release();
        TriggerExit {
            outcome,
            handle: self.handle,
        }
    }

    fn watch(&self) -> TriggerOutcome {
        loop {
            if self.session.is_shutting_down() {
                return TriggerOutcome::Shutdown;
            }
            match self.handle.read_line(&self.line) {
                Ok(level) if level > HIGH_THRESHOLD => {
                    tracing::info!(device = %self.device, line = %self.line, "high input detected, starting streams");
                    return TriggerOutcome::Triggered;
                }
                Ok(_) => {}
                // Transient; retried next tick.
                Err(e) => tracing::warn!("{}", e.on(&self.device, DeviceOp::Read)),
            }
            if self.session.shutdown().sleep(self.tick) {
                return TriggerOutcome::Shutdown;
            }
        }
    }
}
