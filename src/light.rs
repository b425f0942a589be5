//! Daily light schedule, driven per device while it streams.

use crate::config::LightSchedule;
use crate::device::DeviceHandle;
use crate::error::DeviceOp;
use crate::recorder::StreamLink;
use crate::session::SessionState;
use chrono::NaiveTime;
use std::time::Duration;
use tokio::sync::oneshot;

/// Whether the light should be on at `now`. Half-open `[on, off)`, no wrap
/// past midnight: with `on >= off` the window is empty.
pub fn should_be_on(schedule: &LightSchedule, now: NaiveTime) -> bool {
    schedule.on <= now && now < schedule.off
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightSummary {
    pub device: String,
    /// Last state successfully written. `None` if never driven.
    pub state: Option<bool>,
    pub switches: u32,
}

pub type Clock = Box<dyn Fn() -> NaiveTime + Send>;

pub struct LightController {
    device: String,
    schedule: Option<LightSchedule>,
    line: String,
    tick: Duration,
    session: SessionState,
    clock: Clock,
    light_state: Option<bool>,
    switches: u32,
}

impl LightController {
    pub fn new(
        device: impl Into<String>,
        schedule: Option<LightSchedule>,
        line: impl Into<String>,
        tick: Duration,
        session: SessionState,
        clock: Clock,
    ) -> Self {
        LightController {
            device: device.into(),
            schedule,
            line: line.into(),
            tick,
            session,
            clock,
            light_state: None,
            switches: 0,
        }
    }

    /// Evaluate the schedule once and write the output if the state changes.
    pub fn evaluate(&mut self, handle: &dyn DeviceHandle, now: NaiveTime) {
        let Some(schedule) = self.schedule else {
            return;
        };
        let want = should_be_on(&schedule, now);
        if self.light_state == Some(want) {
            return;
        }
        let value = if want { 1.0 } else { 0.0 };
        match handle.write_line(&self.line, value) {
            Ok(()) => {
                tracing::info!(device = %self.device, "light turned {}", if want { "on" } else { "off" });
                self.light_state = Some(want);
                self.switches += 1;
            }
            // Left unchanged so the next tick retries.
            Err(e) => tracing::warn!("{}", e.on(&self.device, DeviceOp::Write)),
        }
    }

    fn summary(&self) -> LightSummary {
        LightSummary {
            device: self.device.clone(),
            state: self.light_state,
            switches: self.switches,
        }
    }

    /// Wait for the paired stream worker to start streaming, then drive the
    /// output every tick until shutdown or the worker stops.
    pub fn run(mut self, link: oneshot::Receiver<StreamLink>) -> LightSummary {
        let link = match link.blocking_recv() {
            Ok(link) => link,
            Err(_) => {
                tracing::debug!(device = %self.device, "stream never started, light control idle");
                return self.summary();
            }
        };
        if self.schedule.is_none() {
            tracing::debug!(device = %self.device, "light control disabled");
            return self.summary();
        }

        while !self.session.is_shutting_down() && link.is_active() {
            let now = (self.clock)();
            self.evaluate(link.handle.as_ref(), now);
            if self.session.shutdown().sleep(self.tick) {
                break;
            }
        }
        self.summary()
    }
}
