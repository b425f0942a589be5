//! Session supervisor: owns every task of a recording session.
//!
//! Startup order matters. The controller device is opened and its trigger
//! watcher started before any stream worker exists, so the start barrier
//! always has a releaser. Each configured device then gets a stream worker
//! and a light controller, spawned as siblings on the blocking pool since
//! both spend their lives in blocking hardware calls.

use crate::config::SessionPlan;
use crate::device::Driver;
use crate::error::{ConfigError, DeviceOp, SessionError};
use crate::light::{LightController, LightSummary};
use crate::recorder::{StreamSummary, StreamWorker};
use crate::session::SessionState;
use crate::storage::ensure_output_dir;
use crate::trigger::{TriggerExit, TriggerOutcome, TriggerWatcher};
use crate::utils::local_time_of_day;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

/// Tick of the trigger watcher and light controllers.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct SessionSupervisor {
    plan: SessionPlan,
    driver: Arc<dyn Driver>,
    session: SessionState,
    poll_interval: Duration,
}

impl SessionSupervisor {
    pub fn new(plan: SessionPlan, driver: Arc<dyn Driver>) -> Self {
        SessionSupervisor {
            plan,
            driver,
            session: SessionState::new(),
            poll_interval: POLL_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[cfg(test)]
    pub fn session(&self) -> SessionState {
        self.session.clone()
    }

    /// Open the controller and spawn the task tree. Must be called inside a
    /// tokio runtime.
    pub fn start(self) -> Result<RunningSession, SessionError> {
        let plan = self.plan;
        let controller = plan
            .device(&plan.controller)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownController(plan.controller.clone()))?;

        ensure_output_dir(&plan.output_directory).map_err(|source| SessionError::OutputDir {
            path: plan.output_directory.display().to_string(),
            source,
        })?;

        let handle = self
            .driver
            .open(&controller.address.to_string())
            .map_err(|e| e.on(&controller.name, DeviceOp::Open))?;
        let info = handle.info();
        tracing::info!(
            device = %controller.name,
            class = %info.class,
            serial = %info.serial,
            "opened controller device"
        );

        let started_at = Utc::now();
        let watcher = TriggerWatcher::new(
            controller.name.clone(),
            handle,
            plan.lines.trigger.clone(),
            self.poll_interval,
            self.session.clone(),
        );
        let trigger = tokio::task::spawn_blocking(move || watcher.run());

        let mut streams = JoinSet::new();
        let mut lights = JoinSet::new();
        for device in &plan.devices {
            let (tx, rx) = oneshot::channel();

            let worker = StreamWorker::new(
                device.clone(),
                self.driver.clone(),
                plan.stream.clone(),
                plan.output_directory.clone(),
                self.session.clone(),
            )
            .with_light(tx);
            streams.spawn_blocking(move || worker.run());

            let light = LightController::new(
                device.name.clone(),
                plan.light,
                plan.lines.light_output.clone(),
                self.poll_interval,
                self.session.clone(),
                Box::new(local_time_of_day),
            );
            lights.spawn_blocking(move || light.run(rx));
        }
        tracing::info!(devices = plan.devices.len(), "session started, waiting for trigger");

        Ok(RunningSession {
            session: self.session,
            controller: controller.name,
            started_at,
            trigger,
            streams,
            lights,
        })
    }
}

pub struct RunningSession {
    session: SessionState,
    controller: String,
    started_at: DateTime<Utc>,
    trigger: JoinHandle<TriggerExit>,
    streams: JoinSet<StreamSummary>,
    lights: JoinSet<LightSummary>,
}

impl RunningSession {
    /// Run until `stop` resolves (or every stream worker has ended), then
    /// shut down and join every task. The controller handle is closed last,
    /// once no worker can be streaming from that device.
    pub async fn run_until<F>(mut self, stop: F) -> SessionReport
    where
        F: Future<Output = ()>,
    {
        let mut stop = std::pin::pin!(stop);
        let mut failed_tasks = 0;
        let mut streams = Vec::new();

        loop {
            tokio::select! {
                _ = &mut stop, if !self.session.is_shutting_down() => {
                    tracing::info!("interrupt received, stopping scans");
                    self.session.request_shutdown();
                }
                next = self.streams.join_next() => match next {
                    Some(Ok(summary)) => streams.push(summary),
                    Some(Err(e)) => {
                        tracing::error!("stream task failed: {}", e);
                        failed_tasks += 1;
                    }
                    // Every worker has ended, so there is nothing left to
                    // record; the session ends without waiting for `stop`.
                    None => break,
                },
            }
        }
        // Nothing left streaming; make sure the watcher and lights wind down.
        self.session.request_shutdown();

        let mut lights = Vec::new();
        while let Some(next) = self.lights.join_next().await {
            match next {
                Ok(summary) => lights.push(summary),
                Err(e) => {
                    tracing::error!("light task failed: {}", e);
                    failed_tasks += 1;
                }
            }
        }

        let trigger = match self.trigger.await {
            Ok(exit) => {
                match exit.handle.close() {
                    Ok(()) => tracing::info!(device = %self.controller, "closed controller device"),
                    Err(e) => tracing::warn!("{}", e.on(&self.controller, DeviceOp::Close)),
                }
                Some(exit.outcome)
            }
            Err(e) => {
                tracing::error!("trigger task failed: {}", e);
                failed_tasks += 1;
                None
            }
        };

        SessionReport::new(self.started_at, trigger, streams, lights, failed_tasks)
    }

}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub name: String,
    pub error: Option<String>,
    pub file: Option<PathBuf>,
    pub records_written: u64,
    pub total_scans: u64,
    pub skipped_samples: u64,
    pub skipped_scans: u64,
    pub elapsed_secs: f64,
    pub timed_scan_rate: f64,
    pub light_on: Option<bool>,
    pub light_switches: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerReport {
    Triggered,
    Shutdown,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub trigger: TriggerReport,
    pub devices: Vec<DeviceReport>,
    pub failed_tasks: usize,
}

impl SessionReport {
    fn new(
        started_at: DateTime<Utc>,
        trigger: Option<TriggerOutcome>,
        streams: Vec<StreamSummary>,
        lights: Vec<LightSummary>,
        failed_tasks: usize,
    ) -> Self {
        let mut devices: Vec<DeviceReport> = streams
            .into_iter()
            .map(|s| {
                let light = lights.iter().find(|l| l.device == s.device);
                DeviceReport {
                    error: s.error.clone(),
                    file: s.file.clone(),
                    records_written: s.records_written,
                    total_scans: s.total_scans,
                    skipped_samples: s.skipped_samples,
                    skipped_scans: s.skipped_scans(),
                    elapsed_secs: s.elapsed.as_secs_f64(),
                    timed_scan_rate: s.timed_scan_rate(),
                    light_on: light.and_then(|l| l.state),
                    light_switches: light.map(|l| l.switches).unwrap_or(0),
                    name: s.device,
                }
            })
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));

        SessionReport {
            started_at,
            finished_at: Utc::now(),
            trigger: match trigger {
                Some(TriggerOutcome::Triggered) => TriggerReport::Triggered,
                Some(TriggerOutcome::Shutdown) => TriggerReport::Shutdown,
                None => TriggerReport::Failed,
            },
            devices,
            failed_tasks,
        }
    }

    #[cfg(test)]
    pub fn device(&self, name: &str) -> Option<&DeviceReport> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Write `session_<YYYYMMDD_HHMMSS>.json` into `dir`.
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("session_{}.json", self.started_at.format("%Y%m%d_%H%M%S")));
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelMap;
    use crate::config::{default_channels, DeviceAddress, DeviceConfig, LightSchedule, LineConfig, StreamSession};
    use crate::simulator::{SimulatedDriver, SimulatorOptions};
    use crate::storage::replay_recording;
    use crate::utils::unix_micros;
    use chrono::NaiveTime;
    use tempfile::TempDir;

    const RATE: u32 = 200;
    const BLOCK: u32 = 20;

    fn plan(dir: &Path, controller: &str) -> SessionPlan {
        plan_with(dir, controller, &["box 1", "box 2"])
    }

    fn plan_with(dir: &Path, controller: &str, names: &[&str]) -> SessionPlan {
        SessionPlan {
            devices: names
                .iter()
                .enumerate()
                .map(|(i, name)| DeviceConfig {
                    name: name.to_string(),
                    address: DeviceAddress::Serial(i as u64 + 1),
                })
                .collect(),
            controller: controller.to_string(),
            stream: StreamSession {
                scan_rate: RATE,
                samples_per_block: BLOCK,
                channels: ChannelMap::new(&default_channels()).unwrap(),
            },
            light: Some(LightSchedule {
                on: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                off: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
            }),
            lines: LineConfig::default(),
            output_directory: dir.to_path_buf(),
        }
    }

    fn driver(trigger_after: Duration, fail_open: &[&str]) -> Arc<SimulatedDriver> {
        Arc::new(SimulatedDriver::new(SimulatorOptions {
            trigger_after,
            fail_open: fail_open.iter().map(|s| s.to_string()).collect(),
            ..SimulatorOptions::default()
        }))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_triggered_session_records_every_device() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let before = unix_micros(Utc::now());
        let sim = driver(Duration::from_millis(200), &[]);

        let running = SessionSupervisor::new(plan(tmpdir.path(), "box 1"), sim.clone())
            .with_poll_interval(Duration::from_millis(10))
            .start()?;
        let report = running
            .run_until(tokio::time::sleep(Duration::from_millis(900)))
            .await;

        assert!(matches!(report.trigger, TriggerReport::Triggered));
        assert_eq!(report.failed_tasks, 0);
        assert_eq!(report.devices.len(), 2);

        for dev in &report.devices {
            assert!(dev.error.is_none(), "{:?}", dev.error);
            assert!(dev.records_written >= u64::from(BLOCK));
            assert_eq!(dev.records_written % u64::from(BLOCK), 0);
            assert_eq!(dev.light_on, Some(true));

            let file = dev.file.as_ref().unwrap();
            assert_eq!(std::fs::metadata(file)?.len(), dev.records_written * 14);

            let records = replay_recording(file)?;
            // Seeded at this worker's own stream start, after the trigger.
            assert!(records[0].timestamp_micros >= before + 150_000);
            for pair in records.windows(2) {
                assert_eq!(pair[1].timestamp_micros - pair[0].timestamp_micros, 1_000_000 / u64::from(RATE));
            }
            assert!(records.last().unwrap().light);
        }

        let light_writes = sim.writes();
        let writes = light_writes.lock().unwrap();
        assert!(writes.iter().any(|(addr, line, v)| addr == "1" && line == "DIO17" && *v == 1.0));
        assert!(writes.iter().any(|(addr, line, v)| addr == "2" && line == "DIO17" && *v == 1.0));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_device_does_not_stop_others() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let sim = driver(Duration::ZERO, &["2"]);

        let running = SessionSupervisor::new(plan(tmpdir.path(), "box 1"), sim)
            .with_poll_interval(Duration::from_millis(10))
            .start()?;
        let report = running
            .run_until(tokio::time::sleep(Duration::from_millis(400)))
            .await;

        let failed = report.device("box 2").unwrap();
        assert!(failed.error.as_ref().unwrap().contains("box 2"));
        assert!(failed.file.is_none());
        assert_eq!(failed.light_on, None);

        let ok = report.device("box 1").unwrap();
        assert!(ok.error.is_none());
        assert!(ok.records_written > 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_before_trigger_releases_parked_workers() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let sim = driver(Duration::from_secs(3600), &[]);

        let running = SessionSupervisor::new(plan(tmpdir.path(), "box 2"), sim.clone())
            .with_poll_interval(Duration::from_millis(10))
            .start()?;
        let report = running
            .run_until(tokio::time::sleep(Duration::from_millis(100)))
            .await;

        assert!(matches!(report.trigger, TriggerReport::Shutdown));
        for dev in &report.devices {
            assert!(dev.error.is_none());
            assert!(dev.file.is_none());
            assert_eq!(dev.records_written, 0);
        }
        assert!(sim.writes().lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_through_session_state_ends_join() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let sup = SessionSupervisor::new(plan(tmpdir.path(), "box 1"), driver(Duration::from_secs(3600), &[]))
            .with_poll_interval(Duration::from_millis(10));
        let session = sup.session();
        let running = sup.start()?;

        session.request_shutdown();
        session.request_shutdown();
        let report = running.run_until(std::future::pending()).await;
        assert!(matches!(report.trigger, TriggerReport::Shutdown));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_controller_device_streams_while_watcher_holds_its_handle() -> Result<()> {
        let tmpdir = TempDir::new()?;
        // The watcher and box 1's worker open the same simulated device.
        let running = SessionSupervisor::new(plan(tmpdir.path(), "box 1"), driver(Duration::ZERO, &[]))
            .with_poll_interval(Duration::from_millis(10))
            .start()?;
        let report = running
            .run_until(tokio::time::sleep(Duration::from_millis(500)))
            .await;

        assert!(matches!(report.trigger, TriggerReport::Triggered));
        let controller = report.device("box 1").unwrap();
        assert!(controller.error.is_none(), "{:?}", controller.error);
        assert!(controller.records_written >= u64::from(BLOCK) * 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_clashing_file_names_never_share_a_file() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let running = SessionSupervisor::new(
            plan_with(tmpdir.path(), "box 1", &["box 1", "box_1"]),
            driver(Duration::ZERO, &[]),
        )
        .with_poll_interval(Duration::from_millis(10))
        .start()?;
        let report = running
            .run_until(tokio::time::sleep(Duration::from_millis(400)))
            .await;

        let written: Vec<&DeviceReport> = report.devices.iter().filter(|d| d.error.is_none()).collect();
        let failed: Vec<&DeviceReport> = report.devices.iter().filter(|d| d.error.is_some()).collect();
        // Both start in the same second unless the run straddles a second boundary.
        if failed.len() == 1 {
            assert!(failed[0].error.as_ref().unwrap().contains("output file"));
            assert_eq!(written.len(), 1);
        } else {
            assert_eq!(written.len(), 2);
            assert_ne!(written[0].file, written[1].file);
        }
        for dev in written {
            let file = dev.file.as_ref().unwrap();
            let records = replay_recording(file)?;
            assert_eq!(records.len() as u64, dev.records_written);
            for pair in records.windows(2) {
                assert_eq!(pair[1].timestamp_micros - pair[0].timestamp_micros, 1_000_000 / u64::from(RATE));
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_controller_is_fatal() {
        let tmpdir = TempDir::new().unwrap();
        let result = SessionSupervisor::new(plan(tmpdir.path(), "ghost"), driver(Duration::ZERO, &[])).start();
        assert!(matches!(result, Err(SessionError::Config(ConfigError::UnknownController(_)))));
    }

    #[tokio::test]
    async fn test_controller_open_failure_is_fatal() {
        let tmpdir = TempDir::new().unwrap();
        let result = SessionSupervisor::new(plan(tmpdir.path(), "box 1"), driver(Duration::ZERO, &["1"])).start();
        assert!(matches!(result, Err(SessionError::Controller(_))));
    }

    #[test]
    fn test_report_json_written() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let report = SessionReport::new(Utc::now(), Some(TriggerOutcome::Triggered), vec![], vec![], 0);
        let path = report.write_json(tmpdir.path())?;
        let text = std::fs::read_to_string(&path)?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        assert_eq!(value["trigger"], "triggered");
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("session_"));
        Ok(())
    }
}
