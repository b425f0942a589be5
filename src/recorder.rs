use crate::channels::count_skipped;
use crate::config::{DeviceConfig, StreamSession};
use crate::device::{DeviceHandle, Driver};
use crate::error::{DeviceError, DeviceOp};
use crate::session::SessionState;
use crate::storage::RecordWriter;
use crate::utils::unix_micros;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerPhase {
    Idle,
    Configuring,
    AwaitingStart,
    Streaming,
    Stopping,
    Closed,
}

/// Handed from a stream worker to its light controller once streaming begins.
#[derive(Clone)]
pub struct StreamLink {
    pub handle: Arc<dyn DeviceHandle>,
    active: Arc<AtomicBool>,
}

impl StreamLink {
    pub fn new(handle: Arc<dyn DeviceHandle>) -> Self {
        StreamLink {
            handle,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// False once the owning worker has left the streaming phase.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Outcome of one device's stream worker.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub device: String,
    pub phase: WorkerPhase,
    pub file: Option<PathBuf>,
    pub total_scans: u64,
    pub records_written: u64,
    pub skipped_samples: u64,
    pub channel_count: usize,
    pub scan_rate: u32,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl StreamSummary {
    fn new(device: &str, stream: &StreamSession) -> Self {
        StreamSummary {
            device: device.to_string(),
            phase: WorkerPhase::Idle,
            file: None,
            total_scans: 0,
            records_written: 0,
            skipped_samples: 0,
            channel_count: stream.channels.len(),
            scan_rate: stream.scan_rate,
            elapsed: Duration::ZERO,
            error: None,
        }
    }

    /// Skipped samples expressed in whole scans.
    pub fn skipped_scans(&self) -> u64 {
        if self.channel_count == 0 {
            0
        } else {
            (self.skipped_samples as f64 / self.channel_count as f64).round() as u64
        }
    }

    pub fn timed_scan_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_scans as f64 / secs
        } else {
            0.0
        }
    }

    fn log(&self) {
        tracing::info!(
            device = %self.device,
            total_scans = self.total_scans,
            elapsed_secs = self.elapsed.as_secs_f64(),
            scan_rate = self.scan_rate,
            timed_scan_rate = self.timed_scan_rate(),
            timed_sample_rate = self.timed_scan_rate() * self.channel_count as f64,
            skipped_scans = self.skipped_scans(),
            "stream finished"
        );
    }
}

/// Streams one device from configuration to close.
pub struct StreamWorker {
    device: DeviceConfig,
    driver: Arc<dyn Driver>,
    stream: StreamSession,
    output_dir: PathBuf,
    state: SessionState,
    light: Option<oneshot::Sender<StreamLink>>,
    summary: StreamSummary,
}

impl StreamWorker {
    pub fn new(
        device: DeviceConfig,
        driver: Arc<dyn Driver>,
        stream: StreamSession,
        output_dir: PathBuf,
        state: SessionState,
    ) -> Self {
        let summary = StreamSummary::new(&device.name, &stream);
        StreamWorker {
            device,
            driver,
            stream,
            output_dir,
            state,
            light: None,
            summary,
        }
    }

    /// Pair this worker with a light controller waiting on `tx`'s receiver.
    pub fn with_light(mut self, tx: oneshot::Sender<StreamLink>) -> Self {
        self.light = Some(tx);
        self
    }

    fn enter(&mut self, phase: WorkerPhase) {
        tracing::debug!(device = %self.device.name, ?phase, "stream worker phase");
        self.summary.phase = phase;
    }

    fn fail(&mut self, err: DeviceError) {
        tracing::error!("{}", err);
        self.summary.error = Some(err.to_string());
    }

    /// Run to completion on the current thread. Device errors end this worker only.
    pub fn run(mut self) -> StreamSummary {
        let name = self.device.name.clone();
        tracing::info!(device = %name, address = %self.device.address, "connecting to device");

        self.enter(WorkerPhase::Configuring);
        let handle: Arc<dyn DeviceHandle> = match self.driver.open(&self.device.address.to_string()) {
            Ok(h) => Arc::from(h),
            Err(e) => {
                self.fail(e.on(&name, DeviceOp::Open));
                return self.summary;
            }
        };

        let info = handle.info();
        tracing::info!(device = %name, class = %info.class, serial = %info.serial, connection = %info.connection, "opened device");

        match handle.write_registers(&info.class.register_plan()) {
            Ok(()) => {
                tracing::info!(device = %name, "stream configured");
                self.enter(WorkerPhase::AwaitingStart);
                self.state.start_barrier().wait();

                if self.state.is_shutting_down() {
                    tracing::info!(device = %name, "shutdown before start, not streaming");
                } else if let Err(e) = self.stream_until_stopped(&handle) {
                    self.fail(e);
                }
            }
            Err(e) => self.fail(e.on(&name, DeviceOp::Configure)),
        }

        self.enter(WorkerPhase::Closed);
        if let Err(e) = handle.close() {
            tracing::warn!("{}", e.on(&name, DeviceOp::Close));
        }
        self.summary
    }

    fn stream_until_stopped(&mut self, handle: &Arc<dyn DeviceHandle>) -> Result<(), DeviceError> {
        let name = self.device.name.clone();

        let actual_rate = handle
            .stream_start(self.stream.channels.names(), self.stream.samples_per_block, f64::from(self.stream.scan_rate))
            .map_err(|e| e.on(&name, DeviceOp::Start))?;
        tracing::info!(device = %name, scan_rate = actual_rate, "stream started");

        self.enter(WorkerPhase::Streaming);
        let link = StreamLink::new(handle.clone());
        if let Some(tx) = self.light.take() {
            // Receiver gone means the light controller already exited.
            let _ = tx.send(link.clone());
        }

        let started_at = Utc::now();
        let started = Instant::now();
        let increment = self.stream.increment_micros();
        let mut timestamp = unix_micros(started_at);

        let result = RecordWriter::create(&self.output_dir, &name, started_at)
            .map_err(|e| DeviceError::new(&name, DeviceOp::Output, e))
            .and_then(|mut writer| {
                self.summary.file = Some(writer.path().to_path_buf());
                tracing::info!(device = %name, file = %writer.path().display(), "performing stream reads until interrupted");

                let looped = self.read_loop(handle, &mut writer, &mut timestamp, increment);
                self.summary.records_written = writer.records_written();
                let finished = writer
                    .finish()
                    .map(|_| ())
                    .map_err(|e| DeviceError::new(&name, DeviceOp::Output, e));
                looped.and(finished)
            });

        self.summary.elapsed = started.elapsed();
        link.deactivate();

        self.enter(WorkerPhase::Stopping);
        if let Err(e) = handle.stream_stop() {
            tracing::warn!("{}", e.on(&name, DeviceOp::Stop));
        }
        self.summary.log();
        result
    }

    fn read_loop(
        &mut self,
        handle: &Arc<dyn DeviceHandle>,
        writer: &mut RecordWriter,
        timestamp: &mut u64,
        increment: u64,
    ) -> Result<(), DeviceError> {
        let name = self.device.name.clone();
        let channels = &self.stream.channels;
        let width = channels.len();

        while !self.state.is_shutting_down() {
            let block = handle.stream_read().map_err(|e| e.on(&name, DeviceOp::Read))?;

            self.summary.total_scans += channels.scans_in(&block) as u64;
            self.summary.skipped_samples += count_skipped(&block);

            for (i, scan) in block.chunks_exact(width).enumerate() {
                let record = channels.decode(scan, *timestamp);
                writer
                    .append(&record)
                    .map_err(|e| DeviceError::new(&name, DeviceOp::Output, e))?;
                if i == 0 {
                    tracing::debug!(device = %name, ?record, "first record of block");
                }
                *timestamp += increment;
            }
            writer
                .flush()
                .map_err(|e| DeviceError::new(&name, DeviceOp::Output, e))?;
        }
        Ok(())
    }
}
