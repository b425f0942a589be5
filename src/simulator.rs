//! In-process stand-in for the vendor driver.
//!
//! Produces paced, plausible scans so a full session can run without
//! hardware attached: a noisy wheel waveform on AIN0, the light output echoed
//! on AIN1, toggling camera/pulse lines and a binary counter on EIO0..EIO7.

use crate::channels::SKIP_SENTINEL;
use crate::device::{DeviceClass, DeviceHandle, DeviceInfo, Driver, DriverResult};
use crate::error::DriverError;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct SimulatorOptions {
    pub class: DeviceClass,
    pub trigger_line: String,
    /// Trigger line reads high once this much time has passed since the driver was created.
    pub trigger_after: Duration,
    /// Output line echoed back on AIN1.
    pub light_line: String,
    /// Replace the wheel reading of every n-th scan with the skip sentinel.
    pub skip_every: Option<u64>,
    /// Addresses that refuse to open.
    pub fail_open: Vec<String>,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        SimulatorOptions {
            class: DeviceClass::T7,
            trigger_line: "FIO2".to_string(),
            trigger_after: Duration::from_secs(2),
            light_line: "DIO17".to_string(),
            skip_every: None,
            fail_open: Vec::new(),
        }
    }
}

/// Line writes observed by every device of one driver, in order.
pub type WriteLog = Arc<Mutex<Vec<(String, String, f64)>>>;

pub struct SimulatedDriver {
    options: SimulatorOptions,
    created: Instant,
    writes: WriteLog,
    devices: Mutex<HashMap<String, Arc<Mutex<SimState>>>>,
}

impl SimulatedDriver {
    pub fn new(options: SimulatorOptions) -> Self {
        SimulatedDriver {
            options,
            created: Instant::now(),
            writes: WriteLog::default(),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// `(address, line, value)` for every `write_line` call so far.
    #[cfg(test)]
    pub fn writes(&self) -> WriteLog {
        self.writes.clone()
    }
}

impl Driver for SimulatedDriver {
    /// Opening an address twice yields two handles onto the same device, so
    /// closing either one stops the device for both.
    fn open(&self, address: &str) -> DriverResult<Box<dyn DeviceHandle>> {
        if self.options.fail_open.iter().any(|a| a == address) {
            return Err(DriverError::new(format!("no device found at {}", address)));
        }
        let state = self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(address.to_string())
            .or_default()
            .clone();
        Ok(Box::new(SimulatedDevice {
            address: address.to_string(),
            options: self.options.clone(),
            created: self.created,
            writes: self.writes.clone(),
            state,
        }))
    }
}

#[derive(Default)]
struct SimState {
    configured: bool,
    lines: HashMap<String, f64>,
    stream: Option<SimStream>,
}

struct SimStream {
    channels: Vec<String>,
    scans_per_read: u32,
    scan_rate: f64,
    scan_index: u64,
    next_due: Instant,
}

struct SimulatedDevice {
    address: String,
    options: SimulatorOptions,
    created: Instant,
    writes: WriteLog,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sample(&self, channel: &str, index: u64, scan_rate: f64, light: f64, rng: &mut impl Rng) -> f64 {
        let t = index as f64 / scan_rate;
        match channel {
            "AIN0" => {
                if self.options.skip_every.is_some_and(|n| n > 0 && index % n == n - 1) {
                    SKIP_SENTINEL
                } else {
                    2.5 + 2.0 * (t * std::f64::consts::TAU * 0.5).sin() + rng.gen_range(-0.01..0.01)
                }
            }
            "AIN1" => light * 3.3,
            "FIO0" => (index % 2) as f64,
            "FIO1" => {
                let per_second = scan_rate.max(1.0) as u64;
                if index % per_second == 0 {
                    1.0
                } else {
                    0.0
                }
            }
            name => match name.strip_prefix("EIO").and_then(|n| n.parse::<u32>().ok()) {
                Some(bit) if bit < 64 => ((index >> bit) & 1) as f64,
                _ => 0.0,
            },
        }
    }
}

impl DeviceHandle for SimulatedDevice {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            class: self.options.class,
            serial: self.address.clone(),
            connection: "simulated".to_string(),
        }
    }

    fn write_registers(&self, registers: &[(&str, f64)]) -> DriverResult<()> {
        if let Some((name, _)) = registers.iter().find(|(name, _)| name.is_empty()) {
            return Err(DriverError::new(format!("invalid register name '{}'", name)));
        }
        self.lock().configured = true;
        Ok(())
    }

    fn stream_start(&self, channels: &[String], scans_per_read: u32, scan_rate: f64) -> DriverResult<f64> {
        if scans_per_read == 0 || scan_rate <= 0.0 {
            return Err(DriverError::new("invalid stream parameters"));
        }
        let mut state = self.lock();
        if !state.configured {
            return Err(DriverError::new("device not configured"));
        }
        if state.stream.is_some() {
            return Err(DriverError::new("stream already running"));
        }
        state.stream = Some(SimStream {
            channels: channels.to_vec(),
            scans_per_read,
            scan_rate,
            scan_index: 0,
            next_due: Instant::now() + Duration::from_secs_f64(f64::from(scans_per_read) / scan_rate),
        });
        Ok(scan_rate)
    }

    fn stream_read(&self) -> DriverResult<Vec<f64>> {
        let due = match &self.lock().stream {
            Some(stream) => stream.next_due,
            None => return Err(DriverError::new("stream not running")),
        };
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }

        let mut state = self.lock();
        let light = state.lines.get(&self.options.light_line).copied().unwrap_or(0.0);
        let stream = state
            .stream
            .as_mut()
            .ok_or_else(|| DriverError::new("stream stopped during read"))?;

        let mut rng = rand::thread_rng();
        let mut block = Vec::with_capacity(stream.channels.len() * stream.scans_per_read as usize);
        for _ in 0..stream.scans_per_read {
            for channel in &stream.channels {
                block.push(self.sample(channel, stream.scan_index, stream.scan_rate, light, &mut rng));
            }
            stream.scan_index += 1;
        }
        stream.next_due += Duration::from_secs_f64(f64::from(stream.scans_per_read) / stream.scan_rate);
        Ok(block)
    }

    fn stream_stop(&self) -> DriverResult<()> {
        match self.lock().stream.take() {
            Some(_) => Ok(()),
            None => Err(DriverError::new("stream not running")),
        }
    }

    fn read_line(&self, line: &str) -> DriverResult<f64> {
        if line == self.options.trigger_line {
            let high = self.created.elapsed() >= self.options.trigger_after;
            return Ok(if high { 1.0 } else { 0.0 });
        }
        Ok(self.lock().lines.get(line).copied().unwrap_or(0.0))
    }

    fn write_line(&self, line: &str, value: f64) -> DriverResult<()> {
        self.lock().lines.insert(line.to_string(), value);
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((self.address.clone(), line.to_string(), value));
        Ok(())
    }

    fn close(&self) -> DriverResult<()> {
        let mut state = self.lock();
        state.stream = None;
        state.configured = false;
        Ok(())
    }
}
