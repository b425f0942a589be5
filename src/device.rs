//! Capability boundary to the vendor hardware driver.
//!
//! The acquisition core only talks to devices through these traits. Handle
//! methods take `&self` because a device's stream worker and its light
//! controller act on the same open handle from different threads.

use crate::error::DriverError;
use std::fmt;

pub type DriverResult<T> = Result<T, DriverError>;

/// Hardware family, decides the register policy applied before streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    T4,
    T7,
    Other(i32),
}

impl DeviceClass {
    pub fn from_code(code: i32) -> Self {
        match code {
            4 => DeviceClass::T4,
            7 => DeviceClass::T7,
            other => DeviceClass::Other(other),
        }
    }

    /// Registers written during configuration, in order.
    pub fn register_plan(&self) -> Vec<(&'static str, f64)> {
        match self {
            DeviceClass::T4 => vec![("STREAM_SETTLING_US", 0.0), ("STREAM_RESOLUTION_INDEX", 0.0)],
            _ => {
                let mut plan = vec![
                    ("STREAM_TRIGGER_INDEX", 0.0),
                    ("STREAM_CLOCK_SOURCE", 0.0),
                    ("AIN0_RANGE", 10.0),
                    ("AIN1_RANGE", 10.0),
                    ("STREAM_RESOLUTION_INDEX", 0.0),
                ];
                if *self == DeviceClass::T7 {
                    // 199 selects single-ended (GND) on the negative input.
                    plan.extend([
                        ("AIN0_NEGATIVE_CH", 199.0),
                        ("STREAM_SETTLING_US", 0.0),
                        ("AIN1_NEGATIVE_CH", 199.0),
                    ]);
                }
                plan
            }
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::T4 => f.write_str("T4"),
            DeviceClass::T7 => f.write_str("T7"),
            DeviceClass::Other(code) => write!(f, "type {}", code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub class: DeviceClass,
    pub serial: String,
    pub connection: String,
}

pub trait DeviceHandle: Send + Sync {
    fn info(&self) -> DeviceInfo;

    fn write_registers(&self, registers: &[(&str, f64)]) -> DriverResult<()>;

    /// Start streaming; returns the scan rate the hardware actually runs at.
    fn stream_start(&self, channels: &[String], scans_per_read: u32, scan_rate: f64) -> DriverResult<f64>;

    /// Block until the next batch of interleaved readings is available.
    fn stream_read(&self) -> DriverResult<Vec<f64>>;

    fn stream_stop(&self) -> DriverResult<()>;

    fn read_line(&self, line: &str) -> DriverResult<f64>;

    fn write_line(&self, line: &str, value: f64) -> DriverResult<()>;

    fn close(&self) -> DriverResult<()>;
}

pub trait Driver: Send + Sync {
    fn open(&self, address: &str) -> DriverResult<Box<dyn DeviceHandle>>;
}
