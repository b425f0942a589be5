//! Scan list layout and per-scan decoding.
//!
//! Channel offsets are resolved once per session; decoding a scan is then a
//! handful of indexed loads.

use crate::error::ConfigError;
use crate::record::AcquisitionRecord;

/// Readings above this count as a high digital level.
pub const HIGH_THRESHOLD: f64 = 0.5;

/// Value the driver substitutes for a sample it could not deliver.
pub const SKIP_SENTINEL: f64 = -9999.0;

pub const WHEEL_CHANNEL: &str = "AIN0";
pub const LIGHT_CHANNEL: &str = "AIN1";
pub const CAMERA_CHANNEL: &str = "FIO0";
pub const PULSE_CHANNEL: &str = "FIO1";
pub const DIGITAL_LINES: usize = 8;

fn digital_channel(line: usize) -> String {
    format!("EIO{}", line)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    names: Vec<String>,
    wheel: usize,
    light: usize,
    camera: usize,
    pulse: usize,
    digital: [usize; DIGITAL_LINES],
}

impl ChannelMap {
    pub fn new(names: &[String]) -> Result<Self, ConfigError> {
        if names.is_empty() {
            return Err(ConfigError::EmptyChannelList);
        }
        let find = |name: &str| {
            names
                .iter()
                .position(|n| n == name)
                .ok_or_else(|| ConfigError::MissingChannel(name.to_string()))
        };

        let mut digital = [0usize; DIGITAL_LINES];
        for (line, slot) in digital.iter_mut().enumerate() {
            *slot = find(&digital_channel(line))?;
        }

        Ok(ChannelMap {
            names: names.to_vec(),
            wheel: find(WHEEL_CHANNEL)?,
            light: find(LIGHT_CHANNEL)?,
            camera: find(CAMERA_CHANNEL)?,
            pulse: find(PULSE_CHANNEL)?,
            digital,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Number of complete scans in an interleaved block.
    pub fn scans_in(&self, block: &[f64]) -> usize {
        block.len() / self.names.len()
    }

    /// Pack the eight digital lines into a byte, bit i = line i.
    pub fn digital_status(&self, scan: &[f64]) -> u8 {
        let mut status = 0u8;
        for (line, offset) in self.digital.iter().enumerate() {
            if scan[*offset] > HIGH_THRESHOLD {
                status |= 1 << line;
            }
        }
        status
    }

    /// Decode one scan. `scan` must hold exactly one reading per channel.
    pub fn decode(&self, scan: &[f64], timestamp_micros: u64) -> AcquisitionRecord {
        AcquisitionRecord {
            timestamp_micros,
            digital_status: self.digital_status(scan),
            wheel: scan[self.wheel] as f32,
            light: scan[self.light] > HIGH_THRESHOLD,
            pulse: scan[self.pulse] > HIGH_THRESHOLD,
            camera: scan[self.camera] > HIGH_THRESHOLD,
        }
    }
}

/// Count sentinel slots across every channel of a block.
pub fn count_skipped(block: &[f64]) -> u64 {
    block.iter().filter(|&&v| v == SKIP_SENTINEL).count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_channels;

    fn map() -> ChannelMap {
        ChannelMap::new(&default_channels()).unwrap()
    }

    // AIN0 AIN1 FIO0 FIO1 EIO0..EIO7
    fn scan(wheel: f64, light: f64, camera: f64, pulse: f64, digital: [f64; 8]) -> Vec<f64> {
        let mut v = vec![wheel, light, camera, pulse];
        v.extend_from_slice(&digital);
        v
    }

    #[test]
    fn test_digital_status_bit_i_is_line_i() {
        let s = scan(0.0, 0.0, 0.0, 0.0, [1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
        assert_eq!(map().digital_status(&s), 0b1000_1101);
    }

    #[test]
    fn test_threshold_is_strictly_above_half() {
        let s = scan(0.0, 0.5, 0.51, 0.5, [0.5; 8]);
        let r = map().decode(&s, 7);
        assert!(!r.light);
        assert!(r.camera);
        assert!(!r.pulse);
        assert_eq!(r.digital_status, 0);
    }

    #[test]
    fn test_decode_uses_named_offsets_not_positions() {
        let mut names = default_channels();
        names.reverse();
        let m = ChannelMap::new(&names).unwrap();
        // reversed: EIO7..EIO0 FIO1 FIO0 AIN1 AIN0
        let s = vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 3.3, 0.0, 3.3, 1.25];
        let r = m.decode(&s, 42);
        assert_eq!(r.timestamp_micros, 42);
        assert_eq!(r.digital_status, 0b1000_0000);
        assert!(r.pulse);
        assert!(!r.camera);
        assert!(r.light);
        assert_eq!(r.wheel, 1.25);
    }

    #[test]
    fn test_skip_sentinel_is_decoded_verbatim() {
        let s = scan(SKIP_SENTINEL, 0.0, 0.0, 0.0, [0.0; 8]);
        assert_eq!(map().decode(&s, 0).wheel, -9999.0);
    }

    #[test]
    fn test_count_skipped_across_channels() {
        let mut block = scan(SKIP_SENTINEL, 0.0, 0.0, SKIP_SENTINEL, [0.0; 8]);
        block.extend(scan(0.0, 0.0, 0.0, 0.0, [0.0, SKIP_SENTINEL, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]));
        assert_eq!(count_skipped(&block), 3);
        assert_eq!(map().scans_in(&block), 2);
    }

    #[test]
    fn test_missing_channel_and_empty_list() {
        assert!(matches!(ChannelMap::new(&[]), Err(ConfigError::EmptyChannelList)));
        let names: Vec<String> = default_channels().into_iter().filter(|n| n != "AIN1").collect();
        assert!(matches!(ChannelMap::new(&names), Err(ConfigError::MissingChannel(c)) if c == "AIN1"));
    }
}
