use crate::error::FormatError;
use anyhow::Result;
use bytes::{Buf, BufMut};
use std::io::Read;

/// Size of one encoded record: `u64 | u8 | f32 | u8`, little-endian.
pub const RECORD_SIZE: usize = 14;

const LIGHT_BIT: u8 = 1 << 2;
const PULSE_BIT: u8 = 1 << 1;
const CAMERA_BIT: u8 = 1;

/// One decoded scan as persisted to disk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionRecord {
    /// Microseconds since the Unix epoch, software-interpolated.
    pub timestamp_micros: u64,
    /// Bit i is digital line i.
    pub digital_status: u8,
    pub wheel: f32,
    pub light: bool,
    pub pulse: bool,
    pub camera: bool,
}

impl AcquisitionRecord {
    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.light {
            flags |= LIGHT_BIT;
        }
        if self.pulse {
            flags |= PULSE_BIT;
        }
        if self.camera {
            flags |= CAMERA_BIT;
        }
        flags
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        let mut buf = &mut out[..];
        buf.put_u64_le(self.timestamp_micros);
        buf.put_u8(self.digital_status);
        buf.put_f32_le(self.wheel);
        buf.put_u8(self.flags());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() != RECORD_SIZE {
            return Err(FormatError::Length {
                expected: RECORD_SIZE,
                actual: data.len(),
            });
        }
        let mut buf = data;
        let timestamp_micros = buf.get_u64_le();
        let digital_status = buf.get_u8();
        let wheel = buf.get_f32_le();
        let flags = buf.get_u8();
        Ok(AcquisitionRecord {
            timestamp_micros,
            digital_status,
            wheel,
            light: flags & LIGHT_BIT != 0,
            pulse: flags & PULSE_BIT != 0,
            camera: flags & CAMERA_BIT != 0,
        })
    }
}

/// Read the next record from a stream of back-to-back records.
///
/// Returns `Ok(None)` at a clean end of stream. A partial trailing record is
/// reported as [`FormatError::Truncated`].
pub fn read_next_record(reader: &mut dyn Read) -> Result<Option<AcquisitionRecord>> {
    let mut buf = [0u8; RECORD_SIZE];
    let mut filled = 0;
    while filled < RECORD_SIZE {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    match filled {
        0 => Ok(None),
        RECORD_SIZE => Ok(Some(AcquisitionRecord::decode(&buf)?)),
        partial => Err(FormatError::Truncated(partial).into()),
    }
}
