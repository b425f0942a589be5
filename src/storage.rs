use crate::record::AcquisitionRecord;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const RECORDING_EXTENSION: &str = "bin";

/// Replace anything outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// `<sanitized-device-name>_<YYYYMMDD_HHMMSS>.bin`
pub fn recording_file_name(device: &str, started: DateTime<Utc>) -> String {
    format!(
        "{}_{}.{}",
        sanitize_filename(device),
        started.format("%Y%m%d_%H%M%S"),
        RECORDING_EXTENSION
    )
}

pub fn ensure_output_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

/// Append-only record file, exclusively owned by one stream worker.
pub struct RecordWriter {
    path: PathBuf,
    out: BufWriter<File>,
    records: u64,
}

impl RecordWriter {
    /// Fails if the file already exists; a recording is never appended to
    /// after the fact.
    pub fn create(dir: &Path, device: &str, started: DateTime<Utc>) -> std::io::Result<Self> {
        ensure_output_dir(dir)?;
        let path = dir.join(recording_file_name(device, started));
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok(RecordWriter {
            path,
            out: BufWriter::new(file),
            records: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn append(&mut self, record: &AcquisitionRecord) -> std::io::Result<()> {
        self.out.write_all(&record.encode())?;
        self.records += 1;
        Ok(())
    }

    /// Push buffered records to the OS. Called once per block.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }

    pub fn finish(mut self) -> std::io::Result<PathBuf> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(self.path)
    }
}

/// Every `.bin` recording directly inside `dir`, sorted by name.
pub fn list_recordings(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let p = entry?.path();
        if p.is_file() && p.extension().and_then(|e| e.to_str()) == Some(RECORDING_EXTENSION) {
            out.push(p);
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
pub fn replay_recording(path: &Path) -> Result<Vec<AcquisitionRecord>> {
    use crate::record::read_next_record;
    use std::io::BufReader;

    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    while let Some(record) = read_next_record(&mut reader)? {
        records.push(record);
    }
    Ok(records)
}
