use crate::record::read_next_record;
use crate::storage::list_recordings;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

pub const CSV_HEADER: [&str; 6] = [
    "POSIX",
    "Digital Pins",
    "Light State",
    "Wheel Analog",
    "Sync Pulse",
    "Camera Pulse",
];

/// Default subdirectory created beside each recording.
pub const CSV_DIR: &str = "csv_files";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub source: PathBuf,
    pub csv: PathBuf,
    pub records: u64,
}

/// Expand directories into the recordings they contain; files pass through.
pub fn expand_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for input in inputs {
        if input.is_dir() {
            out.extend(list_recordings(input)?);
        } else {
            out.push(input.clone());
        }
    }
    Ok(out)
}

fn csv_path_for(input: &Path, out_dir: Option<&Path>) -> PathBuf {
    let dir = match out_dir {
        Some(d) => d.to_path_buf(),
        None => input.parent().unwrap_or_else(|| Path::new(".")).join(CSV_DIR),
    };
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording".to_string());
    dir.join(format!("{}.csv", stem))
}

/// Convert one binary recording to CSV.
pub fn export_csv(input: &Path, out_dir: Option<&Path>) -> Result<ExportSummary> {
    let csv_path = csv_path_for(input, out_dir);
    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut reader = BufReader::new(File::open(input).with_context(|| format!("opening {}", input.display()))?);
    let mut writer = csv::Writer::from_path(&csv_path)?;
    writer.write_record(CSV_HEADER)?;

    let mut records = 0u64;
    while let Some(r) = read_next_record(&mut reader).with_context(|| format!("reading {}", input.display()))? {
        writer.write_record([
            r.timestamp_micros.to_string(),
            r.digital_status.to_string(),
            u8::from(r.light).to_string(),
            format!("{:.3}", r.wheel),
            u8::from(r.pulse).to_string(),
            u8::from(r.camera).to_string(),
        ])?;
        records += 1;
    }
    writer.flush()?;

    tracing::info!("exported {} records from {} to {}", records, input.display(), csv_path.display());
    Ok(ExportSummary {
        source: input.to_path_buf(),
        csv: csv_path,
        records,
    })
}

/// Export every input; a failing file does not stop the rest.
pub fn export_all(inputs: &[PathBuf], out_dir: Option<&Path>) -> Result<Vec<(PathBuf, Result<ExportSummary>)>> {
    let files = expand_inputs(inputs)?;
    Ok(files
        .into_iter()
        .map(|f| {
            let result = export_csv(&f, out_dir);
            if let Err(e) = &result {
                tracing::error!("error exporting {}: {:#}", f.display(), e);
            }
            (f, result)
        })
        .collect())
}
