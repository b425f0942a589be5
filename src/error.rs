use thiserror::Error;

/// Problems with the structured configuration. Always fatal, raised before
/// any device is opened.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no devices configured")]
    NoDevices,

    #[error("controller device '{0}' is not a registered device")]
    UnknownController(String),

    #[error("light control is enabled but light on/off times are not both set")]
    IncompleteLightWindow,

    #[error("invalid time of day '{value}': expected HH:MM")]
    InvalidTimeOfDay { value: String },

    #[error("samples_per_second must be greater than zero")]
    ZeroScanRate,

    #[error("channel list is empty")]
    EmptyChannelList,

    #[error("channel '{0}' is required but not in the scan list")]
    MissingChannel(String),

    #[error("devices '{first}' and '{second}' would both record to '{file_stem}_*.bin'")]
    FileNameClash {
        first: String,
        second: String,
        file_stem: String,
    },
}

/// The hardware operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    Open,
    Configure,
    Start,
    Read,
    Write,
    Stop,
    Close,
    Output,
}

impl std::fmt::Display for DeviceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceOp::Open => "open",
            DeviceOp::Configure => "configure",
            DeviceOp::Start => "stream start",
            DeviceOp::Read => "read",
            DeviceOp::Write => "write",
            DeviceOp::Stop => "stream stop",
            DeviceOp::Close => "close",
            DeviceOp::Output => "output file",
        };
        f.write_str(s)
    }
}

/// A failure scoped to a single device. Terminates that device's worker only.
#[derive(Debug, Error)]
#[error("device '{device}': {op} failed: {detail}")]
pub struct DeviceError {
    pub device: String,
    pub op: DeviceOp,
    pub detail: String,
}

impl DeviceError {
    pub fn new(device: impl Into<String>, op: DeviceOp, detail: impl std::fmt::Display) -> Self {
        DeviceError {
            device: device.into(),
            op,
            detail: detail.to_string(),
        }
    }
}

/// Error reported by a driver before it is attributed to a device.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct DriverError(pub String);

impl DriverError {
    pub fn new(msg: impl Into<String>) -> Self {
        DriverError(msg.into())
    }

    /// Attach device context.
    pub fn on(self, device: &str, op: DeviceOp) -> DeviceError {
        DeviceError::new(device, op, self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("record must be exactly {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("trailing {0} bytes do not form a complete record")]
    Truncated(usize),
}

/// Reasons a session cannot start. Raised before any stream worker runs.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot create output directory {path}: {source}")]
    OutputDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("controller unavailable: {0}")]
    Controller(#[from] DeviceError),
}
