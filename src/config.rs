use crate::channels::ChannelMap;
use crate::error::ConfigError;
use crate::storage::sanitize_filename;
use chrono::NaiveTime;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_SAMPLES_PER_SECOND: u32 = 51;

/// Serial number or free-form address used to open a device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DeviceAddress {
    Serial(u64),
    Address(String),
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAddress::Serial(n) => write!(f, "{}", n),
            DeviceAddress::Address(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LightConfig {
    #[serde(default)]
    pub enabled: bool,
    pub on: Option<String>,
    pub off: Option<String>,
}

/// Named I/O lines used outside the stream scan list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LineConfig {
    #[serde(default = "default_trigger_line")]
    pub trigger: String,
    #[serde(default = "default_light_line")]
    pub light_output: String,
}

impl Default for LineConfig {
    fn default() -> Self {
        LineConfig {
            trigger: default_trigger_line(),
            light_output: default_light_line(),
        }
    }
}

fn default_trigger_line() -> String {
    "FIO2".to_string()
}

fn default_light_line() -> String {
    "DIO17".to_string()
}

pub fn default_channels() -> Vec<String> {
    ["AIN0", "AIN1", "FIO0", "FIO1", "EIO0", "EIO1", "EIO2", "EIO3", "EIO4", "EIO5", "EIO6", "EIO7"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub controller: String,
    pub output_directory: PathBuf,
    pub samples_per_second: Option<u32>,
    pub devices: BTreeMap<String, DeviceAddress>,
    #[serde(default)]
    pub light: LightConfig,
    #[serde(default)]
    pub lines: LineConfig,
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    pub address: DeviceAddress,
}

/// Shared, read-only stream parameters. Identical for every device.
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub scan_rate: u32,
    pub samples_per_block: u32,
    pub channels: ChannelMap,
}

impl StreamSession {
    /// Microseconds between consecutive scans.
    pub fn increment_micros(&self) -> u64 {
        1_000_000 / u64::from(self.scan_rate)
    }
}

/// Daily on/off window. `on <= now < off`, no wrap past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightSchedule {
    pub on: NaiveTime,
    pub off: NaiveTime,
}

/// Validated configuration, ready for the supervisor.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub devices: Vec<DeviceConfig>,
    pub controller: String,
    pub stream: StreamSession,
    pub light: Option<LightSchedule>,
    pub lines: LineConfig,
    pub output_directory: PathBuf,
}

impl SessionPlan {
    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }
}

impl AppConfig {
    pub fn load_default() -> Result<Self, ConfigError> {
        let default = include_str!("../config/default.toml");
        Self::parse(default)
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let p = path.into();
        let s = fs::read_to_string(&p).map_err(|source| ConfigError::Read {
            path: p.display().to_string(),
            source,
        })?;
        Self::parse(&s)
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = toml::from_str(s)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<SessionPlan, ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        if !self.devices.contains_key(&self.controller) {
            return Err(ConfigError::UnknownController(self.controller.clone()));
        }
        let mut stems: BTreeMap<String, &str> = BTreeMap::new();
        for name in self.devices.keys() {
            let stem = sanitize_filename(name);
            if let Some(first) = stems.insert(stem.clone(), name.as_str()) {
                return Err(ConfigError::FileNameClash {
                    first: first.to_string(),
                    second: name.clone(),
                    file_stem: stem,
                });
            }
        }

        let scan_rate = self.samples_per_second.unwrap_or(DEFAULT_SAMPLES_PER_SECOND);
        if scan_rate == 0 {
            return Err(ConfigError::ZeroScanRate);
        }
        let channels = ChannelMap::new(&self.channels)?;

        let light = if self.light.enabled {
            match (&self.light.on, &self.light.off) {
                (Some(on), Some(off)) => Some(LightSchedule {
                    on: parse_time_of_day(on)?,
                    off: parse_time_of_day(off)?,
                }),
                _ => return Err(ConfigError::IncompleteLightWindow),
            }
        } else {
            None
        };

        let devices = self
            .devices
            .iter()
            .map(|(name, address)| DeviceConfig {
                name: name.clone(),
                address: address.clone(),
            })
            .collect();

        Ok(SessionPlan {
            devices,
            controller: self.controller.clone(),
            stream: StreamSession {
                scan_rate,
                samples_per_block: scan_rate,
                channels,
            },
            light,
            lines: self.lines.clone(),
            output_directory: self.output_directory.clone(),
        })
    }
}

pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, ConfigError> {
    let v = value.trim();
    NaiveTime::parse_from_str(v, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(v, "%H:%M:%S"))
        .map_err(|_| ConfigError::InvalidTimeOfDay {
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        controller = "rig_a"
        output_directory = "data"
        samples_per_second = 100

        [devices]
        rig_a = 470012345
        rig_b = "192.168.1.20"

        [light]
        enabled = true
        on = "08:00"
        off = "18:30"
    "#;

    #[test]
    fn test_full_config_validates() {
        let plan = AppConfig::parse(FULL).unwrap().validate().unwrap();
        assert_eq!(plan.devices.len(), 2);
        assert_eq!(plan.controller, "rig_a");
        assert_eq!(plan.stream.scan_rate, 100);
        assert_eq!(plan.stream.samples_per_block, 100);
        assert_eq!(plan.stream.increment_micros(), 10_000);
        assert_eq!(
            plan.device("rig_b").map(|d| d.address.to_string()),
            Some("192.168.1.20".to_string())
        );
        let light = plan.light.unwrap();
        assert_eq!(light.on, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(light.off, NaiveTime::from_hms_opt(18, 30, 0).unwrap());
        assert_eq!(plan.lines, LineConfig::default());
    }

    #[test]
    fn test_defaults_applied() {
        let cfg = AppConfig::parse(
            r#"
            controller = "a"
            output_directory = "out"
            [devices]
            a = 1
        "#,
        )
        .unwrap();
        let plan = cfg.validate().unwrap();
        assert_eq!(plan.stream.scan_rate, DEFAULT_SAMPLES_PER_SECOND);
        assert_eq!(plan.stream.channels.len(), 12);
        assert!(plan.light.is_none());
        assert_eq!(plan.lines.trigger, "FIO2");
        assert_eq!(plan.lines.light_output, "DIO17");
    }

    #[test]
    fn test_unregistered_controller_rejected() {
        let cfg = AppConfig::parse(
            r#"
            controller = "ghost"
            output_directory = "out"
            [devices]
            a = 1
        "#,
        )
        .unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownController(n)) if n == "ghost"));
    }

    #[test]
    fn test_names_sharing_a_file_stem_rejected() {
        let cfg = AppConfig::parse(
            r#"
            controller = "box 1"
            output_directory = "out"
            [devices]
            "box 1" = 1
            "box_1" = 2
        "#,
        )
        .unwrap();
        match cfg.validate() {
            Err(ConfigError::FileNameClash { first, second, file_stem }) => {
                assert_eq!((first.as_str(), second.as_str()), ("box 1", "box_1"));
                assert_eq!(file_stem, "box_1");
            }
            other => panic!("expected a file name clash, got {:?}", other.map(|p| p.devices)),
        }
    }

    #[test]
    fn test_partial_light_window_rejected() {
        let cfg = AppConfig::parse(
            r#"
            controller = "a"
            output_directory = "out"
            [devices]
            a = 1
            [light]
            enabled = true
            on = "07:00"
        "#,
        )
        .unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::IncompleteLightWindow)));
    }

    #[test]
    fn test_disabled_light_ignores_times() {
        let cfg = AppConfig::parse(
            r#"
            controller = "a"
            output_directory = "out"
            [devices]
            a = 1
            [light]
            enabled = false
            on = "nonsense"
        "#,
        )
        .unwrap();
        assert!(cfg.validate().unwrap().light.is_none());
    }

    #[test]
    fn test_zero_rate_and_missing_channel_rejected() {
        let mut cfg = AppConfig::parse(FULL).unwrap();
        cfg.samples_per_second = Some(0);
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroScanRate)));

        let mut cfg = AppConfig::parse(FULL).unwrap();
        cfg.channels.retain(|c| c != "EIO3");
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingChannel(c)) if c == "EIO3"));
    }

    #[test]
    fn test_time_of_day_parsing() {
        assert_eq!(
            parse_time_of_day(" 06:15 ").unwrap(),
            NaiveTime::from_hms_opt(6, 15, 0).unwrap()
        );
        assert_eq!(
            parse_time_of_day("23:59:30").unwrap(),
            NaiveTime::from_hms_opt(23, 59, 30).unwrap()
        );
        assert!(parse_time_of_day("25:00").is_err());
    }

    #[test]
    fn test_bundled_default_loads() {
        let cfg = AppConfig::load_default().unwrap();
        assert!(cfg.validate().is_ok());
    }
}
