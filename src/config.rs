use anyhow::{Context, Result};
use domectl_lib::frame::UnitId;
use domectl_lib::motor_protocol::FirmwareGeneration;
use domectl_lib::pacer::PacerTiming;
use domectl_lib::transport::{DirectionControl, SerialSettings};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_device() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn default_ac_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_motor_timeout() -> Duration {
    Duration::from_millis(1500)
}

fn default_open_angle() -> i32 {
    -2300
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_rain_interval() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AcConfig {
    #[serde(default = "default_device")]
    pub device: String,
    /// Line settings other than these are fixed at 8E1.
    #[serde(default)]
    pub baud_rate: Option<u32>,
    #[serde(default)]
    pub unit: UnitId,
    #[serde(default = "default_ac_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub direction: DirectionControl,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for AcConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud_rate: None,
            unit: UnitId::default(),
            timeout: default_ac_timeout(),
            direction: DirectionControl::default(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl AcConfig {
    pub fn serial_settings(&self) -> SerialSettings {
        let mut settings = SerialSettings::ac_controller(self.device.clone());
        if let Some(baud_rate) = self.baud_rate {
            settings.baud_rate = baud_rate;
        }
        settings.unit = self.unit;
        settings.timeout = self.timeout;
        settings.direction = self.direction;
        settings
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MotorConfig {
    #[serde(default = "default_device")]
    pub device: String,
    /// Without a baud rate the supported rates are scanned on connect.
    #[serde(default)]
    pub baud_rate: Option<u32>,
    #[serde(default)]
    pub unit: UnitId,
    #[serde(default = "default_motor_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub direction: DirectionControl,
    #[serde(default)]
    pub firmware: FirmwareGeneration,
    #[serde(default = "default_open_angle")]
    pub open_angle: i32,
    #[serde(default)]
    pub close_angle: i32,
    #[serde(default = "default_rain_interval", with = "humantime_serde")]
    pub rain_interval: Duration,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud_rate: None,
            unit: UnitId::default(),
            timeout: default_motor_timeout(),
            direction: DirectionControl::default(),
            firmware: FirmwareGeneration::default(),
            open_angle: default_open_angle(),
            close_angle: 0,
            rain_interval: default_rain_interval(),
        }
    }
}

impl MotorConfig {
    pub fn serial_settings(&self) -> SerialSettings {
        let mut settings = SerialSettings::motor(self.device.clone());
        if let Some(baud_rate) = self.baud_rate {
            settings.baud_rate = baud_rate;
        }
        settings.unit = self.unit;
        settings.timeout = self.timeout;
        settings.direction = self.direction;
        settings
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ac: AcConfig,
    pub motor: MotorConfig,
    pub pacer: PacerTiming,
}

impl Config {
    pub const DEFAULT_CONFIG_FILE: &'static str = "domectl.yml";

    /// Loads `path`, or the default file if it exists, or the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path: PathBuf = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default_file = Path::new(Self::DEFAULT_CONFIG_FILE);
                if !default_file.exists() {
                    log::debug!("No {} found, using defaults", Self::DEFAULT_CONFIG_FILE);
                    return Ok(Self::default());
                }
                default_file.to_path_buf()
            }
        };
        log::debug!("Loading config file from {path:?}");
        let file =
            File::open(&path).with_context(|| format!("Cannot open config file {path:?}"))?;
        serde_yaml::from_reader(file).with_context(|| format!("Invalid config file {path:?}"))
    }
}
