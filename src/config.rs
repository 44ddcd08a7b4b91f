use anyhow::{Context, Result};
use rtu_poller_lib::protocol::{self as proto, DeviceDetail, MasterQuery};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "rtupoll.yml";

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    #[serde(default = "default_device")]
    pub device: String,
    /// Overrides the persisted baud rate.
    pub baud_rate: Option<u32>,
    /// Overrides the persisted parity.
    pub parity: Option<proto::Parity>,
    /// Time the RS-485 driver gets after RTS is raised.
    #[serde(default = "default_settle_time", with = "humantime_serde")]
    pub settle_time: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud_rate: None,
            parity: None,
            settle_time: default_settle_time(),
        }
    }
}

fn default_device() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn default_settle_time() -> Duration {
    Duration::from_millis(1)
}

/// Overrides of the persisted reporting record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportingConfig {
    #[serde(default, with = "humantime_serde")]
    pub reply_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub inter_query_delay: Option<Duration>,
    pub continuous: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    pub id: u8,
    pub slave: u8,
    pub function: proto::FunctionCode,
    #[serde(default)]
    pub address: u16,
    #[serde(default = "default_count")]
    pub count: u16,
    /// Zero runs the query once.
    #[serde(default, with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default)]
    pub one_shot: bool,
    #[serde(default)]
    pub device_id: u8,
    #[serde(default)]
    pub attribute_id: u16,
    #[serde(default)]
    pub write_data: Vec<u8>,
}

fn default_count() -> u16 {
    1
}

impl QueryConfig {
    pub fn to_query(&self) -> Result<MasterQuery> {
        let id = proto::QueryId::try_from(self.id)?;
        let interval = u16::try_from(self.interval.as_secs())
            .with_context(|| format!("Interval of query {id} is too long"))?;
        let mut query = MasterQuery::new(id, self.slave, self.function, self.address, self.count)
            .with_device(DeviceDetail {
                device_id: self.device_id,
                status: 0,
                attribute_id: self.attribute_id,
            })
            .with_interval(interval)
            .with_write_data(&self.write_data)
            .with_context(|| format!("Invalid write data of query {id}"))?;
        if self.one_shot {
            query = query.one_shot();
        }
        Ok(query)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
    /// Image file backing the persistent settings.
    #[serde(default = "default_storage")]
    pub storage: PathBuf,
    #[serde(default)]
    pub queries: Vec<QueryConfig>,
}

fn default_storage() -> PathBuf {
    PathBuf::from("rtupoll.bin")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            reporting: ReportingConfig::default(),
            storage: default_storage(),
            queries: Vec::new(),
        }
    }
}

/// Loads `path`, or the default file if present, or the built-in defaults.
pub fn get_config(path: Option<&Path>) -> Result<Config> {
    let default_file = Path::new(DEFAULT_CONFIG_FILE);
    let path = match path {
        Some(path) => path,
        None if default_file.exists() => default_file,
        None => {
            log::debug!("No config file, using defaults");
            return Ok(Config::default());
        }
    };
    log::debug!("Loading config file from {path:?}");
    let config_file = File::open(path).with_context(|| format!("Cannot open config file {path:?}"))?;
    serde_yaml::from_reader(&config_file).with_context(|| format!("Cannot parse config file {path:?}"))
}
