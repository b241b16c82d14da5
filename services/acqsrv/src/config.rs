//! Service configuration
//!
//! Loaded with figment, later sources win:
//! 1. YAML file (`config/acqsrv.yaml` or `--config`)
//! 2. `ACQSRV_` environment variables, nested keys split on `__`
//!    (`ACQSRV_PLC__HOST=10.0.0.5`)
//! 3. command line overrides

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::batch::BatchTracker;
use crate::connection::{ReconnectPolicy, SessionTimeouts};
use crate::error::{AcqError, Result};
use crate::scheduler::{SchedulerConfig, WeighingSpec};
use crate::sink::BatchPolicy;
use crate::transport::{Parity, S7Settings, SerialSettings};
use crate::weighing::WeighRequest;

pub const DEFAULT_CONFIG_PATH: &str = "config/acqsrv.yaml";
pub const ENV_PREFIX: &str = "ACQSRV_";

/// Where samples come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    #[default]
    Live,
    Synthetic,
}

impl std::str::FromStr for SourceMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "synthetic" => Ok(Self::Synthetic),
            other => Err(format!("unknown mode '{other}', expected live or synthetic")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub name: String,
    pub mode: SourceMode,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: "acqsrv".to_string(),
            mode: SourceMode::Live,
        }
    }
}

/// PLC session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcSection {
    pub host: String,
    pub port: u16,
    pub rack: u8,
    pub slot: u8,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub pdu_size: u16,
}

impl Default for PlcSection {
    fn default() -> Self {
        Self {
            host: "192.168.0.1".to_string(),
            port: 102,
            rack: 0,
            slot: 1,
            connect_timeout_ms: 5000,
            io_timeout_ms: 2000,
            lock_timeout_ms: 1000,
            pdu_size: 480,
        }
    }
}

impl PlcSection {
    pub fn s7_settings(&self) -> S7Settings {
        S7Settings {
            host: self.host.clone(),
            port: self.port,
            rack: self.rack,
            slot: self.slot,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            pdu_size: self.pdu_size,
        }
    }

    pub fn timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            io: Duration::from_millis(self.io_timeout_ms),
            lock: Duration::from_millis(self.lock_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: false,
        }
    }
}

impl ReconnectSection {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_config(self.base_delay_ms, self.max_delay_ms, self.jitter)
    }
}

/// Weighing instrument on the RS-485 link
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSection {
    pub enabled: bool,
    pub port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub station: u8,
    pub register: u16,
    pub count: u16,
    pub timeout_ms: u64,
    pub measurement: String,
    /// Engineering value = raw × scale
    pub scale: f64,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 19200,
            parity: Parity::Even,
            station: 1,
            register: 2,
            count: 2,
            timeout_ms: 1000,
            measurement: "weighing".to_string(),
            scale: 1.0,
        }
    }
}

impl SerialSection {
    pub fn settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            parity: self.parity,
            ..SerialSettings::default()
        }
    }

    pub fn request(&self) -> WeighRequest {
        WeighRequest {
            station: self.station,
            register: self.register,
            count: self.count,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn weighing_spec(&self) -> WeighingSpec {
        WeighingSpec {
            measurement: self.measurement.clone(),
            scale: self.scale,
            station: self.station,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSection {
    pub fast_period_ms: u64,
    pub normal_period_ms: u64,
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            fast_period_ms: 200,
            normal_period_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchRate {
    pub max_entries: usize,
    pub max_age_ms: u64,
    pub capacity: usize,
}

impl BatchRate {
    pub fn policy(&self) -> BatchPolicy {
        BatchPolicy {
            max_entries: self.max_entries,
            max_age: Duration::from_millis(self.max_age_ms),
            capacity: self.capacity,
        }
    }
}

impl From<BatchPolicy> for BatchRate {
    fn from(policy: BatchPolicy) -> Self {
        Self {
            max_entries: policy.max_entries,
            max_age_ms: u64::try_from(policy.max_age.as_millis()).unwrap_or(u64::MAX),
            capacity: policy.capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    pub fast: BatchRate,
    pub normal: BatchRate,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            fast: BatchPolicy::fast().into(),
            normal: BatchPolicy::normal().into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxSection {
    pub enabled: bool,
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
    pub write_timeout_ms: u64,
}

impl Default for InfluxSection {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:8086".to_string(),
            org: "plant".to_string(),
            bucket: "acquisition".to_string(),
            token: String::new(),
            write_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub dir: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

/// Smelting batch gate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SmeltingSection {
    /// Persist points only while a batch is running or paused
    pub gated: bool,
    /// Batch state saved on every transition and restored at startup
    pub state_file: Option<PathBuf>,
    /// Fast loop period while no batch is active
    pub idle_fast_period_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticSection {
    /// Fixed seed for reproducible runs
    pub seed: Option<u64>,
}

/// Complete service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcqConfig {
    pub service: ServiceSection,
    pub plc: PlcSection,
    pub reconnect: ReconnectSection,
    pub serial: SerialSection,
    pub polling: PollingSection,
    pub batch: BatchSection,
    pub smelting: SmeltingSection,
    pub influxdb: InfluxSection,
    pub logging: LoggingSection,
    /// Schema document path, relative to the working directory
    pub schema: PathBuf,
    pub synthetic: SyntheticSection,
}

impl Default for AcqConfig {
    fn default() -> Self {
        Self {
            service: ServiceSection::default(),
            plc: PlcSection::default(),
            reconnect: ReconnectSection::default(),
            serial: SerialSection::default(),
            polling: PollingSection::default(),
            batch: BatchSection::default(),
            smelting: SmeltingSection::default(),
            influxdb: InfluxSection::default(),
            logging: LoggingSection::default(),
            schema: PathBuf::from("config/schema.yaml"),
            synthetic: SyntheticSection::default(),
        }
    }
}

/// Command line values that take precedence over file and environment
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<SourceMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl AcqConfig {
    /// Defaults ← YAML file ← environment ← overrides, then validate
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load(path: &Path, overrides: &ConfigOverrides) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AcqConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(schema) = &overrides.schema {
            figment = figment.merge(Serialized::default("schema", schema));
        }
        if let Some(mode) = overrides.mode {
            figment = figment.merge(Serialized::default("service.mode", mode));
        }
        if let Some(level) = &overrides.log_level {
            figment = figment.merge(Serialized::default("logging.level", level));
        }

        let config: AcqConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            return Err(AcqError::config("service.name cannot be empty"));
        }
        if common::logging::parse_level(&self.logging.level).is_none() {
            return Err(AcqError::config(format!(
                "logging.level '{}' is not a log level",
                self.logging.level
            )));
        }

        if self.service.mode == SourceMode::Live {
            if self.plc.host.trim().is_empty() {
                return Err(AcqError::config("plc.host cannot be empty in live mode"));
            }
            if self.plc.io_timeout_ms == 0
                || self.plc.connect_timeout_ms == 0
                || self.plc.lock_timeout_ms == 0
            {
                return Err(AcqError::config("plc timeouts must be greater than 0"));
            }
            if self.serial.enabled && self.serial.port.trim().is_empty() {
                return Err(AcqError::config("serial.port cannot be empty when enabled"));
            }
        }

        if self.reconnect.base_delay_ms == 0 {
            return Err(AcqError::config("reconnect.base_delay_ms must be greater than 0"));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(AcqError::config(
                "reconnect.max_delay_ms cannot be less than base_delay_ms",
            ));
        }

        if self.serial.enabled {
            if self.serial.count == 0 || self.serial.count > 125 {
                return Err(AcqError::config("serial.count must be within 1..=125"));
            }
            if self.serial.timeout_ms == 0 {
                return Err(AcqError::config("serial.timeout_ms must be greater than 0"));
            }
            if !self.serial.scale.is_finite() {
                return Err(AcqError::config("serial.scale must be finite"));
            }
        }

        if self.polling.fast_period_ms == 0 || self.polling.normal_period_ms == 0 {
            return Err(AcqError::config("polling periods must be greater than 0"));
        }
        if self.smelting.idle_fast_period_ms == Some(0) {
            return Err(AcqError::config(
                "smelting.idle_fast_period_ms must be greater than 0",
            ));
        }

        for (rate, batch) in [("fast", &self.batch.fast), ("normal", &self.batch.normal)] {
            if batch.max_entries == 0 || batch.max_age_ms == 0 {
                return Err(AcqError::config(format!(
                    "batch.{rate}: max_entries and max_age_ms must be greater than 0"
                )));
            }
            if batch.capacity < batch.max_entries {
                return Err(AcqError::config(format!(
                    "batch.{rate}: capacity cannot be less than max_entries"
                )));
            }
        }

        if self.influxdb.write_timeout_ms == 0 {
            return Err(AcqError::config("influxdb.write_timeout_ms must be greater than 0"));
        }
        if self.influxdb.enabled {
            if self.influxdb.url.trim().is_empty() {
                return Err(AcqError::config("influxdb.url cannot be empty"));
            }
            if self.influxdb.org.trim().is_empty() || self.influxdb.bucket.trim().is_empty() {
                return Err(AcqError::config("influxdb.org and influxdb.bucket are required"));
            }
        }

        Ok(())
    }

    /// Whether the serial weighing exchange runs in this mode
    pub fn weighing_enabled(&self) -> bool {
        match self.service.mode {
            SourceMode::Live => self.serial.enabled,
            SourceMode::Synthetic => true,
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            fast_period: Duration::from_millis(self.polling.fast_period_ms),
            normal_period: Duration::from_millis(self.polling.normal_period_ms),
            idle_fast_period: self.smelting.idle_fast_period_ms.map(Duration::from_millis),
            weighing: self
                .weighing_enabled()
                .then(|| self.serial.weighing_spec()),
        }
    }

    pub fn batch_tracker(&self) -> BatchTracker {
        if self.smelting.gated {
            BatchTracker::gated(self.smelting.state_file.clone())
        } else {
            BatchTracker::ungated()
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.influxdb.write_timeout_ms)
    }
}
