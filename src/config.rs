// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cadence::{ThresholdRule, DEFAULT_CATCH_WINDOW_MS, DEFAULT_TICK_MS};
use crate::drivers::{
    AdcChannelSpec, DataSource, FieldFormat, FieldSpec, HttpSource, SerialAdcSource, SimulatedSource,
    TelemetryError,
};
use crate::types::{index_channels, Channel, Resolution};

/// Reads a JSON config, or writes the default there and uses it when the
/// file is missing or unreadable.
pub fn load_or_init<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Serialize + Default,
{
    match fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|text| serde_json::from_str(&text).map_err(anyhow::Error::from))
    {
        Ok(config) => Ok(config),
        Err(e) => {
            warn!("{}: {e}; writing defaults", path.display());
            if let Some(dir) = path.parent() {
                if !dir.as_os_str().is_empty() {
                    fs::create_dir_all(dir)
                        .with_context(|| format!("creating {}", dir.display()))?;
                }
            }
            let text = serde_json::to_string_pretty(&T::default())?;
            fs::write(path, &text).with_context(|| format!("writing {}", path.display()))?;
            let reread = fs::read_to_string(path)
                .with_context(|| format!("re-reading {}", path.display()))?;
            serde_json::from_str(&reread).context("default config does not parse")
        }
    }
}

// 数据源配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    Http {
        url: String,
        fields: Vec<FieldSpec>,
        #[serde(default)]
        timestamp_key: Option<String>,
    },
    SerialAdc {
        port: String,
        #[serde(default = "default_baud")]
        baud: u32,
        #[serde(default = "default_adc_period")]
        sample_period_secs: f64,
        channels: Vec<AdcChannelSpec>,
    },
    Simulated {
        channels: Vec<Channel>,
    },
}

fn default_baud() -> u32 {
    9600
}

fn default_adc_period() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: SourceKind,
}

impl SourceConfig {
    /// Channel declarations, indexed by position.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = match &self.kind {
            SourceKind::Http { fields, .. } => fields
                .iter()
                .map(|f| Channel::new(0, f.name.clone(), f.unit.clone()))
                .collect(),
            SourceKind::SerialAdc { channels, .. } => channels
                .iter()
                .map(|c| Channel::new(0, c.name.clone(), c.unit.clone()))
                .collect(),
            SourceKind::Simulated { channels } => channels.clone(),
        };
        index_channels(&mut channels);
        channels
    }

    pub fn build(&self) -> Result<Box<dyn DataSource>, TelemetryError> {
        Ok(match &self.kind {
            SourceKind::Http {
                url,
                fields,
                timestamp_key,
            } => Box::new(HttpSource::new(
                self.name.clone(),
                url.clone(),
                fields.clone(),
                timestamp_key.clone(),
            )?),
            SourceKind::SerialAdc {
                port,
                baud,
                sample_period_secs,
                channels,
            } => Box::new(SerialAdcSource::open(
                self.name.clone(),
                port,
                *baud,
                channels,
                *sample_period_secs,
            )?),
            SourceKind::Simulated { .. } => {
                Box::new(SimulatedSource::new(self.name.clone(), self.channels()))
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub sources: Vec<SourceConfig>,
    pub display: Resolution,
    pub tick_ms: u64,
    pub catch_window_ms: i64,
    pub fetch_period_ms: u64,
    pub stale_after_secs: i64,
    pub log_root: PathBuf,
    pub chart_path: PathBuf,
    pub alert_spool: Option<PathBuf>,
    pub thresholds: Vec<ThresholdRule>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        let flow = |key: &str| FieldSpec::new(key, key, "L/min", FieldFormat::Number);
        Self {
            sources: vec![
                SourceConfig {
                    name: "MKS247C".into(),
                    enabled: false,
                    kind: SourceKind::Http {
                        url: "http://127.0.0.1:5000/get_value".into(),
                        fields: vec![flow("Tip"), flow("Shield"), flow("Bypass"), flow("Pumping")],
                        timestamp_key: Some("timestamp".into()),
                    },
                },
                SourceConfig {
                    name: "DRC91C".into(),
                    enabled: false,
                    kind: SourceKind::Http {
                        url: "http://127.0.0.1:5001/sensor_pair".into(),
                        fields: vec![
                            FieldSpec::new("valueA", "Head", "K", FieldFormat::Lakeshore),
                            FieldSpec::new("valueB", "Cold Tip", "K", FieldFormat::Lakeshore),
                        ],
                        timestamp_key: Some("timestamp".into()),
                    },
                },
            ],
            display: Resolution::Native,
            tick_ms: DEFAULT_TICK_MS,
            catch_window_ms: DEFAULT_CATCH_WINDOW_MS,
            fetch_period_ms: 1000,
            stale_after_secs: 5,
            log_root: PathBuf::from("log_flowtemp"),
            chart_path: PathBuf::from("charts/flowtemp.png"),
            alert_spool: None,
            thresholds: Vec::new(),
        }
    }
}

impl DashboardConfig {
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.sources.is_empty() {
            return Err(TelemetryError::InvalidConfig("no sources configured".into()));
        }
        if self.tick_ms == 0 || self.fetch_period_ms == 0 {
            return Err(TelemetryError::InvalidConfig(
                "tick_ms and fetch_period_ms must be positive".into(),
            ));
        }
        if let Some(empty) = self.sources.iter().find(|s| s.channels().is_empty()) {
            return Err(TelemetryError::InvalidConfig(format!(
                "source {} has no channels",
                empty.name
            )));
        }
        Ok(())
    }

    pub fn tick(&self) -> StdDuration {
        StdDuration::from_millis(self.tick_ms)
    }

    pub fn fetch_period(&self) -> StdDuration {
        StdDuration::from_millis(self.fetch_period_ms)
    }

    pub fn catch_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.catch_window_ms)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs)
    }
}

// MFC 守护进程配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MfcConfig {
    /// Serial port of the controller; none runs against the simulator.
    pub port: Option<String>,
    pub baud: u32,
    pub columns: Vec<String>,
    /// Device channel per column at startup, 0 for unbound.
    pub bindings: Vec<i64>,
    pub schedule_path: PathBuf,
    pub tick_ms: u64,
}

impl Default for MfcConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: default_baud(),
            columns: vec!["Tip".into(), "Shield".into(), "Bypass".into()],
            bindings: Vec::new(),
            schedule_path: PathBuf::from("schedule.json"),
            tick_ms: 1000,
        }
    }
}

impl MfcConfig {
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.columns.is_empty() {
            return Err(TelemetryError::InvalidConfig("no control columns".into()));
        }
        if self.tick_ms == 0 || self.tick_ms > 60_000 {
            return Err(TelemetryError::InvalidConfig(
                "tick_ms must be between 1 and 60000".into(),
            ));
        }
        Ok(())
    }
}
