// src/types.rs
use std::fmt;

use chrono::{DateTime, Duration, Local};
use serde::{Deserialize, Serialize};

/// Wall-clock instant attached to every sample.
pub type Timestamp = DateTime<Local>;

// 时间分辨率 (四个保留窗口)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Native,
    Minute,
    TenMinute,
    Hour,
}

impl Resolution {
    pub const ALL: [Resolution; 4] = [
        Resolution::Native,
        Resolution::Minute,
        Resolution::TenMinute,
        Resolution::Hour,
    ];

    /// Nominal bucket width. Native is the fetch cadence, the others are
    /// enforced by the store's admission rule.
    pub fn interval(self) -> Duration {
        Duration::seconds(self.seconds())
    }

    pub fn seconds(self) -> i64 {
        match self {
            Resolution::Native => 1,
            Resolution::Minute => 60,
            Resolution::TenMinute => 600,
            Resolution::Hour => 3600,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Resolution::Native => 0,
            Resolution::Minute => 1,
            Resolution::TenMinute => 2,
            Resolution::Hour => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Resolution::Native => "1 s",
            Resolution::Minute => "1 min",
            Resolution::TenMinute => "10 min",
            Resolution::Hour => "1 hour",
        }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution::Native
    }
}

/// One named measurement inside a channel group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    #[serde(default)]
    pub index: usize,
    pub name: String,
    #[serde(default)]
    pub unit: String,
}

impl Channel {
    pub fn new(index: usize, name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            unit: unit.into(),
        }
    }
}

/// Renumbers channels so `index` matches their position in the group.
pub fn index_channels(channels: &mut [Channel]) {
    for (idx, channel) in channels.iter_mut().enumerate() {
        channel.index = idx;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub values: Vec<f64>,
}

/// Connectivity outcome of the most recent poll of a data source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceStatus {
    Http(u16),
    Off,
    DataTooOld,
    ConnectionError,
    Timeout,
    RequestError,
    Malformed,
}

impl SourceStatus {
    pub const OK: SourceStatus = SourceStatus::Http(200);

    pub fn is_healthy(self) -> bool {
        matches!(self, SourceStatus::Http(code) if (200..300).contains(&code))
    }

    /// Short text for a status panel: "Connected", "Err(500)" or the variant.
    pub fn describe(self) -> String {
        match self {
            s if s.is_healthy() => "Connected".to_owned(),
            SourceStatus::Http(code) => format!("Err({code})"),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceStatus::Http(code) => write!(f, "{code}"),
            SourceStatus::Off => f.write_str("Off"),
            SourceStatus::DataTooOld => f.write_str("DataTooOld"),
            SourceStatus::ConnectionError => f.write_str("ConnectionError"),
            SourceStatus::Timeout => f.write_str("Timeout"),
            SourceStatus::RequestError => f.write_str("RequestError"),
            SourceStatus::Malformed => f.write_str("Malformed"),
        }
    }
}
