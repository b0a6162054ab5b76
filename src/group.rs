// src/group.rs
use std::sync::Arc;

use parking_lot::RwLock;

use crate::drivers::{ChartGroup, SourceReading, TelemetryError, TimeSeriesStore};
use crate::recorder::LogField;
use crate::types::{Channel, Resolution, Sample, SourceStatus, Timestamp};

/// Mutable half of a channel group. The fetch thread is the only writer.
#[derive(Debug)]
pub struct GroupState {
    pub store: TimeSeriesStore,
    pub status: SourceStatus,
}

/// A named set of channels fed by one data source.
#[derive(Debug)]
pub struct ChannelGroup {
    name: String,
    channels: Vec<Channel>,
    enabled: bool,
    state: RwLock<GroupState>,
}

pub type SharedGroup = Arc<ChannelGroup>;

impl ChannelGroup {
    /// Builds a group whose store is seeded with one zero sample at `now`.
    pub fn new(name: impl Into<String>, channels: Vec<Channel>, enabled: bool, now: Timestamp) -> Self {
        let store = TimeSeriesStore::new(channels.len(), now);
        Self::with_store(name, channels, enabled, store)
    }

    pub fn with_store(
        name: impl Into<String>,
        channels: Vec<Channel>,
        enabled: bool,
        store: TimeSeriesStore,
    ) -> Self {
        let status = if enabled { SourceStatus::OK } else { SourceStatus::Off };
        Self {
            name: name.into(),
            channels,
            enabled,
            state: RwLock::new(GroupState { store, status }),
        }
    }

    pub fn shared(self) -> SharedGroup {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn status(&self) -> SourceStatus {
        self.state.read().status
    }

    /// Stores a settled reading and its status. A width mismatch leaves the
    /// history untouched but still records the status.
    pub fn record(&self, reading: SourceReading) -> Result<(), TelemetryError> {
        let mut state = self.state.write();
        state.status = reading.status;
        state.store.admit(&reading.values, reading.timestamp)
    }

    pub fn last_timestamp(&self, resolution: Resolution) -> Option<Timestamp> {
        self.state.read().store.last_timestamp(resolution)
    }

    pub fn last_sample(&self) -> Option<Sample> {
        self.state.read().store.last_sample()
    }

    pub fn chart(&self, resolution: Resolution) -> ChartGroup {
        ChartGroup {
            name: self.name.clone(),
            channels: self.channels.clone(),
            history: self.state.read().store.snapshot(resolution),
        }
    }

    /// Latest values paired with their units, zeros if nothing was stored yet.
    pub fn log_fields(&self) -> Vec<LogField> {
        let values = self
            .last_sample()
            .map(|s| s.values)
            .unwrap_or_else(|| vec![0.0; self.channels.len()]);
        self.channels
            .iter()
            .zip(values)
            .map(|(channel, value)| LogField::new(value, channel.unit.clone()))
            .collect()
    }

    /// Runs `f` with the store under a read lock.
    pub fn with_store_read<R>(&self, f: impl FnOnce(&TimeSeriesStore) -> R) -> R {
        f(&self.state.read().store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Local, TimeZone};

    #[test]
    fn record_updates_status_and_history() {
        let t0 = Local.timestamp_opt(1_700_000_000, 0).unwrap();
        let group = ChannelGroup::new(
            "DRC91C",
            vec![Channel::new(0, "Head", "K"), Channel::new(1, "Cold Tip", "K")],
            true,
            t0,
        );
        assert_eq!(group.status(), SourceStatus::OK);
        let reading = SourceReading::ok(vec![40.0, 4.2], t0 + Duration::seconds(1));
        group.record(reading).unwrap();
        assert_eq!(group.log_fields(), vec![LogField::new(40.0, "K"), LogField::new(4.2, "K")]);
        let bad = SourceReading::zeros(1, t0 + Duration::seconds(2), SourceStatus::Timeout);
        assert!(group.record(bad).is_err());
        assert_eq!(group.status(), SourceStatus::Timeout);
        assert_eq!(group.with_store_read(|s| s.get(Resolution::Native).len()), 2);
        assert_eq!(group.chart(Resolution::Native).history.timestamps.len(), 2);
    }

    #[test]
    fn disabled_group_starts_off() {
        let t0 = Local.timestamp_opt(1_700_000_000, 0).unwrap();
        let group = ChannelGroup::new("RFM", vec![Channel::new(0, "Tip", "L/min")], false, t0);
        assert_eq!(group.status(), SourceStatus::Off);
        assert!(!group.is_enabled());
    }
}
