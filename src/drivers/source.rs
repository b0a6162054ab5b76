use std::collections::VecDeque;
use chrono::{Duration, Local};
use rand::Rng;
use crate::types::{Channel, SourceStatus, Timestamp};
/// Outcome of one poll: the values, when they were measured and how the
/// transport fared.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceReading {
    pub values: Vec<f64>,
    pub timestamp: Timestamp,
    pub status: SourceStatus,
}
impl SourceReading {
    pub fn ok(values: Vec<f64>, timestamp: Timestamp) -> Self {
        Self {
            values,
            timestamp,
            status: SourceStatus::OK,
        }
    }
    /// All-zero reading stamped at `timestamp`.
    pub fn zeros(channel_count: usize, timestamp: Timestamp, status: SourceStatus) -> Self {
        Self {
            values: vec![0.0; channel_count],
            timestamp,
            status,
        }
    }
}
/// Anything that yields one reading per poll for a fixed channel group.
pub trait DataSource: Send {
    fn name(&self) -> &str;
    fn channels(&self) -> &[Channel];
    fn channel_count(&self) -> usize {
        self.channels().len()
    }
    /// Never fails: transport problems come back as a status with zeros.
    fn poll(&mut self) -> SourceReading;
}
/// Applies the freshness and health rules to a raw reading.
///
/// The source's own timestamp only decides staleness: every settled reading
/// is stamped `now`, so the store sees poll times in order. Unhealthy
/// readings and readings older than `stale_after` become all zeros. Stale
/// data reports `DataTooOld` whatever the transport said. The value vector
/// always has `channel_count` entries.
pub fn settle_reading(
    reading: SourceReading,
    channel_count: usize,
    now: Timestamp,
    stale_after: Duration,
) -> SourceReading {
    if !reading.status.is_healthy() {
        return SourceReading::zeros(channel_count, now, reading.status);
    }
    if now - reading.timestamp > stale_after {
        return SourceReading::zeros(channel_count, now, SourceStatus::DataTooOld);
    }
    if reading.values.len() != channel_count {
        return SourceReading::zeros(channel_count, now, SourceStatus::Malformed);
    }
    SourceReading {
        timestamp: now,
        ..reading
    }
}
/// Scripted source for tests and deterministic playback. Once the script
/// runs out it reports `ConnectionError`.
pub struct ManualSource {
    name: String,
    channels: Vec<Channel>,
    queue: VecDeque<SourceReading>,
}
impl ManualSource {
    pub fn new(
        name: impl Into<String>,
        channels: Vec<Channel>,
        readings: impl IntoIterator<Item = SourceReading>,
    ) -> Self {
        Self {
            name: name.into(),
            channels,
            queue: readings.into_iter().collect(),
        }
    }
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}
impl DataSource for ManualSource {
    fn name(&self) -> &str {
        &self.name
    }
    fn channels(&self) -> &[Channel] {
        &self.channels
    }
    fn poll(&mut self) -> SourceReading {
        self.queue.pop_front().unwrap_or_else(|| {
            SourceReading::zeros(self.channels.len(), Local::now(), SourceStatus::ConnectionError)
        })
    }
}
/// Bench source: each channel drifts slowly around its own baseline with a
/// little uniform noise, so charts and logs have something to show without
/// hardware attached.
pub struct SimulatedSource {
    name: String,
    channels: Vec<Channel>,
    phase: f64,
}
impl SimulatedSource {
    pub fn new(name: impl Into<String>, channels: Vec<Channel>) -> Self {
        Self {
            name: name.into(),
            channels,
            phase: 0.0,
        }
    }
}
impl DataSource for SimulatedSource {
    fn name(&self) -> &str {
        &self.name
    }
    fn channels(&self) -> &[Channel] {
        &self.channels
    }
    fn poll(&mut self) -> SourceReading {
        self.phase += 0.05;
        let mut rng = rand::thread_rng();
        let values = (0..self.channels.len())
            .map(|i| {
                let baseline = 10.0 * (i as f64 + 1.0);
                let drift = (self.phase * (i as f64 * 0.3 + 1.0)).sin() * 2.0;
                baseline + drift + rng.gen_range(-0.1..0.1)
            })
            .collect();
        SourceReading::ok(values, Local::now())
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crate::drivers::TimeSeriesStore;
    use crate::types::Resolution;
    fn t0() -> Timestamp {
        Local.timestamp_opt(1_700_000_000, 0).unwrap()
    }
    fn channels() -> Vec<Channel> {
        vec![Channel::new(0, "P_st", "psi"), Channel::new(1, "P_pl", "psi")]
    }
    #[test]
    fn http_error_becomes_zero_sample_with_code() {
        let mut source = ManualSource::new(
            "ADC",
            channels(),
            vec![SourceReading {
                values: vec![],
                timestamp: t0(),
                status: SourceStatus::Http(500),
            }],
        );
        let now = t0() + Duration::milliseconds(300);
        let reading = settle_reading(source.poll(), 2, now, Duration::seconds(5));
        assert_eq!(reading.values, vec![0.0, 0.0]);
        assert_eq!(reading.status.to_string(), "500");
        let mut store = TimeSeriesStore::new(2, t0() - Duration::seconds(1));
        store.admit(&reading.values, reading.timestamp).unwrap();
        assert_eq!(store.last_timestamp(Resolution::Native), Some(now));
    }
    #[test]
    fn stale_data_is_zeroed_even_when_transport_is_fine() {
        let reading = SourceReading::ok(vec![1.0, 2.0], t0());
        let settled = settle_reading(reading, 2, t0() + Duration::seconds(6), Duration::seconds(5));
        assert_eq!(settled.status, SourceStatus::DataTooOld);
        assert_eq!(settled.values, vec![0.0, 0.0]);
        let fresh = SourceReading::ok(vec![1.0, 2.0], t0());
        let polled = t0() + Duration::seconds(5);
        let settled = settle_reading(fresh, 2, polled, Duration::seconds(5));
        assert_eq!(settled, SourceReading::ok(vec![1.0, 2.0], polled));
    }
    #[test]
    fn wrong_width_is_reported_as_malformed() {
        let reading = SourceReading::ok(vec![1.0], t0());
        let settled = settle_reading(reading, 2, t0(), Duration::seconds(5));
        assert_eq!(settled.status, SourceStatus::Malformed);
        assert_eq!(settled.values.len(), 2);
    }
    #[test]
    fn exhausted_script_reports_connection_error() {
        let mut source = ManualSource::new("ADC", channels(), Vec::new());
        assert_eq!(source.remaining(), 0);
        let reading = source.poll();
        assert_eq!(reading.status, SourceStatus::ConnectionError);
        assert_eq!(reading.values, vec![0.0, 0.0]);
    }
    #[test]
    fn simulated_source_fills_every_channel() {
        let mut source = SimulatedSource::new("bench", channels());
        let reading = source.poll();
        assert!(reading.status.is_healthy());
        assert_eq!(reading.values.len(), 2);
        assert!(reading.values[1] > reading.values[0]);
    }
}
