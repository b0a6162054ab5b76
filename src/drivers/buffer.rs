use std::collections::VecDeque;
use crate::drivers::TelemetryError;
use crate::types::{Resolution, Sample, Timestamp};
/// Entries kept per resolution.
pub const CAPACITY: usize = 100;
/// Borrowed view of one resolution; valid until the next `admit`.
#[derive(Clone, Copy, Debug)]
pub struct ResolutionView<'a> {
    pub resolution: Resolution,
    pub timestamps: &'a VecDeque<Timestamp>,
    pub values: &'a [VecDeque<f64>], // channel -> samples
}
impl ResolutionView<'_> {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
    pub fn to_snapshot(&self) -> ResolutionSnapshot {
        ResolutionSnapshot {
            resolution: self.resolution,
            timestamps: self.timestamps.iter().copied().collect(),
            values: self
                .values
                .iter()
                .map(|channel| channel.iter().copied().collect())
                .collect(),
        }
    }
}
/// Owned copy of one resolution, safe to hand to another thread.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolutionSnapshot {
    pub resolution: Resolution,
    pub timestamps: Vec<Timestamp>,
    pub values: Vec<Vec<f64>>, // channels x samples
}
/// One ring-buffer set: a timestamp queue and one value queue per channel.
#[derive(Debug)]
struct Ring {
    timestamps: VecDeque<Timestamp>,
    per_channel: Vec<VecDeque<f64>>,
}
impl Ring {
    fn new(channel_count: usize) -> Self {
        Self {
            timestamps: VecDeque::with_capacity(CAPACITY),
            per_channel: (0..channel_count)
                .map(|_| VecDeque::with_capacity(CAPACITY))
                .collect(),
        }
    }
    fn push(&mut self, timestamp: Timestamp, values: &[f64]) {
        if self.timestamps.len() == CAPACITY {
            self.timestamps.pop_front();
            for queue in &mut self.per_channel {
                queue.pop_front();
            }
        }
        self.timestamps.push_back(timestamp);
        for (queue, &value) in self.per_channel.iter_mut().zip(values) {
            queue.push_back(value);
        }
    }
    fn accepts(&self, resolution: Resolution, timestamp: Timestamp) -> bool {
        match (resolution, self.timestamps.back()) {
            (Resolution::Native, _) | (_, None) => true,
            (_, Some(&last)) => timestamp - last >= resolution.interval(),
        }
    }
}
/// Multi-resolution rolling history for one channel group.
///
/// Every admitted sample lands in the native ring. Coarser rings only take a
/// sample once a full interval has passed since their own newest entry, so
/// at full occupancy they span roughly 100 s, 100 min, 16.7 h and 100 h.
#[derive(Debug)]
pub struct TimeSeriesStore {
    channel_count: usize,
    rings: [Ring; 4],
}
impl TimeSeriesStore {
    /// Creates the store seeded with one all-zero sample at `seeded_at`.
    pub fn new(channel_count: usize, seeded_at: Timestamp) -> Self {
        let mut store = Self::unseeded(channel_count);
        store.push_all(&vec![0.0; channel_count], seeded_at);
        store
    }
    /// Creates an empty store. Used for replaying logs and in tests.
    pub fn unseeded(channel_count: usize) -> Self {
        Self {
            channel_count,
            rings: [
                Ring::new(channel_count),
                Ring::new(channel_count),
                Ring::new(channel_count),
                Ring::new(channel_count),
            ],
        }
    }
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }
    pub fn admit(&mut self, values: &[f64], timestamp: Timestamp) -> Result<(), TelemetryError> {
        if values.len() != self.channel_count {
            return Err(TelemetryError::ChannelMismatch {
                expected: self.channel_count,
                actual: values.len(),
            });
        }
        self.push_all(values, timestamp);
        Ok(())
    }
    fn push_all(&mut self, values: &[f64], timestamp: Timestamp) {
        for resolution in Resolution::ALL {
            let ring = &mut self.rings[resolution.index()];
            if ring.accepts(resolution, timestamp) {
                ring.push(timestamp, values);
            }
        }
    }
    pub fn get(&self, resolution: Resolution) -> ResolutionView<'_> {
        let ring = &self.rings[resolution.index()];
        ResolutionView {
            resolution,
            timestamps: &ring.timestamps,
            values: &ring.per_channel,
        }
    }
    pub fn snapshot(&self, resolution: Resolution) -> ResolutionSnapshot {
        self.get(resolution).to_snapshot()
    }
    pub fn last_timestamp(&self, resolution: Resolution) -> Option<Timestamp> {
        self.rings[resolution.index()].timestamps.back().copied()
    }
    pub fn last_sample(&self) -> Option<Sample> {
        let native = &self.rings[Resolution::Native.index()];
        let timestamp = *native.timestamps.back()?;
        let values = native
            .per_channel
            .iter()
            .map(|queue| queue.back().copied().unwrap_or(0.0))
            .collect();
        Some(Sample { timestamp, values })
    }
}
