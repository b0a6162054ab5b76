use std::f64::consts::PI;
/// Default smoothing time constant for ADC channels, in seconds.
pub const DEFAULT_CUTOFF_SECS: f64 = 10.0;
#[derive(Clone, Copy, Debug)]
struct ChannelState {
    cutoff_secs: f64,
    output: Option<f64>,
}
/// Per-channel first-order exponential low-pass.
///
/// `beta = exp(-2*pi*dt/cutoff)`; the first value a channel sees passes
/// through unchanged and seeds the filter.
#[derive(Clone, Debug)]
pub struct SignalConditioner {
    channels: Vec<ChannelState>,
}
impl SignalConditioner {
    pub fn new(channel_count: usize, cutoff_secs: f64) -> Self {
        Self::with_cutoffs(vec![cutoff_secs; channel_count])
    }
    pub fn with_cutoffs(cutoffs: Vec<f64>) -> Self {
        Self {
            channels: cutoffs
                .into_iter()
                .map(|cutoff_secs| ChannelState {
                    cutoff_secs,
                    output: None,
                })
                .collect(),
        }
    }
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
    /// Smooths `raw` for `channel`. Unknown channels pass the value through.
    pub fn filter(&mut self, channel: usize, raw: f64, dt_secs: f64) -> f64 {
        let Some(state) = self.channels.get_mut(channel) else {
            return raw;
        };
        let next = match state.output {
            None => raw,
            Some(previous) => {
                let beta = smoothing_factor(dt_secs, state.cutoff_secs);
                (1.0 - beta) * raw + beta * previous
            }
        };
        state.output = Some(next);
        next
    }
    /// Returns the current output without advancing. Zero before the first sample.
    pub fn hold(&self, channel: usize) -> f64 {
        self.last(channel).unwrap_or(0.0)
    }
    pub fn last(&self, channel: usize) -> Option<f64> {
        self.channels.get(channel).and_then(|state| state.output)
    }
}
fn smoothing_factor(dt_secs: f64, cutoff_secs: f64) -> f64 {
    if cutoff_secs <= 0.0 {
        return 0.0;
    }
    (-2.0 * PI * dt_secs.max(0.0) / cutoff_secs).exp()
}
