use std::io::{BufRead, BufReader, ErrorKind};
use std::time::Duration as StdDuration;
use chrono::Local;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use crate::drivers::filter::{SignalConditioner, DEFAULT_CUTOFF_SECS};
use crate::drivers::source::{DataSource, SourceReading};
use crate::drivers::TelemetryError;
use crate::types::{Channel, SourceStatus, Timestamp};
/// Linear count-to-unit conversion, optionally followed by a polynomial
/// (coefficients lowest order first) applied to the linear result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub gain: f64,
    pub offset: f64,
    #[serde(default)]
    pub polynomial: Vec<f64>,
}
impl Calibration {
    pub fn linear(gain: f64, offset: f64) -> Self {
        Self {
            gain,
            offset,
            polynomial: Vec::new(),
        }
    }
    pub fn apply(&self, counts: f64) -> f64 {
        let x = self.gain * counts + self.offset;
        if self.polynomial.is_empty() {
            return x;
        }
        // Horner
        self.polynomial.iter().rev().fold(0.0, |acc, c| acc * x + c)
    }
}
impl Default for Calibration {
    fn default() -> Self {
        Self::linear(1.0, 0.0)
    }
}
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdcChannelSpec {
    pub name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub calibration: Calibration,
    #[serde(default = "default_cutoff")]
    pub cutoff_secs: f64,
}
fn default_cutoff() -> f64 {
    DEFAULT_CUTOFF_SECS
}
/// Turns CSV lines of raw counts into conditioned values.
#[derive(Clone, Debug)]
pub struct AdcDecoder {
    calibrations: Vec<Calibration>,
    conditioner: SignalConditioner,
    sample_period_secs: f64,
    last_read: Option<Timestamp>,
}
impl AdcDecoder {
    pub fn new(specs: &[AdcChannelSpec], sample_period_secs: f64) -> Self {
        Self {
            calibrations: specs.iter().map(|s| s.calibration.clone()).collect(),
            conditioner: SignalConditioner::with_cutoffs(
                specs.iter().map(|s| s.cutoff_secs).collect(),
            ),
            sample_period_secs,
            last_read: None,
        }
    }
    /// Feeds one line. On error nothing changes: the conditioner holds and
    /// the read time stays where it was.
    pub fn ingest_line(&mut self, line: &str, at: Timestamp) -> Result<(), TelemetryError> {
        let counts = line
            .trim()
            .split(',')
            .map(|field| field.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TelemetryError::Decode(format!("{line:?}: {e}")))?;
        if counts.len() != self.calibrations.len() {
            return Err(TelemetryError::Decode(format!(
                "expected {} fields, got {} in {line:?}",
                self.calibrations.len(),
                counts.len()
            )));
        }
        for (channel, (raw, calibration)) in counts.iter().zip(&self.calibrations).enumerate() {
            let value = calibration.apply(*raw);
            self.conditioner
                .filter(channel, value, self.sample_period_secs);
        }
        self.last_read = Some(at);
        Ok(())
    }
    pub fn values(&self) -> Vec<f64> {
        (0..self.calibrations.len())
            .map(|channel| self.conditioner.hold(channel))
            .collect()
    }
    pub fn last_read(&self) -> Option<Timestamp> {
        self.last_read
    }
}
/// Arduino-style ADC receiver on a serial port.
pub struct SerialAdcSource {
    name: String,
    port_name: String,
    baud_rate: u32,
    channels: Vec<Channel>,
    decoder: AdcDecoder,
    reader: Option<BufReader<Box<dyn serialport::SerialPort>>>,
    pending: String,
    opened_at: Timestamp,
}
impl SerialAdcSource {
    pub fn open(
        name: impl Into<String>,
        port_name: &str,
        baud_rate: u32,
        specs: &[AdcChannelSpec],
        sample_period_secs: f64,
    ) -> Result<Self, TelemetryError> {
        if specs.is_empty() {
            return Err(TelemetryError::InvalidConfig(
                "serial ADC source needs at least one channel".into(),
            ));
        }
        let mut source = Self {
            name: name.into(),
            port_name: port_name.to_owned(),
            baud_rate,
            channels: specs
                .iter()
                .enumerate()
                .map(|(idx, spec)| Channel::new(idx, spec.name.clone(), spec.unit.clone()))
                .collect(),
            decoder: AdcDecoder::new(specs, sample_period_secs),
            reader: None,
            pending: String::new(),
            opened_at: Local::now(),
        };
        source.reconnect()?;
        Ok(source)
    }
    fn reconnect(&mut self) -> Result<(), TelemetryError> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(StdDuration::from_millis(100))
            .open()?;
        port.clear(serialport::ClearBuffer::All)?;
        self.reader = Some(BufReader::new(port));
        self.pending.clear();
        Ok(())
    }
    /// Drains whatever complete lines are waiting on the port.
    fn drain(&mut self) -> Result<(), TelemetryError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(());
        };
        while !reader.buffer().is_empty() || reader.get_ref().bytes_to_read()? > 0 {
            match reader.read_line(&mut self.pending) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
            if !self.pending.ends_with('\n') {
                break;
            }
            let line = std::mem::take(&mut self.pending);
            if let Err(e) = self.decoder.ingest_line(&line, Local::now()) {
                warn!("{}: {e}", self.name);
            }
        }
        Ok(())
    }
}
impl DataSource for SerialAdcSource {
    fn name(&self) -> &str {
        &self.name
    }
    fn channels(&self) -> &[Channel] {
        &self.channels
    }
    fn poll(&mut self) -> SourceReading {
        if self.reader.is_none() {
            if let Err(e) = self.reconnect() {
                debug!("{}: reconnect failed: {e}", self.name);
                return SourceReading::zeros(
                    self.channels.len(),
                    Local::now(),
                    SourceStatus::ConnectionError,
                );
            }
        }
        if let Err(e) = self.drain() {
            warn!("{}: serial read failed: {e}", self.name);
            self.reader = None;
            return SourceReading::zeros(
                self.channels.len(),
                Local::now(),
                SourceStatus::ConnectionError,
            );
        }
        // Before the first good line the open time stands in, so a silent
        // device turns stale after the usual grace period.
        let timestamp = self.decoder.last_read().unwrap_or(self.opened_at);
        SourceReading::ok(self.decoder.values(), timestamp)
    }
}
