// src/mfc.rs
use std::io::{BufRead, BufReader, Read, Write};
use std::time::Duration;

use log::{debug, info};

use crate::drivers::TelemetryError;
use crate::schedule::{Action, ScheduleEntry, ScheduleTarget};

// 设备常量
pub const DEVICE_CHANNELS: usize = 4;
/// Largest setpoint the controller accepts.
pub const SETPOINT_MAX: u32 = 99;
/// Full-scale ADC count of the flow read-back.
pub const ADC_FULL_SCALE: f64 = 4095.0;
/// Flow at full scale, in L/min.
pub const FLOW_FULL_SCALE: f64 = SETPOINT_MAX as f64 / 10.0;

const CMD_ON: [&str; DEVICE_CHANNELS] = ["z", "x", "c", "v"];
const CMD_OFF: [&str; DEVICE_CHANNELS] = ["a", "s", "d", "f"];
const CMD_SETPOINT: [&str; DEVICE_CHANNELS] = ["q", "w", "e", "r"];
const CMD_RESET: &str = "B";

/// Physical controller channel, 1 to 4.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceChannel(u8);

impl DeviceChannel {
    pub fn from_number(number: i64) -> Option<Self> {
        (1..=DEVICE_CHANNELS as i64)
            .contains(&number)
            .then(|| DeviceChannel(number as u8))
    }

    pub fn number(self) -> u8 {
        self.0
    }

    fn slot(self) -> usize {
        usize::from(self.0 - 1)
    }
}

/// Command set of a multi-channel mass-flow controller.
pub trait MfcDevice: Send {
    fn write_setpoint(&mut self, channel: DeviceChannel, value: u32) -> Result<(), TelemetryError>;
    fn channel_on(&mut self, channel: DeviceChannel) -> Result<(), TelemetryError>;
    fn channel_off(&mut self, channel: DeviceChannel) -> Result<(), TelemetryError>;
    fn reset(&mut self) -> Result<(), TelemetryError>;
    /// Current flow of all four device channels in L/min.
    fn read_flows(&mut self) -> Result<[f64; DEVICE_CHANNELS], TelemetryError>;
}

impl<D: MfcDevice + ?Sized> MfcDevice for Box<D> {
    fn write_setpoint(&mut self, channel: DeviceChannel, value: u32) -> Result<(), TelemetryError> {
        (**self).write_setpoint(channel, value)
    }
    fn channel_on(&mut self, channel: DeviceChannel) -> Result<(), TelemetryError> {
        (**self).channel_on(channel)
    }
    fn channel_off(&mut self, channel: DeviceChannel) -> Result<(), TelemetryError> {
        (**self).channel_off(channel)
    }
    fn reset(&mut self) -> Result<(), TelemetryError> {
        (**self).reset()
    }
    fn read_flows(&mut self) -> Result<[f64; DEVICE_CHANNELS], TelemetryError> {
        (**self).read_flows()
    }
}

/// Decodes a read-back line: sixteen digits, four 4-digit ADC counts.
pub fn decode_flow_reply(line: &str) -> Result<[f64; DEVICE_CHANNELS], TelemetryError> {
    let line = line.trim();
    if line.len() != 4 * DEVICE_CHANNELS || !line.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TelemetryError::Decode(format!("bad flow reply {line:?}")));
    }
    let mut flows = [0.0; DEVICE_CHANNELS];
    for (slot, flow) in flows.iter_mut().enumerate() {
        let counts: f64 = line[slot * 4..slot * 4 + 4]
            .parse()
            .map_err(|e| TelemetryError::Decode(format!("bad flow reply {line:?}: {e}")))?;
        *flow = counts * FLOW_FULL_SCALE / ADC_FULL_SCALE;
    }
    Ok(flows)
}

/// Inverse of [`decode_flow_reply`] for a set of setpoints.
pub fn encode_flow_reply(setpoints: &[u32; DEVICE_CHANNELS]) -> String {
    setpoints
        .iter()
        .map(|sp| format!("{:04}", sp * ADC_FULL_SCALE as u32 / SETPOINT_MAX))
        .collect()
}

/// Longest reply line accepted from the controller, newline excluded.
const MAX_REPLY_LEN: usize = 64;

/// Reads one `\n`-terminated line of at most `limit` bytes. A trailing
/// `\r` is dropped.
fn read_reply_line<R: BufRead>(reader: &mut R, limit: usize) -> Result<String, TelemetryError> {
    let mut buf = Vec::new();
    reader.by_ref().take(limit as u64 + 1).read_until(b'\n', &mut buf)?;
    if buf.last() != Some(&b'\n') {
        return Err(TelemetryError::Decode(if buf.len() > limit {
            format!("reply longer than {limit} bytes")
        } else {
            format!("unterminated reply {:?}", String::from_utf8_lossy(&buf))
        }));
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Controller on a serial line. Every command is one `\n`-terminated line.
pub struct SerialMfc {
    port: BufReader<Box<dyn serialport::SerialPort>>,
}

impl SerialMfc {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, TelemetryError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_secs(1))
            .open()?;
        port.clear(serialport::ClearBuffer::All)?;
        Ok(Self {
            port: BufReader::new(port),
        })
    }

    /// Drops unread input, both on the port and in the local buffer.
    fn discard_input(&mut self) -> Result<(), TelemetryError> {
        self.port.get_mut().clear(serialport::ClearBuffer::Input)?;
        let buffered = self.port.buffer().len();
        self.port.consume(buffered);
        Ok(())
    }

    fn send(&mut self, line: &str) -> Result<(), TelemetryError> {
        self.discard_input()?;
        let port = self.port.get_mut();
        port.write_all(line.as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()?;
        debug!("mfc <- {line}");
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, TelemetryError> {
        read_reply_line(&mut self.port, MAX_REPLY_LEN)
    }
}

impl MfcDevice for SerialMfc {
    fn write_setpoint(&mut self, channel: DeviceChannel, value: u32) -> Result<(), TelemetryError> {
        self.send(&value.to_string())?;
        self.send(CMD_SETPOINT[channel.slot()])
    }

    fn channel_on(&mut self, channel: DeviceChannel) -> Result<(), TelemetryError> {
        self.send(CMD_ON[channel.slot()])
    }

    fn channel_off(&mut self, channel: DeviceChannel) -> Result<(), TelemetryError> {
        self.send(CMD_OFF[channel.slot()])
    }

    fn reset(&mut self) -> Result<(), TelemetryError> {
        self.send(CMD_RESET)
    }

    fn read_flows(&mut self) -> Result<[f64; DEVICE_CHANNELS], TelemetryError> {
        self.discard_input()?;
        // The first line after a clear is usually cut off.
        self.read_line()?;
        let mut last = String::new();
        for _ in 0..3 {
            last = self.read_line()?;
            if let Ok(flows) = decode_flow_reply(&last) {
                return Ok(flows);
            }
        }
        Err(TelemetryError::Decode(format!("no valid flow reply, last {last:?}")))
    }
}

/// Bench stand-in that reports each channel's setpoint as its flow.
#[derive(Debug, Default)]
pub struct SimulatedMfc {
    enabled: [bool; DEVICE_CHANNELS],
    setpoints: [u32; DEVICE_CHANNELS],
    commands: Vec<String>,
}

impl SimulatedMfc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_on(&self, channel: DeviceChannel) -> bool {
        self.enabled[channel.slot()]
    }

    pub fn setpoint(&self, channel: DeviceChannel) -> u32 {
        self.setpoints[channel.slot()]
    }

    /// The serial lines a real controller would have received.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }
}

impl MfcDevice for SimulatedMfc {
    fn write_setpoint(&mut self, channel: DeviceChannel, value: u32) -> Result<(), TelemetryError> {
        self.setpoints[channel.slot()] = value;
        self.commands.push(value.to_string());
        self.commands.push(CMD_SETPOINT[channel.slot()].to_owned());
        Ok(())
    }

    fn channel_on(&mut self, channel: DeviceChannel) -> Result<(), TelemetryError> {
        self.enabled[channel.slot()] = true;
        self.commands.push(CMD_ON[channel.slot()].to_owned());
        Ok(())
    }

    fn channel_off(&mut self, channel: DeviceChannel) -> Result<(), TelemetryError> {
        self.enabled[channel.slot()] = false;
        self.commands.push(CMD_OFF[channel.slot()].to_owned());
        Ok(())
    }

    fn reset(&mut self) -> Result<(), TelemetryError> {
        self.enabled = [false; DEVICE_CHANNELS];
        self.setpoints = [0; DEVICE_CHANNELS];
        self.commands.push(CMD_RESET.to_owned());
        Ok(())
    }

    fn read_flows(&mut self) -> Result<[f64; DEVICE_CHANNELS], TelemetryError> {
        decode_flow_reply(&encode_flow_reply(&self.setpoints))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlState {
    Off,
    SelectChannel,
    On,
}

/// One operator-facing control column.
#[derive(Clone, Debug)]
pub struct ControlColumn {
    pub label: String,
    pub binding: Option<DeviceChannel>,
    pub state: ControlState,
    /// Setpoint text as shown to the operator ("paused", "12", ...).
    pub shown: String,
}

const SHOWN_UNBOUND: &str = "Set Channel";
const SHOWN_PAUSED: &str = "paused";

impl ControlColumn {
    fn new(label: String) -> Self {
        Self {
            label,
            binding: None,
            state: ControlState::Off,
            shown: SHOWN_UNBOUND.to_owned(),
        }
    }
}

/// Per-column on/off/setpoint state machine in front of an [`MfcDevice`].
pub struct MfcController<D: MfcDevice> {
    device: D,
    columns: Vec<ControlColumn>,
    flows: Vec<f64>,
}

impl<D: MfcDevice> MfcController<D> {
    pub fn new(device: D, labels: &[String]) -> Self {
        Self {
            device,
            columns: labels.iter().cloned().map(ControlColumn::new).collect(),
            flows: vec![0.0; labels.len()],
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn columns(&self) -> &[ControlColumn] {
        &self.columns
    }

    pub fn labels(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.label.clone()).collect()
    }

    pub fn state(&self, column: usize) -> Option<ControlState> {
        self.columns.get(column).map(|c| c.state)
    }

    fn column_mut(&mut self, column: usize) -> Result<&mut ControlColumn, TelemetryError> {
        self.columns
            .get_mut(column)
            .ok_or(TelemetryError::UnknownColumn(column))
    }

    /// Operator switch. Device commands go out first; if one fails the
    /// column keeps its previous state.
    pub fn toggle(&mut self, column: usize) -> Result<ControlState, TelemetryError> {
        let col = self.column_mut(column)?;
        let (state, binding) = (col.state, col.binding);
        let next = match (state, binding) {
            (ControlState::On, Some(channel)) => {
                self.device.write_setpoint(channel, 0)?;
                self.device.channel_off(channel)?;
                ControlState::Off
            }
            (ControlState::On, None) | (ControlState::SelectChannel, _) => ControlState::Off,
            (ControlState::Off, None) => ControlState::SelectChannel,
            (ControlState::Off, Some(channel)) => {
                self.device.write_setpoint(channel, 0)?;
                self.device.channel_on(channel)?;
                ControlState::On
            }
        };
        let col = self.column_mut(column)?;
        col.state = next;
        match next {
            ControlState::On => col.shown = "0".to_owned(),
            ControlState::Off if col.binding.is_some() => col.shown = SHOWN_PAUSED.to_owned(),
            _ => {}
        }
        info!("{} column -> {:?}", col.label, next);
        Ok(next)
    }

    /// Sends a setpoint, clamped to the device range. Ignored unless the
    /// column is On or the value is not finite. Returns the value sent.
    pub fn set_setpoint(&mut self, column: usize, value: f64) -> Result<Option<u32>, TelemetryError> {
        let col = self.column_mut(column)?;
        let (ControlState::On, Some(channel)) = (col.state, col.binding) else {
            return Ok(None);
        };
        if !value.is_finite() {
            return Ok(None);
        }
        let clamped = value.round().clamp(0.0, SETPOINT_MAX as f64) as u32;
        self.device.write_setpoint(channel, clamped)?;
        let col = self.column_mut(column)?;
        col.shown = clamped.to_string();
        info!("{} setpoint -> {clamped}", col.label);
        Ok(Some(clamped))
    }

    /// Binds a device channel (1 to 4) while the column is Off; any other
    /// number unbinds. Returns whether the binding was accepted.
    pub fn bind(&mut self, column: usize, channel_number: i64) -> Result<bool, TelemetryError> {
        let col = self.column_mut(column)?;
        if col.state != ControlState::Off {
            return Ok(false);
        }
        col.binding = DeviceChannel::from_number(channel_number);
        col.shown = match col.binding {
            Some(_) => SHOWN_PAUSED.to_owned(),
            None => SHOWN_UNBOUND.to_owned(),
        };
        Ok(true)
    }

    /// All columns Off and unbound, then the device-level reset.
    pub fn reset(&mut self) -> Result<(), TelemetryError> {
        for col in &mut self.columns {
            *col = ControlColumn::new(std::mem::take(&mut col.label));
        }
        self.flows.iter_mut().for_each(|f| *f = 0.0);
        self.device.reset()
    }

    /// Reads the device and maps flows onto columns; unbound columns read 0.
    pub fn read_flows(&mut self) -> Result<&[f64], TelemetryError> {
        let device_flows = self.device.read_flows()?;
        for (flow, col) in self.flows.iter_mut().zip(&self.columns) {
            *flow = col.binding.map(|ch| device_flows[ch.slot()]).unwrap_or(0.0);
        }
        Ok(&self.flows)
    }

    pub fn last_flows(&self) -> &[f64] {
        &self.flows
    }
}

impl<D: MfcDevice> ScheduleTarget for MfcController<D> {
    fn apply(&mut self, entry: &ScheduleEntry) -> Result<bool, TelemetryError> {
        let col = self.column_mut(entry.column)?;
        if col.binding.is_none() {
            debug!("{} is unbound, scheduled {:?} skipped", col.label, entry.action);
            return Ok(false);
        }
        let state = col.state;
        match (entry.action, state) {
            (Action::On, ControlState::Off) | (Action::Off, ControlState::On) => {
                self.toggle(entry.column)?;
                Ok(true)
            }
            (Action::SetPoint(value), ControlState::On) => {
                Ok(self.set_setpoint(entry.column, value)?.is_some())
            }
            _ => Ok(false),
        }
    }
}
