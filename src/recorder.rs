// src/recorder.rs
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime};
use log::debug;

use crate::drivers::TelemetryError;
use crate::types::Timestamp;

const LINE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Gap between consecutive log lines above which the log viewer treats the
/// record as broken.
pub const CONTINUITY_GAP_MINUTES: i64 = 5;

/// One value in a log line, printed as "12.34 psi".
#[derive(Clone, Debug, PartialEq)]
pub struct LogField {
    pub value: f64,
    pub unit: String,
}

impl LogField {
    pub fn new(value: f64, unit: impl Into<String>) -> Self {
        Self {
            value,
            unit: unit.into(),
        }
    }
}

/// Append-only snapshot log.
pub trait PersistentLog {
    fn append(&mut self, timestamp: Timestamp, fields: &[LogField]) -> Result<(), TelemetryError>;
}

/// Writes one text file per day under `root/YYYY/MM/DD.txt`.
pub struct DailyLog {
    root: PathBuf,
}

impl DailyLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, timestamp: Timestamp) -> PathBuf {
        self.root
            .join(timestamp.format("%Y").to_string())
            .join(timestamp.format("%m").to_string())
            .join(format!("{}.txt", timestamp.format("%d")))
    }
}

impl PersistentLog for DailyLog {
    fn append(&mut self, timestamp: Timestamp, fields: &[LogField]) -> Result<(), TelemetryError> {
        let path = self.path_for(timestamp);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut w = BufWriter::new(file);
        w.write_all(format_line(timestamp, fields).as_bytes())?;
        w.flush()?;
        debug!("log line appended to {}", path.display());
        Ok(())
    }
}

pub fn format_line(timestamp: Timestamp, fields: &[LogField]) -> String {
    let values: Vec<String> = fields
        .iter()
        .map(|field| {
            if field.unit.is_empty() {
                format!("{:.2}", field.value)
            } else {
                format!("{:.2} {}", field.value, field.unit)
            }
        })
        .collect();
    format!("{}: {}\n", timestamp.format(LINE_TIME_FORMAT), values.join(", "))
}

// 读取日志 (日志查看器使用)
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub timestamp: NaiveDateTime,
    pub fields: Vec<LogField>,
}

pub fn parse_line(line: &str) -> Result<LogRecord, TelemetryError> {
    let line = line.trim_end();
    // The timestamp itself contains colons, so split at the fixed width.
    let stamp = line
        .get(..19)
        .ok_or_else(|| TelemetryError::Decode(format!("log line too short: {line:?}")))?;
    let timestamp = NaiveDateTime::parse_from_str(stamp, LINE_TIME_FORMAT)
        .map_err(|e| TelemetryError::Decode(format!("bad log timestamp {stamp:?}: {e}")))?;
    let rest = line[19..]
        .strip_prefix(':')
        .ok_or_else(|| TelemetryError::Decode(format!("missing separator: {line:?}")))?;
    let fields = rest
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (number, unit) = part.split_once(' ').unwrap_or((part, ""));
            number
                .parse::<f64>()
                .map(|value| LogField::new(value, unit.trim()))
                .map_err(|e| TelemetryError::Decode(format!("bad log value {part:?}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LogRecord { timestamp, fields })
}

/// Reads every parseable line of a log file; malformed lines are skipped.
pub fn read_log(path: &Path) -> Result<Vec<LogRecord>, TelemetryError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok(record) => records.push(record),
            Err(e) => debug!("{}: {e}", path.display()),
        }
    }
    Ok(records)
}

/// First pair of consecutive records further apart than `max_gap`.
pub fn find_gap(records: &[LogRecord], max_gap: Duration) -> Option<(NaiveDateTime, NaiveDateTime)> {
    records
        .windows(2)
        .map(|pair| (pair[0].timestamp, pair[1].timestamp))
        .find(|(before, after)| *after - *before > max_gap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};

    fn at(h: u32, m: u32, s: u32) -> Timestamp {
        Local.with_ymd_and_hms(2024, 10, 21, h, m, s).unwrap()
    }

    #[test]
    fn lines_use_two_decimals_and_units() {
        let line = format_line(
            at(19, 10, 16),
            &[LogField::new(0.0, "V"), LogField::new(12.346, "psi"), LogField::new(-1.0, "")],
        );
        assert_eq!(line, "2024-10-21 19:10:16: 0.00 V, 12.35 psi, -1.00\n");
    }

    #[test]
    fn appends_into_dated_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = DailyLog::new(dir.path());
        log.append(at(19, 10, 0), &[LogField::new(1.0, "K")]).unwrap();
        log.append(at(19, 11, 0), &[LogField::new(2.0, "K")]).unwrap();
        let path = dir.path().join("2024").join("10").join("21.txt");
        assert_eq!(log.path_for(at(0, 0, 0)), path);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "2024-10-21 19:10:00: 1.00 K\n2024-10-21 19:11:00: 2.00 K\n"
        );
        let records = read_log(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].fields, vec![LogField::new(2.0, "K")]);
    }

    #[test]
    fn parses_flow_temperature_line() {
        let record = parse_line("2024-10-21 19:10:16: 1.20 L/min, 0.40 L/min, 4.21 K").unwrap();
        assert_eq!(record.timestamp, at(19, 10, 16).naive_local());
        assert_eq!(record.fields[0], LogField::new(1.2, "L/min"));
        assert_eq!(record.fields[2], LogField::new(4.21, "K"));
        assert!(parse_line("garbage").is_err());
        assert!(parse_line("2024-10-21 19:10:16: abc psi").is_err());
    }

    #[test]
    fn reports_first_gap_over_threshold() {
        let records: Vec<LogRecord> = [(19, 0), (19, 1), (19, 5), (19, 11), (19, 30)]
            .iter()
            .map(|&(h, m)| LogRecord {
                timestamp: at(h, m, 0).naive_local(),
                fields: Vec::new(),
            })
            .collect();
        let gap = find_gap(&records, Duration::minutes(CONTINUITY_GAP_MINUTES)).unwrap();
        assert_eq!(gap, (at(19, 5, 0).naive_local(), at(19, 11, 0).naive_local()));
        assert_eq!(find_gap(&records[..3], Duration::minutes(CONTINUITY_GAP_MINUTES)), None);
    }
}
