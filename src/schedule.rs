// src/schedule.rs
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::drivers::TelemetryError;

pub const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];
const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("schedule file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("schedule record {index} is malformed: {reason}")]
    MalformedRecord { index: usize, reason: String },
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// One schedule row exactly as persisted. Only the structure is checked on
/// load; ranges and names are checked each time the row is evaluated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub day: String,
    pub hour: i64,
    pub minute: i64,
    pub channel: String,
    pub action: String,
    pub number: Value,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Action {
    On,
    Off,
    SetPoint(f64),
}

/// A validated schedule row.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleEntry {
    pub day: Weekday,
    pub hour: u32,
    pub minute: u32,
    pub column: usize,
    pub action: Action,
}

impl ScheduleEntry {
    pub fn minute_of_week(&self) -> u32 {
        self.day.num_days_from_monday() * MINUTES_PER_DAY + self.hour * 60 + self.minute
    }

    pub fn matches(&self, now: NaiveDateTime) -> bool {
        self.day == now.weekday() && self.hour == now.hour() && self.minute == now.minute()
    }
}

pub fn parse_day(name: &str) -> Option<Weekday> {
    let idx = DAY_NAMES.iter().position(|d| *d == name)?;
    Some(WEEKDAYS[idx])
}

impl ScheduleRecord {
    pub fn new(day: &str, hour: i64, minute: i64, channel: &str, action: &str, number: Value) -> Self {
        Self {
            day: day.into(),
            hour,
            minute,
            channel: channel.into(),
            action: action.into(),
            number,
        }
    }

    /// Resolves the row against the controller's column labels.
    pub fn validate(&self, columns: &[String]) -> Result<ScheduleEntry, ScheduleError> {
        let invalid = |field: &'static str, value: String| ScheduleError::InvalidField { field, value };
        let day = parse_day(&self.day).ok_or_else(|| invalid("day", self.day.clone()))?;
        let hour = u32::try_from(self.hour)
            .ok()
            .filter(|h| *h < 24)
            .ok_or_else(|| invalid("hour", self.hour.to_string()))?;
        let minute = u32::try_from(self.minute)
            .ok()
            .filter(|m| *m < 60)
            .ok_or_else(|| invalid("minute", self.minute.to_string()))?;
        let column = columns
            .iter()
            .position(|c| *c == self.channel)
            .ok_or_else(|| invalid("channel", self.channel.clone()))?;
        let action = match self.action.as_str() {
            "On" => Action::On,
            "Off" => Action::Off,
            a if a == "Setpoint" || a.starts_with("Setpoint ") => {
                let value = match &self.number {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                };
                Action::SetPoint(value.ok_or_else(|| invalid("setpoint", self.number.to_string()))?)
            }
            other => return Err(invalid("action", other.to_owned())),
        };
        Ok(ScheduleEntry {
            day,
            hour,
            minute,
            column,
            action,
        })
    }
}

/// Persistence for schedule rows.
pub trait ScheduleStore {
    fn load(&self) -> Result<Vec<ScheduleRecord>, ScheduleError>;
    fn save(&self, records: &[ScheduleRecord]) -> Result<(), ScheduleError>;
}

/// Flat JSON list of records on disk.
#[derive(Clone, Debug)]
pub struct JsonScheduleFile {
    path: PathBuf,
}

impl JsonScheduleFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScheduleStore for JsonScheduleFile {
    /// All or nothing: the first structurally broken record aborts the
    /// whole import and nothing is returned.
    fn load(&self) -> Result<Vec<ScheduleRecord>, ScheduleError> {
        let text = fs::read_to_string(&self.path)?;
        let raw: Vec<Value> = serde_json::from_str(&text)?;
        raw.into_iter()
            .enumerate()
            .map(|(index, value)| {
                serde_json::from_value(value).map_err(|e| ScheduleError::MalformedRecord {
                    index,
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    fn save(&self, records: &[ScheduleRecord]) -> Result<(), ScheduleError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(&self.path, serde_json::to_string_pretty(records)?)?;
        Ok(())
    }
}

/// Every record that would be skipped at evaluation time, with the reason.
pub fn validate_all(records: &[ScheduleRecord], columns: &[String]) -> Vec<(usize, ScheduleError)> {
    records
        .iter()
        .enumerate()
        .filter_map(|(idx, record)| record.validate(columns).err().map(|e| (idx, e)))
        .collect()
}

pub fn minute_of_week(now: NaiveDateTime) -> u32 {
    now.weekday().num_days_from_monday() * MINUTES_PER_DAY + now.hour() * 60 + now.minute()
}

/// Something scheduled actions can be applied to.
pub trait ScheduleTarget {
    /// Returns whether the entry changed anything.
    fn apply(&mut self, entry: &ScheduleEntry) -> Result<bool, TelemetryError>;
}

/// Fires each matching entry once per matching minute.
///
/// The guard is the minute-of-week of the previous tick, so the host must
/// tick at least once a minute; a slower host can miss an entry and there is
/// no catch-up.
#[derive(Debug)]
pub struct DeviceActionScheduler {
    last_handled_minute: u32,
}

impl DeviceActionScheduler {
    /// Starts guarded at the current minute: an entry for this very minute
    /// does not fire.
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            last_handled_minute: minute_of_week(now),
        }
    }

    pub fn last_handled_minute(&self) -> u32 {
        self.last_handled_minute
    }

    /// Evaluates every record against `now`. Returns how many fired.
    pub fn tick(
        &mut self,
        now: NaiveDateTime,
        records: &[ScheduleRecord],
        columns: &[String],
        target: &mut dyn ScheduleTarget,
    ) -> usize {
        let current = minute_of_week(now);
        let mut fired = 0;
        if current != self.last_handled_minute {
            for (idx, record) in records.iter().enumerate() {
                let entry = match record.validate(columns) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("schedule record {idx} skipped: {e}");
                        continue;
                    }
                };
                if !entry.matches(now) {
                    continue;
                }
                info!("schedule record {idx} fires: {:?} on column {}", entry.action, entry.column);
                match target.apply(&entry) {
                    Ok(_) => fired += 1,
                    Err(e) => warn!("schedule record {idx} failed: {e}"),
                }
            }
        }
        self.last_handled_minute = current;
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn columns() -> Vec<String> {
        vec!["Tip".into(), "Shield".into(), "Bypass".into()]
    }

    // 2024-01-01 is a Monday.
    fn monday(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[derive(Default)]
    struct Recording {
        applied: Vec<ScheduleEntry>,
    }

    impl ScheduleTarget for Recording {
        fn apply(&mut self, entry: &ScheduleEntry) -> Result<bool, TelemetryError> {
            self.applied.push(entry.clone());
            Ok(true)
        }
    }

    #[test]
    fn fires_exactly_once_in_the_matching_minute() {
        let records = vec![ScheduleRecord::new("Mon", 9, 0, "Tip", "On", json!(""))];
        let mut scheduler = DeviceActionScheduler::new(monday(8, 59, 50));
        let mut target = Recording::default();
        let fired: Vec<usize> = [monday(8, 59, 50), monday(9, 0, 10), monday(9, 0, 40), monday(9, 1, 5)]
            .into_iter()
            .map(|now| scheduler.tick(now, &records, &columns(), &mut target))
            .collect();
        assert_eq!(fired, vec![0, 1, 0, 0]);
        assert_eq!(target.applied[0].action, Action::On);
        assert_eq!(target.applied[0].column, 0);
        assert_eq!(scheduler.last_handled_minute(), 541);
    }

    #[test]
    fn starting_inside_the_minute_does_not_fire() {
        let records = vec![ScheduleRecord::new("Mon", 9, 0, "Tip", "Off", json!(""))];
        let mut scheduler = DeviceActionScheduler::new(monday(9, 0, 5));
        let mut target = Recording::default();
        assert_eq!(scheduler.tick(monday(9, 0, 30), &records, &columns(), &mut target), 0);
    }

    #[test]
    fn malformed_entries_are_skipped_not_removed() {
        let records = vec![
            ScheduleRecord::new("Funday", 9, 0, "Tip", "On", json!("")),
            ScheduleRecord::new("Mon", 25, 0, "Tip", "On", json!("")),
            ScheduleRecord::new("Mon", 9, 0, "Nozzle", "On", json!("")),
            ScheduleRecord::new("Mon", 9, 0, "Shield", "Setpoint", json!("abc")),
            ScheduleRecord::new("Mon", 9, 0, "Bypass", "Setpoint", json!(42)),
        ];
        let mut scheduler = DeviceActionScheduler::new(monday(8, 59, 0));
        let mut target = Recording::default();
        assert_eq!(scheduler.tick(monday(9, 0, 0), &records, &columns(), &mut target), 1);
        assert_eq!(target.applied[0].action, Action::SetPoint(42.0));
        assert_eq!(target.applied[0].column, 2);
        let problems = validate_all(&records, &columns());
        let fields: Vec<&str> = problems
            .iter()
            .map(|(_, e)| match e {
                ScheduleError::InvalidField { field, .. } => *field,
                _ => "other",
            })
            .collect();
        assert_eq!(fields, vec!["day", "hour", "channel", "setpoint"]);
    }

    #[test]
    fn minute_of_week_counts_from_monday() {
        assert_eq!(minute_of_week(monday(0, 0, 0)), 0);
        assert_eq!(minute_of_week(monday(9, 0, 0)), 540);
        let sunday = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap().and_hms_opt(23, 59, 0).unwrap();
        assert_eq!(minute_of_week(sunday), 7 * 1440 - 1);
        let entry = ScheduleRecord::new("Sun", 23, 59, "Tip", "Off", json!(""))
            .validate(&columns())
            .unwrap();
        assert_eq!(entry.minute_of_week(), 7 * 1440 - 1);
        assert_eq!(parse_day("Wed"), Some(Weekday::Wed));
        assert_eq!(parse_day("wed"), None);
    }

    #[test]
    fn load_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonScheduleFile::new(dir.path().join("schedule.json"));
        let records = vec![
            ScheduleRecord::new("Mon", 9, 0, "Tip", "On", json!("")),
            ScheduleRecord::new("Tue", 18, 30, "Shield", "Setpoint", json!("12")),
        ];
        store.save(&records).unwrap();
        assert_eq!(store.load().unwrap(), records);

        std::fs::write(
            store.path(),
            r#"[{"day":"Mon","hour":9,"minute":0,"channel":"Tip","action":"On","number":""},
                {"day":"Mon","hour":9,"channel":"Tip","action":"On","number":""}]"#,
        )
        .unwrap();
        match store.load() {
            Err(ScheduleError::MalformedRecord { index, reason }) => {
                assert_eq!(index, 1);
                assert!(reason.contains("minute"));
            }
            other => panic!("expected malformed record, got {other:?}"),
        }

        std::fs::write(store.path(), "not json").unwrap();
        assert!(matches!(store.load(), Err(ScheduleError::Json(_))));
    }
}
