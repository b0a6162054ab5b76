// src/engine.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use log::{debug, error, info, warn};

use crate::cadence::{CadenceScheduler, CadenceSinks, TickReport};
use crate::config::{DashboardConfig, MfcConfig};
use crate::drivers::{settle_reading, DataSource, PlotRenderer, PlotStyle, SourceReading};
use crate::group::{ChannelGroup, SharedGroup};
use crate::mfc::{MfcController, MfcDevice, SerialMfc, SimulatedMfc};
use crate::notify::{LogNotifier, Notifier, SpoolNotifier};
use crate::recorder::{find_gap, read_log, DailyLog, CONTINUITY_GAP_MINUTES};
use crate::schedule::{DeviceActionScheduler, JsonScheduleFile, ScheduleRecord, ScheduleStore};
use crate::types::{SourceStatus, Timestamp};

/// A group and the source that feeds it. Disabled groups have no source.
pub struct FetchSlot {
    pub group: SharedGroup,
    pub source: Option<Box<dyn DataSource>>,
}

/// Builds one group per configured source, seeded at `now`. Sources are
/// only opened when enabled.
pub fn build_slots(config: &DashboardConfig, now: Timestamp) -> Result<Vec<FetchSlot>> {
    config
        .sources
        .iter()
        .map(|cfg| -> Result<FetchSlot> {
            let group = ChannelGroup::new(cfg.name.clone(), cfg.channels(), cfg.enabled, now).shared();
            let source = if cfg.enabled {
                Some(cfg.build().with_context(|| format!("opening source {}", cfg.name))?)
            } else {
                None
            };
            Ok(FetchSlot { group, source })
        })
        .collect()
}

/// Polls every slot once and stores the settled readings.
pub fn fetch_once(slots: &mut [FetchSlot], stale_after: chrono::Duration) {
    for slot in slots.iter_mut() {
        let width = slot.group.channels().len();
        let now = Local::now();
        let reading = match slot.source.as_mut() {
            Some(source) if slot.group.is_enabled() => settle_reading(source.poll(), width, now, stale_after),
            _ => SourceReading::zeros(width, now, SourceStatus::Off),
        };
        if !reading.status.is_healthy() && reading.status != SourceStatus::Off {
            warn!("{}: {}", slot.group.name(), reading.status.describe());
        }
        if let Err(e) = slot.group.record(reading) {
            warn!("{}: {e}", slot.group.name());
        }
    }
}

// ============================================================
// 采集线程
// ============================================================
pub fn spawn_fetch_thread(
    mut slots: Vec<FetchSlot>,
    period: Duration,
    stale_after: chrono::Duration,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        info!("fetch thread started, {} source(s)", slots.len());
        loop {
            let started = Instant::now();
            fetch_once(&mut slots, stale_after);
            // 补偿本轮耗时
            thread::sleep(period.saturating_sub(started.elapsed()));
        }
    })
}

fn notifier_for(config: &DashboardConfig) -> Box<dyn Notifier> {
    match &config.alert_spool {
        Some(path) => Box::new(SpoolNotifier::new(path.clone())),
        None => Box::new(LogNotifier),
    }
}

/// Runs the dashboard: the fetch thread plus the cadence loop on the
/// calling thread. With `once` it fetches, draws and logs a single time.
pub fn run_dashboard(config: &DashboardConfig, once: bool) -> Result<()> {
    config.validate().context("invalid dashboard config")?;
    let mut slots = build_slots(config, Local::now())?;
    let groups: Vec<SharedGroup> = slots.iter().map(|s| s.group.clone()).collect();

    let mut renderer = PlotRenderer::new(config.chart_path.clone(), PlotStyle::default());
    let mut log = DailyLog::new(config.log_root.clone());
    let mut notifier = notifier_for(config);
    let mut cadence = CadenceScheduler::new(config.tick(), config.catch_window(), config.display)
        .with_rules(config.thresholds.clone());

    if once {
        fetch_once(&mut slots, config.stale_after());
        let mut sinks = CadenceSinks {
            renderer: &mut renderer,
            log: &mut log,
            notifier: notifier.as_mut(),
        };
        let report = cadence.flush(Local::now(), &groups, &mut sinks);
        info!("single pass: rendered={} logged={}", report.rendered, report.logged);
        return Ok(());
    }

    spawn_fetch_thread(slots, config.fetch_period(), config.stale_after());
    info!(
        "dashboard running: {} group(s), display {}",
        groups.len(),
        cadence.display().label()
    );
    loop {
        let started = Instant::now();
        let mut sinks = CadenceSinks {
            renderer: &mut renderer,
            log: &mut log,
            notifier: notifier.as_mut(),
        };
        let report: TickReport = cadence.tick(Local::now(), &groups, &mut sinks);
        if !report.closed.is_empty() {
            debug!("closed {:?}", report.closed);
        }
        thread::sleep(cadence.next_delay(started.elapsed()));
    }
}

// ============================================================
// MFC 守护进程
// ============================================================

/// Controller plus schedule, advanced one tick at a time.
pub struct MfcDaemon<D: MfcDevice> {
    controller: MfcController<D>,
    scheduler: DeviceActionScheduler,
    schedule: JsonScheduleFile,
    records: Vec<ScheduleRecord>,
    loaded_at: Option<SystemTime>,
}

impl<D: MfcDevice> MfcDaemon<D> {
    pub fn new(controller: MfcController<D>, schedule_path: PathBuf, now: NaiveDateTime) -> Self {
        Self {
            controller,
            scheduler: DeviceActionScheduler::new(now),
            schedule: JsonScheduleFile::new(schedule_path),
            records: Vec::new(),
            loaded_at: None,
        }
    }

    pub fn controller(&self) -> &MfcController<D> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut MfcController<D> {
        &mut self.controller
    }

    pub fn records(&self) -> &[ScheduleRecord] {
        &self.records
    }

    /// Re-imports the schedule when the file changed. A failed import keeps
    /// the previous schedule.
    pub fn refresh_schedule(&mut self) {
        let modified = match fs::metadata(self.schedule.path()).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return,
        };
        if self.loaded_at == Some(modified) {
            return;
        }
        self.loaded_at = Some(modified);
        match self.schedule.load() {
            Ok(records) => {
                info!("{} schedule record(s) loaded", records.len());
                self.records = records;
            }
            Err(e) => error!("schedule import rejected, keeping previous: {e}"),
        }
    }

    /// One daemon tick: schedule, then flow read-back. Returns how many
    /// schedule entries fired.
    pub fn step(&mut self, now: NaiveDateTime) -> usize {
        self.refresh_schedule();
        let labels = self.controller.labels();
        let fired = self
            .scheduler
            .tick(now, &self.records, &labels, &mut self.controller);
        match self.controller.read_flows() {
            Ok(flows) => debug!("flows {:?}", flows),
            Err(e) => warn!("flow read failed: {e}"),
        }
        fired
    }
}

fn open_device(config: &MfcConfig) -> Result<Box<dyn MfcDevice>> {
    Ok(match &config.port {
        Some(port) => Box::new(
            SerialMfc::open(port, config.baud).with_context(|| format!("opening MFC on {port}"))?,
        ),
        None => {
            warn!("no MFC port configured, using the simulator");
            Box::new(SimulatedMfc::new())
        }
    })
}

pub fn run_mfc(config: &MfcConfig) -> Result<()> {
    config.validate().context("invalid mfc config")?;
    let mut controller = MfcController::new(open_device(config)?, &config.columns);
    for (column, &channel) in config.bindings.iter().enumerate() {
        controller
            .bind(column, channel)
            .with_context(|| format!("binding column {column}"))?;
    }
    let mut daemon = MfcDaemon::new(controller, config.schedule_path.clone(), Local::now().naive_local());
    let tick = Duration::from_millis(config.tick_ms);
    info!("mfc daemon running, schedule {}", config.schedule_path.display());
    loop {
        let started = Instant::now();
        daemon.step(Local::now().naive_local());
        thread::sleep(tick.saturating_sub(started.elapsed()));
    }
}

/// Loads a schedule strictly and lists every record that would be skipped.
pub fn check_schedule(path: &Path, columns: &[String]) -> Result<Vec<String>> {
    let records = JsonScheduleFile::new(path)
        .load()
        .with_context(|| format!("importing {}", path.display()))?;
    Ok(crate::schedule::validate_all(&records, columns)
        .into_iter()
        .map(|(idx, e)| format!("record {idx}: {e}"))
        .collect())
}

/// Summarises daily log files and flags the first break in continuity of
/// each one.
pub fn check_log(paths: &[PathBuf]) -> Result<Vec<String>> {
    let max_gap = chrono::Duration::minutes(CONTINUITY_GAP_MINUTES);
    let mut lines = Vec::new();
    for path in paths {
        let records = read_log(path).with_context(|| format!("reading {}", path.display()))?;
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            lines.push(format!("{}: empty", path.display()));
            continue;
        };
        lines.push(format!(
            "{}: {} line(s), {} to {}",
            path.display(),
            records.len(),
            first.timestamp,
            last.timestamp
        ));
        if let Some((before, after)) = find_gap(&records, max_gap) {
            lines.push(format!("{}: gap between {before} and {after}", path.display()));
        }
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use serde_json::json;

    use crate::drivers::ManualSource;
    use crate::mfc::ControlState;
    use crate::types::{Channel, Resolution};

    fn channels() -> Vec<Channel> {
        vec![Channel::new(0, "Tip", "L/min"), Channel::new(1, "Shield", "L/min")]
    }

    #[test]
    fn fetch_once_settles_and_records() {
        let now = Local::now();
        let live = ChannelGroup::new("RFM", channels(), true, now).shared();
        let off = ChannelGroup::new("DRC91C", channels(), false, now).shared();
        let source = ManualSource::new(
            "RFM",
            channels(),
            vec![SourceReading::ok(vec![1.5, 2.5], Local::now())],
        );
        let mut slots = vec![
            FetchSlot {
                group: live.clone(),
                source: Some(Box::new(source)),
            },
            FetchSlot {
                group: off.clone(),
                source: None,
            },
        ];
        fetch_once(&mut slots, ChronoDuration::seconds(5));
        assert_eq!(live.last_sample().unwrap().values, vec![1.5, 2.5]);
        assert!(live.status().is_healthy());
        assert_eq!(off.status(), SourceStatus::Off);
        assert_eq!(off.last_sample().unwrap().values, vec![0.0, 0.0]);
        assert_eq!(off.with_store_read(|s| s.get(Resolution::Native).len()), 2);

        // Script exhausted: the next poll is a connection error with zeros.
        fetch_once(&mut slots, ChronoDuration::seconds(5));
        assert_eq!(live.status(), SourceStatus::ConnectionError);
        assert_eq!(live.last_sample().unwrap().values, vec![0.0, 0.0]);
    }

    #[derive(Default)]
    struct Counting {
        renders: usize,
        lines: usize,
    }

    impl crate::drivers::Renderer for Counting {
        fn render(&mut self, _frame: &crate::drivers::ChartFrame) -> Result<(), crate::drivers::TelemetryError> {
            self.renders += 1;
            Ok(())
        }
    }

    impl crate::recorder::PersistentLog for Counting {
        fn append(
            &mut self,
            _timestamp: Timestamp,
            _fields: &[crate::recorder::LogField],
        ) -> Result<(), crate::drivers::TelemetryError> {
            self.lines += 1;
            Ok(())
        }
    }

    #[test]
    fn delayed_source_data_is_stamped_at_poll_time() {
        let started = Local::now();
        let group = ChannelGroup::new("MKS247C", channels(), true, started - ChronoDuration::minutes(1)).shared();
        let source = ManualSource::new(
            "MKS247C",
            channels(),
            vec![
                SourceReading::ok(vec![1.0, 2.0], started - ChronoDuration::milliseconds(800)),
                SourceReading::zeros(2, started, SourceStatus::Http(500)),
                SourceReading::ok(vec![3.0, 4.0], started - ChronoDuration::seconds(3)),
            ],
        );
        let mut slots = vec![FetchSlot {
            group: group.clone(),
            source: Some(Box::new(source)),
        }];
        let groups = vec![group.clone()];
        let mut cadence = CadenceScheduler::new(
            Duration::from_millis(200),
            ChronoDuration::milliseconds(200),
            Resolution::Native,
        );
        let mut renderer = Counting::default();
        let mut log = Counting::default();
        let mut notifier = LogNotifier;

        fetch_once(&mut slots, ChronoDuration::seconds(5));
        let polled = group.last_timestamp(Resolution::Native).unwrap();
        assert!(polled >= started);
        let mut sinks = CadenceSinks {
            renderer: &mut renderer,
            log: &mut log,
            notifier: &mut notifier,
        };
        let report = cadence.tick(Local::now(), &groups, &mut sinks);
        assert!(report.rendered);
        assert_eq!(renderer.renders, 1);
        assert_eq!(log.lines, 1);

        fetch_once(&mut slots, ChronoDuration::seconds(5));
        fetch_once(&mut slots, ChronoDuration::seconds(5));
        assert_eq!(group.last_sample().unwrap().values, vec![3.0, 4.0]);
        let stamps: Vec<Timestamp> = group.with_store_read(|s| s.snapshot(Resolution::Native).timestamps);
        assert_eq!(stamps.len(), 4);
        assert!(stamps.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn single_pass_dashboard_writes_chart_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DashboardConfig::default();
        for source in &mut config.sources {
            source.enabled = false;
        }
        config.log_root = dir.path().join("logs");
        config.chart_path = dir.path().join("chart.png");
        run_dashboard(&config, true).unwrap();
        assert!(config.chart_path.exists());
        let today = Local::now();
        let log_file = DailyLog::new(config.log_root.clone()).path_for(today);
        let text = fs::read_to_string(log_file).unwrap();
        assert!(text.trim_end().ends_with("0.00 L/min, 0.00 K, 0.00 K"));
    }

    fn monday(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn daemon_runs_schedule_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        JsonScheduleFile::new(&path)
            .save(&[
                ScheduleRecord::new("Mon", 9, 0, "Tip", "On", json!("")),
                ScheduleRecord::new("Mon", 9, 1, "Tip", "Setpoint", json!(20)),
            ])
            .unwrap();
        let labels = vec!["Tip".to_string(), "Shield".to_string()];
        let mut controller = MfcController::new(SimulatedMfc::new(), &labels);
        controller.bind(0, 1).unwrap();
        let mut daemon = MfcDaemon::new(controller, path.clone(), monday(8, 59));
        assert_eq!(daemon.step(monday(9, 0)), 1);
        assert_eq!(daemon.records().len(), 2);
        assert_eq!(daemon.controller().state(0), Some(ControlState::On));
        assert_eq!(daemon.step(monday(9, 1)), 1);
        assert!((daemon.controller().last_flows()[0] - 2.0).abs() < 0.01);

        // A broken file is rejected and the old schedule stays.
        fs::write(&path, "[{\"day\": \"Mon\"}]").unwrap();
        let later = SystemTime::now() + Duration::from_secs(5);
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(later).unwrap();
        daemon.step(monday(9, 2));
        assert_eq!(daemon.records().len(), 2);
        daemon.controller_mut().reset().unwrap();
    }

    #[test]
    fn check_log_reports_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("21.txt");
        fs::write(
            &path,
            "2024-10-21 19:10:00: 1.00 K\n2024-10-21 19:11:00: 1.00 K\n2024-10-21 19:30:00: 2.00 K\n",
        )
        .unwrap();
        let empty = dir.path().join("22.txt");
        fs::write(&empty, "").unwrap();
        let lines = check_log(&[path, empty]).unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("3 line(s), 2024-10-21 19:10:00 to 2024-10-21 19:30:00"));
        assert!(lines[1].ends_with("gap between 2024-10-21 19:11:00 and 2024-10-21 19:30:00"));
        assert!(lines[2].ends_with("empty"));
        assert!(check_log(&[dir.path().join("nope.txt")]).is_err());
    }

    #[test]
    fn check_schedule_lists_problems() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        JsonScheduleFile::new(&path)
            .save(&[
                ScheduleRecord::new("Mon", 9, 0, "Tip", "On", json!("")),
                ScheduleRecord::new("Xyz", 9, 0, "Tip", "On", json!("")),
            ])
            .unwrap();
        let problems = check_schedule(&path, &["Tip".to_string()]).unwrap();
        assert_eq!(problems, vec!["record 1: invalid day: Xyz".to_string()]);
        assert!(check_schedule(&dir.path().join("missing.json"), &[]).is_err());
    }
}
