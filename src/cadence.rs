// src/cadence.rs
use std::fmt;
use std::time::Duration as StdDuration;

use chrono::Duration;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::drivers::{ChartFrame, Renderer};
use crate::group::SharedGroup;
use crate::notify::Notifier;
use crate::recorder::PersistentLog;
use crate::types::{Resolution, Timestamp};

pub const DEFAULT_TICK_MS: u64 = 200;
pub const DEFAULT_CATCH_WINDOW_MS: i64 = 200;

const ALERT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Bound checked against the latest value of one channel.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    Max(f64),
    Min(f64),
    /// Exactly zero, which is what a dead transmitter reports.
    Zero,
}

impl Limit {
    pub fn violated_by(self, value: f64) -> bool {
        match self {
            Limit::Max(max) => value > max,
            Limit::Min(min) => value < min,
            Limit::Zero => value == 0.0,
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Max(v) => write!(f, "max {v:.2}"),
            Limit::Min(v) => write!(f, "min {v:.2}"),
            Limit::Zero => f.write_str("non-zero"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub group: String,
    pub channel: String,
    pub limit: Limit,
}

/// The three things a closed bucket can trigger.
pub struct CadenceSinks<'a> {
    pub renderer: &'a mut dyn Renderer,
    pub log: &'a mut dyn PersistentLog,
    pub notifier: &'a mut dyn Notifier,
}

/// What one tick did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    pub closed: Vec<Resolution>,
    pub rendered: bool,
    pub logged: bool,
    pub alerts: usize,
}

/// Detects bucket closures from the clock group's timestamps and fires the
/// render, log and alert actions at most once per closed bucket.
pub struct CadenceScheduler {
    tick: StdDuration,
    catch_window: Duration,
    display: Resolution,
    rules: Vec<ThresholdRule>,
    last_fired: [Option<Timestamp>; 4],
}

impl CadenceScheduler {
    pub fn new(tick: StdDuration, catch_window: Duration, display: Resolution) -> Self {
        Self {
            tick,
            catch_window,
            display,
            rules: Vec::new(),
            last_fired: [None; 4],
        }
    }

    pub fn with_rules(mut self, rules: Vec<ThresholdRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn display(&self) -> Resolution {
        self.display
    }

    pub fn set_display(&mut self, resolution: Resolution) {
        self.display = resolution;
    }

    /// Delay until the next tick given how long this one took.
    pub fn next_delay(&self, elapsed: StdDuration) -> StdDuration {
        self.tick.saturating_sub(elapsed)
    }

    /// One pass over all resolutions. The first group is the clock source.
    pub fn tick(&mut self, now: Timestamp, groups: &[SharedGroup], sinks: &mut CadenceSinks<'_>) -> TickReport {
        let mut report = TickReport::default();
        let Some(clock) = groups.first() else {
            return report;
        };
        for resolution in Resolution::ALL {
            let Some(bucket) = clock.last_timestamp(resolution) else {
                continue;
            };
            if now - bucket >= self.catch_window {
                continue;
            }
            let slot = &mut self.last_fired[resolution.index()];
            if *slot == Some(bucket) {
                continue;
            }
            *slot = Some(bucket);
            debug!("{} bucket closed at {bucket}", resolution.label());
            report.closed.push(resolution);

            if resolution == self.display {
                report.rendered = render(resolution, groups, sinks.renderer);
            }
            if resolution == Resolution::Minute {
                report.logged = append_log(bucket, groups, sinks.log);
            }
            if resolution == Resolution::TenMinute {
                report.alerts += alert_disconnected(now, groups, sinks.notifier);
                report.alerts += self.check_thresholds(now, groups, sinks.notifier);
            }
        }
        report
    }

    /// Renders the display resolution and logs the latest values right away,
    /// without waiting for a bucket to close. No alerts are sent.
    pub fn flush(&mut self, now: Timestamp, groups: &[SharedGroup], sinks: &mut CadenceSinks<'_>) -> TickReport {
        let mut report = TickReport::default();
        if groups.is_empty() {
            return report;
        }
        report.rendered = render(self.display, groups, sinks.renderer);
        let stamp = groups[0].last_timestamp(Resolution::Minute).unwrap_or(now);
        report.logged = append_log(stamp, groups, sinks.log);
        report
    }

    fn check_thresholds(&self, now: Timestamp, groups: &[SharedGroup], notifier: &mut dyn Notifier) -> usize {
        let date = now.format(ALERT_TIME_FORMAT);
        let mut sent = 0;
        for rule in &self.rules {
            let Some(group) = groups.iter().find(|g| g.name() == rule.group) else {
                warn!("threshold rule names unknown group {:?}", rule.group);
                continue;
            };
            if !group.is_enabled() {
                continue;
            }
            let Some(channel) = group.channels().iter().find(|c| c.name == rule.channel) else {
                warn!("threshold rule names unknown channel {:?}", rule.channel);
                continue;
            };
            let Some(value) = group
                .last_sample()
                .and_then(|s| s.values.get(channel.index).copied())
            else {
                continue;
            };
            if rule.limit.violated_by(value) {
                let subject = format!("{date} {} {} is out of range.", group.name(), channel.name);
                let body = format!(
                    "Please check the {}. {} read {value:.2} {} ({}) at {date}.",
                    group.name(),
                    channel.name,
                    channel.unit,
                    rule.limit
                );
                notifier.alert(&subject, &body);
                sent += 1;
            }
        }
        sent
    }
}

fn render(resolution: Resolution, groups: &[SharedGroup], renderer: &mut dyn Renderer) -> bool {
    let frame = ChartFrame {
        resolution,
        groups: groups.iter().map(|g| g.chart(resolution)).collect(),
    };
    match renderer.render(&frame) {
        Ok(()) => true,
        Err(e) => {
            warn!("render failed: {e}");
            false
        }
    }
}

fn append_log(bucket: Timestamp, groups: &[SharedGroup], log: &mut dyn PersistentLog) -> bool {
    let fields: Vec<_> = groups.iter().flat_map(|g| g.log_fields()).collect();
    match log.append(bucket, &fields) {
        Ok(()) => true,
        Err(e) => {
            warn!("log append failed: {e}");
            false
        }
    }
}

fn alert_disconnected(now: Timestamp, groups: &[SharedGroup], notifier: &mut dyn Notifier) -> usize {
    let date = now.format(ALERT_TIME_FORMAT);
    let mut sent = 0;
    for group in groups {
        if !group.is_enabled() || group.status().is_healthy() {
            continue;
        }
        let name = group.name();
        notifier.alert(
            &format!("{date} {name} is disconnected."),
            &format!("Please check the {name}. {name} is disconnected at {date}."),
        );
        sent += 1;
    }
    sent
}
