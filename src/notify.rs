// src/notify.rs
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;
use log::warn;
use serde::{Deserialize, Serialize};

/// Fire-and-forget alert sink. Delivery problems are logged, never returned.
pub trait Notifier {
    fn alert(&mut self, subject: &str, body: &str);
}

/// Writes alerts to the log at warn level.
#[derive(Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn alert(&mut self, subject: &str, body: &str) {
        warn!("ALERT {subject} | {body}");
    }
}

/// One queued alert as stored in the spool file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpooledAlert {
    pub queued_at: String,
    pub subject: String,
    pub body: String,
}

/// Appends alerts as JSON lines to an outbox file that an external mailer
/// drains. Every alert is also logged.
pub struct SpoolNotifier {
    path: PathBuf,
}

impl SpoolNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn enqueue(&self, alert: &SpooledAlert) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating spool directory {}", dir.display()))?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening spool {}", self.path.display()))?;
        let line = serde_json::to_string(alert).context("encoding alert")?;
        writeln!(file, "{line}").context("writing alert")?;
        Ok(())
    }
}

impl Notifier for SpoolNotifier {
    fn alert(&mut self, subject: &str, body: &str) {
        warn!("ALERT {subject} | {body}");
        let alert = SpooledAlert {
            queued_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            subject: subject.to_owned(),
            body: body.to_owned(),
        };
        if let Err(e) = self.enqueue(&alert) {
            warn!("alert not spooled: {e:#}");
        }
    }
}
