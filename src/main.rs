// src/main.rs
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use labwatch::config::{load_or_init, DashboardConfig, MfcConfig};
use labwatch::engine;

#[derive(Parser)]
#[command(name = "labwatch", version, about = "Lab telemetry dashboard and MFC scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the sources, draw the chart, keep the minute log and alert.
    Dashboard {
        #[arg(long, default_value = "dashboard.json")]
        config: PathBuf,
        /// Fetch, draw and log a single time, then exit.
        #[arg(long)]
        once: bool,
    },
    /// Drive the mass flow controller from the weekly schedule.
    Mfc {
        #[arg(long, default_value = "mfc.json")]
        config: PathBuf,
    },
    /// Import a schedule file and list the records that would be skipped.
    CheckSchedule {
        path: PathBuf,
        /// Control column names; defaults to the MFC config's columns.
        #[arg(long = "column")]
        columns: Vec<String>,
    },
    /// Summarise daily log files and report gaps.
    CheckLog {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

// 入口函数
fn main() -> Result<()> {
    env_logger::init();
    match Cli::parse().command {
        Command::Dashboard { config, once } => {
            let config: DashboardConfig = load_or_init(&config)?;
            engine::run_dashboard(&config, once)
        }
        Command::Mfc { config } => {
            let config: MfcConfig = load_or_init(&config)?;
            engine::run_mfc(&config)
        }
        Command::CheckSchedule { path, columns } => {
            let columns = if columns.is_empty() {
                MfcConfig::default().columns
            } else {
                columns
            };
            let problems = engine::check_schedule(&path, &columns)?;
            if problems.is_empty() {
                println!("{}: ok", path.display());
            }
            for problem in problems {
                println!("{problem}");
            }
            Ok(())
        }
        Command::CheckLog { files } => {
            for line in engine::check_log(&files)? {
                println!("{line}");
            }
            Ok(())
        }
    }
}
