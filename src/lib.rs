// src/lib.rs
pub mod cadence;
pub mod config;
pub mod drivers;
pub mod engine;
pub mod group;
pub mod mfc;
pub mod notify;
pub mod recorder;
pub mod schedule;
pub mod types;
