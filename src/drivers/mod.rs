// src/drivers/mod.rs
// 数据采集相关子模块
pub mod adc;
pub mod buffer;
pub mod error;
pub mod filter;
pub mod http;
pub mod plot;
pub mod source;
// 公开导出常用类型，方便外部调用
pub use adc::{AdcChannelSpec, AdcDecoder, Calibration, SerialAdcSource};
pub use buffer::{ResolutionSnapshot, ResolutionView, TimeSeriesStore, CAPACITY};
pub use error::TelemetryError;
pub use filter::SignalConditioner;
pub use http::{FieldFormat, FieldSpec, HttpSource};
pub use plot::{render_chart_png, ChartFrame, ChartGroup, PlotRenderer, PlotStyle, Renderer};
pub use source::{settle_reading, DataSource, ManualSource, SimulatedSource, SourceReading};
