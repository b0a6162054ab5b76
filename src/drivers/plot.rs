use std::io::Cursor;
use std::path::{Path, PathBuf};
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use plotters::prelude::LineSeries;
use plotters::prelude::*;
use crate::drivers::buffer::ResolutionSnapshot;
use crate::drivers::error::TelemetryError;
use crate::types::{Channel, Resolution};
/// One channel group's history at the resolution being drawn.
#[derive(Clone, Debug)]
pub struct ChartGroup {
    pub name: String,
    pub channels: Vec<Channel>,
    pub history: ResolutionSnapshot,
}
/// Everything a renderer needs for one redraw.
#[derive(Clone, Debug)]
pub struct ChartFrame {
    pub resolution: Resolution,
    pub groups: Vec<ChartGroup>,
}
impl ChartFrame {
    pub fn sample_count(&self) -> usize {
        self.groups.iter().map(|g| g.history.timestamps.len()).sum()
    }
}
/// Sink for chart redraws. Failures are reported, never fatal to the caller.
pub trait Renderer {
    fn render(&mut self, frame: &ChartFrame) -> Result<(), TelemetryError>;
}
#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub panel_height: u32,
    pub background: RGBColor,
    pub palette: Vec<RGBColor>,
}
impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 900,
            panel_height: 300,
            background: RGBColor(10, 10, 10),
            palette: vec![BLUE, RED, GREEN, CYAN, MAGENTA, YELLOW, WHITE],
        }
    }
}
/// Draws one stacked panel per group. Time runs left to right in seconds
/// from the oldest sample of each group.
pub fn render_chart_png(frame: &ChartFrame, style: &PlotStyle) -> Result<Vec<u8>, TelemetryError> {
    if frame.groups.is_empty() || frame.sample_count() == 0 {
        return Err(TelemetryError::Plot("chart frame has no samples".into()));
    }
    let height = style.panel_height * frame.groups.len() as u32;
    let mut buffer = vec![0u8; (style.width * height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let panels = root.split_evenly((frame.groups.len(), 1));
        for (group, panel) in frame.groups.iter().zip(panels.iter()) {
            let history = &group.history;
            let Some(&origin) = history.timestamps.first() else {
                continue;
            };
            let xs: Vec<f64> = history
                .timestamps
                .iter()
                .map(|t| (*t - origin).num_milliseconds() as f64 / 1000.0)
                .collect();
            let x_max = xs.last().copied().unwrap_or(0.0).max(1.0);
            let (y_min, y_max) = y_bounds(&history.values);
            let mut chart = ChartBuilder::on(panel)
                .margin(10)
                .build_cartesian_2d(0f64..x_max, y_min..y_max)?;
            for (idx, channel) in history.values.iter().enumerate() {
                let color = style.palette[idx % style.palette.len()];
                let series = xs.iter().copied().zip(channel.iter().copied());
                chart.draw_series(LineSeries::new(series, &color))?;
            }
        }
        root.present()?;
    }
    encode_png(&buffer, style.width, height)
}
fn y_bounds(values: &[Vec<f64>]) -> (f64, f64) {
    let finite = values.iter().flatten().copied().filter(|v| v.is_finite());
    let (lo, hi) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !lo.is_finite() || !hi.is_finite() {
        return (-1.0, 1.0);
    }
    if (hi - lo).abs() < f64::EPSILON {
        return (lo - 1.0, hi + 1.0);
    }
    let pad = (hi - lo) * 0.05;
    (lo - pad, hi + pad)
}
fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>, TelemetryError> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| TelemetryError::Plot("failed to allocate image buffer".into()))?;
    let mut output = Vec::new();
    let dynamic = DynamicImage::ImageRgb8(image);
    dynamic.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}
/// Renderer that rewrites a PNG file on every redraw.
pub struct PlotRenderer {
    path: PathBuf,
    style: PlotStyle,
    renders: u64,
}
impl PlotRenderer {
    pub fn new(path: impl Into<PathBuf>, style: PlotStyle) -> Self {
        Self {
            path: path.into(),
            style,
            renders: 0,
        }
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn renders(&self) -> u64 {
        self.renders
    }
}
impl Renderer for PlotRenderer {
    fn render(&mut self, frame: &ChartFrame) -> Result<(), TelemetryError> {
        let png = render_chart_png(frame, &self.style)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // Write beside the target and rename so viewers never see half a file.
        let tmp = self.path.with_extension("png.part");
        std::fs::write(&tmp, png)?;
        std::fs::rename(&tmp, &self.path)?;
        self.renders += 1;
        Ok(())
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Local, TimeZone};
    use crate::drivers::TimeSeriesStore;
    fn frame_with(samples: usize) -> ChartFrame {
        let t0 = Local.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut store = TimeSeriesStore::unseeded(2);
        for i in 0..samples {
            store
                .admit(&[i as f64, (i as f64).sin()], t0 + Duration::seconds(i as i64))
                .unwrap();
        }
        ChartFrame {
            resolution: Resolution::Native,
            groups: vec![ChartGroup {
                name: "RFM".into(),
                channels: vec![Channel::new(0, "Tip", "L/min"), Channel::new(1, "Shield", "L/min")],
                history: store.snapshot(Resolution::Native),
            }],
        }
    }
    #[test]
    fn empty_frame_is_an_error() {
        let err = render_chart_png(&frame_with(0), &PlotStyle::default()).unwrap_err();
        assert!(matches!(err, TelemetryError::Plot(_)));
    }
    #[test]
    fn renders_png_bytes() {
        let png = render_chart_png(&frame_with(20), &PlotStyle::default()).unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }
    #[test]
    fn plot_renderer_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("charts").join("flow.png");
        let mut renderer = PlotRenderer::new(&path, PlotStyle::default());
        renderer.render(&frame_with(5)).unwrap();
        assert!(path.exists());
        assert_eq!(renderer.renders(), 1);
        assert_eq!(renderer.path(), path.as_path());
    }
    #[test]
    fn flat_series_get_padded_bounds() {
        assert_eq!(y_bounds(&[vec![2.0, 2.0]]), (1.0, 3.0));
        assert_eq!(y_bounds(&[vec![]]), (-1.0, 1.0));
    }
}
