use thiserror::Error;
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("channel count mismatch: expected {expected}, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to decode reading: {0}")]
    Decode(String),
    #[error("failed to render plot: {0}")]
    Plot(String),
    #[error("device command failed: {0}")]
    Device(String),
    #[error("no control column {0}")]
    UnknownColumn(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for TelemetryError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        TelemetryError::Plot(format!("{value:?}"))
    }
}
impl From<image::ImageError> for TelemetryError {
    fn from(value: image::ImageError) -> Self {
        TelemetryError::Plot(value.to_string())
    }
}
impl From<serialport::Error> for TelemetryError {
    fn from(value: serialport::Error) -> Self {
        TelemetryError::Device(value.to_string())
    }
}
