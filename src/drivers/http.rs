use std::time::Duration as StdDuration;
use chrono::{Local, TimeZone};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::drivers::source::{DataSource, SourceReading};
use crate::drivers::TelemetryError;
use crate::types::{Channel, SourceStatus, Timestamp};
pub const HTTP_TIMEOUT: StdDuration = StdDuration::from_secs(1);
/// How a JSON field turns into a number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldFormat {
    /// JSON number or numeric string.
    #[default]
    Number,
    /// First whitespace-separated token of a string, e.g. "12.3 psi".
    Leading,
    /// Controller readout such as "+012.34K": characters 1..7.
    Lakeshore,
}
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub format: FieldFormat,
}
impl FieldSpec {
    pub fn new(key: &str, name: &str, unit: &str, format: FieldFormat) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            unit: unit.into(),
            format,
        }
    }
}
/// Polls a local daemon's JSON endpoint once per call.
pub struct HttpSource {
    name: String,
    url: String,
    fields: Vec<FieldSpec>,
    channels: Vec<Channel>,
    timestamp_key: Option<String>,
    client: reqwest::blocking::Client,
}
impl HttpSource {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        fields: Vec<FieldSpec>,
        timestamp_key: Option<String>,
    ) -> Result<Self, TelemetryError> {
        if fields.is_empty() {
            return Err(TelemetryError::InvalidConfig(
                "http source needs at least one field".into(),
            ));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| TelemetryError::InvalidConfig(e.to_string()))?;
        let channels = fields
            .iter()
            .enumerate()
            .map(|(idx, field)| Channel::new(idx, field.name.clone(), field.unit.clone()))
            .collect();
        Ok(Self {
            name: name.into(),
            url: url.into(),
            fields,
            channels,
            timestamp_key,
            client,
        })
    }
    fn fetch(&self) -> Result<SourceReading, SourceStatus> {
        let response = self.client.get(&self.url).send().map_err(classify_error)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            warn!("{}: daemon answered {status}", self.name);
            return Err(SourceStatus::Http(status));
        }
        let body: Value = response.json().map_err(|e| {
            warn!("{}: response is not JSON: {e}", self.name);
            SourceStatus::Malformed
        })?;
        let now = Local::now();
        decode_body(&body, &self.fields, self.timestamp_key.as_deref(), now)
            .map(|(values, timestamp)| SourceReading {
                values,
                timestamp,
                status: SourceStatus::Http(status),
            })
            .map_err(|e| {
                warn!("{}: {e}", self.name);
                SourceStatus::Malformed
            })
    }
}
impl DataSource for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }
    fn channels(&self) -> &[Channel] {
        &self.channels
    }
    fn poll(&mut self) -> SourceReading {
        self.fetch().unwrap_or_else(|status| {
            SourceReading::zeros(self.channels.len(), Local::now(), status)
        })
    }
}
fn classify_error(err: reqwest::Error) -> SourceStatus {
    warn!("http poll failed: {err}");
    if err.is_timeout() {
        SourceStatus::Timeout
    } else if err.is_connect() {
        SourceStatus::ConnectionError
    } else if let Some(code) = err.status() {
        SourceStatus::Http(code.as_u16())
    } else {
        SourceStatus::RequestError
    }
}
/// Extracts the configured fields (and optional epoch-seconds timestamp)
/// from a daemon response body.
pub fn decode_body(
    body: &Value,
    fields: &[FieldSpec],
    timestamp_key: Option<&str>,
    now: Timestamp,
) -> Result<(Vec<f64>, Timestamp), TelemetryError> {
    let values = fields
        .iter()
        .map(|field| {
            let raw = body
                .get(&field.key)
                .ok_or_else(|| TelemetryError::Decode(format!("missing key {:?}", field.key)))?;
            parse_field(raw, field.format)
                .ok_or_else(|| TelemetryError::Decode(format!("bad value for {:?}: {raw}", field.key)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let timestamp = match timestamp_key {
        None => now,
        Some(key) => {
            let secs = body
                .get(key)
                .and_then(parse_number)
                .ok_or_else(|| TelemetryError::Decode(format!("missing timestamp {key:?}")))?;
            Local
                .timestamp_millis_opt((secs * 1000.0).round() as i64)
                .single()
                .ok_or_else(|| TelemetryError::Decode(format!("timestamp out of range: {secs}")))?
        }
    };
    Ok((values, timestamp))
}
pub fn parse_field(raw: &Value, format: FieldFormat) -> Option<f64> {
    match format {
        FieldFormat::Number => parse_number(raw),
        FieldFormat::Leading => match raw {
            Value::String(s) => s.split_whitespace().next()?.parse().ok(),
            other => parse_number(other),
        },
        FieldFormat::Lakeshore => {
            let text = raw.as_str()?;
            let digits: String = text.chars().skip(1).take(6).collect();
            digits.trim().parse().ok()
        }
    }
}
fn parse_number(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    fn now() -> Timestamp {
        Local.timestamp_opt(1_700_000_000, 0).unwrap()
    }
    #[test]
    fn parses_each_field_format() {
        assert_eq!(parse_field(&json!(1.5), FieldFormat::Number), Some(1.5));
        assert_eq!(parse_field(&json!(" 2.25 "), FieldFormat::Number), Some(2.25));
        assert_eq!(parse_field(&json!("12.3 psi"), FieldFormat::Leading), Some(12.3));
        assert_eq!(parse_field(&json!("+012.34K"), FieldFormat::Lakeshore), Some(12.34));
        assert_eq!(parse_field(&json!(null), FieldFormat::Number), None);
        assert_eq!(parse_field(&json!("n/a"), FieldFormat::Leading), None);
    }
    #[test]
    fn decodes_flow_body_with_timestamp() {
        let fields = vec![
            FieldSpec::new("Tip", "Tip", "L/min", FieldFormat::Number),
            FieldSpec::new("Shield", "Shield", "L/min", FieldFormat::Number),
        ];
        let body = json!({"Tip": "1.20", "Shield": 0.4, "timestamp": 1_699_999_998.5});
        let (values, ts) = decode_body(&body, &fields, Some("timestamp"), now()).unwrap();
        assert_eq!(values, vec![1.2, 0.4]);
        assert_eq!(now() - ts, chrono::Duration::milliseconds(1500));
    }
    #[test]
    fn missing_key_is_a_decode_error() {
        let fields = vec![FieldSpec::new("valueA", "Head", "K", FieldFormat::Lakeshore)];
        let err = decode_body(&json!({"valueB": "+001.00K"}), &fields, None, now()).unwrap_err();
        assert!(matches!(err, TelemetryError::Decode(_)));
        let (_, ts) = decode_body(&json!({"valueA": "+001.00K"}), &fields, None, now()).unwrap();
        assert_eq!(ts, now());
    }
    #[test]
    fn unreachable_daemon_degrades_to_zeros() {
        let fields = vec![FieldSpec::new("Tip", "Tip", "L/min", FieldFormat::Number)];
        let mut source = HttpSource::new("RFM", "http://127.0.0.1:1/get_value", fields, None).unwrap();
        let reading = source.poll();
        assert_eq!(reading.values, vec![0.0]);
        assert!(!reading.status.is_healthy());
    }
    #[test]
    fn rejects_empty_field_list() {
        assert!(HttpSource::new("x", "http://127.0.0.1:1/", Vec::new(), None).is_err());
    }
}
