use std::fmt::Write;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::event::TelemetryEvent;

pub const DEFAULT_MEASUREMENT: &str = "telemetry";

/// Enumeration of errors returned by a time-series store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("request to the time-series store failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("time-series store responded with {status}: {body}")]
    ResponseError {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid time-series store url: {0}")]
    UrlError(#[from] url::ParseError),
    #[error("time-series store token is not a valid header value")]
    InvalidToken,
}

/// The outbound seam for persisted telemetry. Implementations must be safe for
/// concurrent use by every worker of an executor without external locking.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn write(&self, point: &Point) -> Result<(), StoreError>;

    async fn delete(&self, request: &DeleteRequest) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
}

/// One point in line protocol terms. Points with the same measurement, tag set
/// and timestamp overwrite each other, which is what makes retried writes safe.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp_ms: i64,
}

impl Point {
    pub fn from_event(measurement: &str, event: &TelemetryEvent) -> Self {
        let mut fields = vec![
            (
                "currentTemperature".to_owned(),
                FieldValue::Float(event.data.current_temperature),
            ),
            (
                "heatingStatus".to_owned(),
                FieldValue::Integer(i64::from(event.heating_status())),
            ),
        ];
        if let Some(target) = event.data.target_temperature {
            fields.push(("targetTemperature".to_owned(), FieldValue::Float(target)));
        }

        Point {
            measurement: measurement.to_owned(),
            tags: vec![("deviceId".to_owned(), event.device_id.clone())],
            fields,
            timestamp_ms: event.timestamp.timestamp_millis(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Render as a single line of line protocol with millisecond precision.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            _ = write!(
                line,
                ",{}={}",
                escape(key, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            );
        }
        for (index, (key, value)) in self.fields.iter().enumerate() {
            let separator = if index == 0 { ' ' } else { ',' };
            let key = escape(key, &[',', '=', ' ']);
            _ = match value {
                FieldValue::Float(v) => write!(line, "{}{}={}", separator, key, v),
                FieldValue::Integer(v) => write!(line, "{}{}={}i", separator, key, v),
            };
        }
        _ = write!(line, " {}", self.timestamp_ms);
        line
    }
}

/// Escape line protocol special characters.
///
/// Line protocol has no escape for line breaks, so `\n` and `\r` are written
/// as the two characters `\n` and `\r`. This mapping is lossy: a device id
/// holding a line break is stored under a tag that differs from the id on the
/// processed topic. The alternative, a raw line break, would split the point
/// and corrupt the write.
fn escape(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\\' => escaped.push_str("\\\\"),
            c if special.contains(&c) => {
                escaped.push('\\');
                escaped.push(c);
            }
            c => escaped.push(c),
        }
    }
    escaped
}

/// A bulk delete by predicate over a time range.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRequest {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub predicate: String,
}

impl DeleteRequest {
    /// Delete every point of `measurement` tagged with an already sanitized device id.
    pub fn for_device(
        measurement: &str,
        sanitized_device_id: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Self {
        DeleteRequest {
            start,
            stop,
            predicate: format!(
                r#"_measurement="{}" AND "deviceId"="{}""#,
                measurement, sanitized_device_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SensorReading;
    use chrono::TimeZone;

    fn event(target: Option<f64>, heating: Option<bool>) -> TelemetryEvent {
        TelemetryEvent {
            device_id: "d1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            data: SensorReading {
                current_temperature: 21.5,
                target_temperature: target,
                heating_status: heating,
            },
        }
    }

    #[test]
    fn point_from_minimal_event() {
        let point = Point::from_event(DEFAULT_MEASUREMENT, &event(None, None));

        assert_eq!(point.measurement, "telemetry");
        assert_eq!(point.tag("deviceId"), Some("d1"));
        assert_eq!(
            point.field("currentTemperature"),
            Some(&FieldValue::Float(21.5))
        );
        assert_eq!(point.field("heatingStatus"), Some(&FieldValue::Integer(0)));
        assert_eq!(point.field("targetTemperature"), None);
        assert_eq!(point.timestamp_ms, 1_704_067_200_000);
        assert_eq!(
            point.to_line_protocol(),
            "telemetry,deviceId=d1 currentTemperature=21.5,heatingStatus=0i 1704067200000"
        );
    }

    #[test]
    fn point_from_full_event() {
        let point = Point::from_event(DEFAULT_MEASUREMENT, &event(Some(22.0), Some(true)));

        assert_eq!(point.field("heatingStatus"), Some(&FieldValue::Integer(1)));
        assert_eq!(
            point.to_line_protocol(),
            "telemetry,deviceId=d1 currentTemperature=21.5,heatingStatus=1i,targetTemperature=22 1704067200000"
        );
    }

    #[test]
    fn tag_values_are_escaped() {
        let mut event = event(None, None);
        event.device_id = "room 1,floor=2\nweather temp=0".to_string();
        let line = Point::from_event(DEFAULT_MEASUREMENT, &event).to_line_protocol();

        assert!(!line.contains('\n'));
        assert!(line.starts_with(r"telemetry,deviceId=room\ 1\,floor\=2\nweather\ temp\=0 "));
    }

    #[test]
    fn line_breaks_in_tags_become_literal_escapes() {
        let mut event = event(None, None);
        event.device_id = "d1\r\nd2".to_string();
        let point = Point::from_event(DEFAULT_MEASUREMENT, &event);

        // The point keeps the original id, only its encoding is lossy.
        assert_eq!(point.tag("deviceId"), Some("d1\r\nd2"));
        let line = point.to_line_protocol();
        assert_eq!(line.lines().count(), 1);
        assert!(line.starts_with(r"telemetry,deviceId=d1\r\nd2 "));
    }

    #[test]
    fn same_event_yields_same_point() {
        let first = Point::from_event(DEFAULT_MEASUREMENT, &event(Some(20.0), Some(false)));
        let second = Point::from_event(DEFAULT_MEASUREMENT, &event(Some(20.0), Some(false)));
        assert_eq!(first, second);
        assert_eq!(first.to_line_protocol(), second.to_line_protocol());
    }

    #[test]
    fn delete_predicate_for_device() {
        let request = DeleteRequest::for_device(
            DEFAULT_MEASUREMENT,
            "d1",
            Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        assert_eq!(
            request.predicate,
            r#"_measurement="telemetry" AND "deviceId"="d1""#
        );
    }
}
