//! InfluxDB 2.x writer

use std::fmt::{self, Write};

use async_trait::async_trait;
use influxdb2::Client;
use tracing::debug;

use super::{Point, TimeSeriesWriter};
use crate::error::SinkError;

/// Field value types of the line protocol
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    UnsignedInteger(u64),
    String(String),
    Boolean(bool),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Integer(v) => write!(f, "{v}i"),
            FieldValue::UnsignedInteger(v) => write!(f, "{v}u"),
            FieldValue::String(v) => write!(f, "\"{}\"", v.replace('"', "\\\"")),
            FieldValue::Boolean(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::UnsignedInteger(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

/// Line protocol builder
#[derive(Debug)]
pub struct LineProtocolBuilder {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, FieldValue)>,
    timestamp: Option<i64>,
}

impl LineProtocolBuilder {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp: None,
        }
    }

    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// Timestamp in nanoseconds
    #[must_use]
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn build(self) -> String {
        let mut line = escape_measurement(&self.measurement);

        let mut tags = self.tags;
        tags.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in &tags {
            let _ = write!(line, ",{}={}", escape_key(key), escape_key(value));
        }

        line.push(' ');
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            let _ = write!(line, "{}={}", escape_key(key), value);
        }

        if let Some(ts) = self.timestamp {
            let _ = write!(line, " {ts}");
        }
        line
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag keys, tag values and field keys share one escaping rule
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Writes batches to an InfluxDB 2.x bucket
pub struct InfluxWriter {
    client: Client,
    org: String,
    bucket: String,
}

impl fmt::Debug for InfluxWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfluxWriter")
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl InfluxWriter {
    pub fn new(url: &str, org: &str, bucket: &str, token: &str) -> Self {
        debug!(
            "Creating InfluxDB client: url={}, org={}, bucket={}",
            url, org, bucket
        );
        Self {
            client: Client::new(url, org, token),
            org: org.to_string(),
            bucket: bucket.to_string(),
        }
    }

    /// Health check, used once at startup
    pub async fn ping(&self) -> Result<(), SinkError> {
        let ready = self
            .client
            .ready()
            .await
            .map_err(|e| SinkError::Write(format!("Ready check failed: {e}")))?;
        if ready {
            Ok(())
        } else {
            Err(SinkError::Write("InfluxDB is not ready".to_string()))
        }
    }
}

#[async_trait]
impl TimeSeriesWriter for InfluxWriter {
    fn name(&self) -> &str {
        "influxdb"
    }

    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        let body = points
            .iter()
            .map(Point::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n");
        debug!(
            "Writing {} points ({} bytes) to {}/{}",
            points.len(),
            body.len(),
            self.org,
            self.bucket
        );
        self.client
            .write_line_protocol(&self.org, &self.bucket, body)
            .await
            .map_err(|e| SinkError::Write(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_protocol_escaping_and_types() {
        let line = LineProtocolBuilder::new("arc data")
            .tag("site", "plant,1")
            .tag("furnace", "1")
            .field("current", 5978.5)
            .field("count", 3i64)
            .field("alarm", true)
            .timestamp(1_700_000_000_000_000_000)
            .build();
        assert_eq!(
            line,
            "arc\\ data,furnace=1,site=plant\\,1 current=5978.5,count=3i,alarm=true 1700000000000000000"
        );
    }
}
