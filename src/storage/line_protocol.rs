//! InfluxDB v2 line protocol.
//!
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp
//! ```

use std::fmt;

/// Value of a single point field. Every stored value is normalized to a
/// float so the field type stays uniform across writes.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// A time-stamped (measurement, tags, fields) tuple
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    /// Unix timestamp in the precision the point is written with
    pub timestamp: i64,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: i64) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.push((key.into(), value));
        self
    }

    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn field_value(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Encodes the point as one line. Tags are sorted by key (canonical form).
    /// Returns `None` for a point without fields, which InfluxDB rejects.
    pub fn to_line(&self) -> Option<String> {
        if self.fields.is_empty() {
            return None;
        }

        let mut line = escape(&self.measurement, &[',', ' ']);

        let mut tags: Vec<_> = self.tags.iter().collect();
        tags.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in tags {
            line.push(',');
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            line.push_str(&escape(value, &[',', '=', ' ']));
        }

        line.push(' ');
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| format!("{}={}", escape(key, &[',', '=', ' ']), value))
            .collect();
        line.push_str(&fields.join(","));

        line.push(' ');
        line.push_str(&self.timestamp.to_string());
        Some(line)
    }
}

/// Joins points into a request body, skipping field-less points.
pub fn encode(points: &[Point]) -> String {
    points
        .iter()
        .filter_map(Point::to_line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
