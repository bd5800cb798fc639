use crate::error::{AppError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Wall-clock hour a reading belongs to, rendered as `YYYY-MM-DD HH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HourKey {
    date: NaiveDate,
    hour: u32,
}

impl HourKey {
    pub fn new(date: NaiveDate, hour: u32) -> Result<Self> {
        if hour > 23 {
            return Err(AppError::MalformedPayload(format!(
                "hour out of range: {hour}"
            )));
        }
        Ok(Self { date, hour })
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    /// Date part as sent upstream.
    pub fn date_string(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    /// Zero-padded hour part as sent upstream.
    pub fn hour_string(&self) -> String {
        format!("{:02}", self.hour)
    }
}

impl fmt::Display for HourKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:02}", self.date.format("%Y-%m-%d"), self.hour)
    }
}

/// Accepts `YYYY-MM-DD HH` and anything longer that starts with it
/// (`YYYY-MM-DD HH:MM[:SS]`, RFC 3339 with `T`); minutes and below are dropped.
impl FromStr for HourKey {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (date_part, time_part) = s
            .split_once(' ')
            .or_else(|| s.split_once('T'))
            .ok_or_else(|| AppError::MalformedPayload(format!("hour key without time: {s:?}")))?;

        let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
            .map_err(|e| AppError::MalformedPayload(format!("bad date {date_part:?}: {e}")))?;

        let hour_part = time_part.split(':').next().unwrap_or_default();
        if hour_part.is_empty()
            || hour_part.len() > 2
            || !hour_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(AppError::MalformedPayload(format!(
                "bad hour {time_part:?}"
            )));
        }
        let hour: u32 = hour_part
            .parse()
            .map_err(|_| AppError::MalformedPayload(format!("bad hour {hour_part:?}")))?;

        Self::new(date, hour)
    }
}

/// One reading from a house, already validated.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergySample {
    pub client_id: String,
    pub hour: HourKey,
    pub production: f64,
    pub consumption: f64,
}

#[derive(Debug, Deserialize)]
struct EnergyPayload {
    hour: String,
    production: Option<f64>,
    consumption: Option<f64>,
}

impl EnergySample {
    /// Parse an `energy_data` body: `{"hour": "...", "production": n, "consumption": n}`.
    pub fn from_payload(client_id: &str, payload: &[u8]) -> Result<Self> {
        let body: EnergyPayload = serde_json::from_slice(payload)
            .map_err(|e| AppError::MalformedPayload(format!("energy_data: {e}")))?;
        let hour: HourKey = body.hour.parse()?;
        let production = non_negative("production", body.production)?;
        let consumption = non_negative("consumption", body.consumption)?;

        Ok(Self {
            client_id: client_id.to_string(),
            hour,
            production,
            consumption,
        })
    }
}

fn non_negative(field: &str, value: Option<f64>) -> Result<f64> {
    match value {
        Some(v) if v.is_finite() && v >= 0.0 => Ok(v),
        Some(v) => Err(AppError::MalformedPayload(format!(
            "{field} must be a finite non-negative number, got {v}"
        ))),
        None => Err(AppError::MalformedPayload(format!("missing {field}"))),
    }
}

/// `modelMTDT` announcement.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientMetadata {
    pub name: String,
    /// Client-reported, kept verbatim as text.
    #[serde(default, deserialize_with = "text_or_number")]
    pub timestamp: String,
}

impl ClientMetadata {
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let meta: Self = serde_json::from_slice(payload)
            .map_err(|e| AppError::MalformedPayload(format!("modelMTDT: {e}")))?;
        if meta.name.is_empty() {
            return Err(AppError::MalformedPayload(
                "modelMTDT: empty name".to_string(),
            ));
        }
        Ok(meta)
    }
}

/// Strings as-is, `null` as empty, anything else as its JSON text.
pub(crate) fn text_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// The sink keeps production and consumption as separate series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Series {
    Production,
    Consumption,
}

impl Series {
    pub fn as_str(&self) -> &'static str {
        match self {
            Series::Production => "production",
            Series::Consumption => "consumption",
        }
    }
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body POSTed to the upstream sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamRecord {
    pub user_email: String,
    pub date: String,
    pub hour: String,
    pub value: f64,
}

impl UpstreamRecord {
    pub fn new(user_email: &str, hour: &HourKey, value: f64) -> Self {
        Self {
            user_email: user_email.to_string(),
            date: hour.date_string(),
            hour: hour.hour_string(),
            value,
        }
    }
}

/// Payload bytes as UTF-8 text, for topics whose body is a bare string.
pub fn payload_text(payload: &[u8]) -> Result<&str> {
    std::str::from_utf8(payload)
        .map_err(|e| AppError::MalformedPayload(format!("non-utf8 payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(s: &str) -> HourKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_hour_key_roundtrips_display() {
        let k = key("2025-04-09 01");
        assert_eq!(k.to_string(), "2025-04-09 01");
        assert_eq!(k.date_string(), "2025-04-09");
        assert_eq!(k.hour_string(), "01");
    }

    #[test]
    fn test_hour_key_truncates_longer_timestamps() {
        assert_eq!(key("2025-04-09 13:45"), key("2025-04-09 13"));
        assert_eq!(key("2025-04-09 13:45:10"), key("2025-04-09 13"));
        assert_eq!(key("2025-04-09T13:45:10Z"), key("2025-04-09 13"));
    }

    #[test]
    fn test_hour_key_rejects_garbage() {
        assert!("2025-04-09".parse::<HourKey>().is_err());
        assert!("2025-04-09 24".parse::<HourKey>().is_err());
        assert!("2025-13-01 01".parse::<HourKey>().is_err());
        assert!("2025-04-09 x1".parse::<HourKey>().is_err());
    }

    #[test]
    fn test_hour_key_orders_by_date_then_hour() {
        assert!(key("2025-01-01 23") < key("2025-01-02 00"));
        assert!(key("2025-01-01 08") < key("2025-01-01 09"));
    }

    #[test]
    fn test_energy_sample_from_payload() {
        let s = EnergySample::from_payload(
            "H1",
            br#"{"hour":"2025-01-01 08","production":5.0,"consumption":2}"#,
        )
        .unwrap();
        assert_eq!(s.client_id, "H1");
        assert_eq!(s.hour, key("2025-01-01 08"));
        assert_eq!(s.production, 5.0);
        assert_eq!(s.consumption, 2.0);
    }

    #[test]
    fn test_energy_sample_requires_both_values() {
        let err = EnergySample::from_payload("H1", br#"{"hour":"2025-01-01 08","production":5.0}"#)
            .unwrap_err();
        assert!(matches!(err, AppError::MalformedPayload(_)));

        let err = EnergySample::from_payload(
            "H1",
            br#"{"hour":"2025-01-01 08","production":-1.0,"consumption":1.0}"#,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::MalformedPayload(_)));

        let err = EnergySample::from_payload(
            "H1",
            br#"{"hour":"2025-01-01 08","production":"5","consumption":1.0}"#,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::MalformedPayload(_)));
    }

    #[test]
    fn test_metadata_accepts_numeric_timestamp() {
        let m = ClientMetadata::from_payload(br#"{"name":"House 1","timestamp":1735718400}"#)
            .unwrap();
        assert_eq!(m.name, "House 1");
        assert_eq!(m.timestamp, "1735718400");

        let m = ClientMetadata::from_payload(br#"{"name":"House 2"}"#).unwrap();
        assert_eq!(m.timestamp, "");
    }

    #[test]
    fn test_upstream_record_splits_hour_key() {
        let r = UpstreamRecord::new("a@b.c", &key("2025-04-09 07"), 1.5);
        assert_eq!(
            serde_json::to_value(&r).unwrap(),
            serde_json::json!({"user_email":"a@b.c","date":"2025-04-09","hour":"07","value":1.5})
        );
    }

    #[test]
    fn test_single_digit_hour_is_sent_padded() {
        assert_eq!(key("2025-04-09 1"), key("2025-04-09 01"));
        let r = UpstreamRecord::new("", &key("2025-04-09 1"), 0.0);
        assert_eq!(r.hour, "01");
    }
}
