//! Per-variant flattening of raw payloads into loosely-typed rows.
//!
//! Rows produced here still carry raw JSON cells; coercion and unification
//! into [`CanonicalRecord`](crate::types::CanonicalRecord) happen afterwards.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::constants;
use crate::types::Pollutant;

/// One flattened row: entity, raw timestamp, and raw column cells
#[derive(Debug, Clone, PartialEq)]
pub struct FlatRow {
    pub city: String,
    pub time: Option<String>,
    pub cells: BTreeMap<String, Value>,
}

/// OpenAQ `latest`: stations -> measurements, pivoted to one row per timestamp.
/// The first value seen for a (timestamp, parameter) pair wins.
pub fn flatten_openaq(city: &str, payload: &Value) -> Vec<FlatRow> {
    let Some(stations) = payload.get("results").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut pivot: BTreeMap<Option<String>, BTreeMap<String, Value>> = BTreeMap::new();
    for station in stations {
        let Some(measurements) = station.get("measurements").and_then(Value::as_array) else {
            continue;
        };
        for m in measurements {
            let Some(pollutant) = parameter_name(m).and_then(Pollutant::from_parameter) else {
                continue;
            };
            let cells = pivot.entry(measurement_time(m)).or_default();
            cells
                .entry(pollutant.column().to_string())
                .or_insert_with(|| m.get("value").cloned().unwrap_or(Value::Null));
        }
    }

    pivot
        .into_iter()
        .map(|(time, cells)| FlatRow {
            city: city.to_string(),
            time,
            cells,
        })
        .collect()
}

/// `parameter` is either a plain string or an object with a `name`
fn parameter_name(measurement: &Value) -> Option<&str> {
    match measurement.get("parameter")? {
        Value::String(s) => Some(s.as_str()),
        Value::Object(obj) => obj.get("name").and_then(Value::as_str),
        _ => None,
    }
}

fn measurement_time(measurement: &Value) -> Option<String> {
    measurement
        .get("lastUpdated")
        .and_then(Value::as_str)
        .or_else(|| measurement.pointer("/date/utc").and_then(Value::as_str))
        .or_else(|| measurement.pointer("/datetime/utc").and_then(Value::as_str))
        .map(str::to_string)
}

/// Open-Meteo `hourly`: parallel arrays, one row per index of `time`
pub fn flatten_open_meteo(city: &str, payload: &Value) -> Vec<FlatRow> {
    let Some(hourly) = payload.get("hourly").and_then(Value::as_object) else {
        return Vec::new();
    };

    let times = hourly.get(constants::COL_TIME).and_then(Value::as_array);
    let len = match times {
        Some(t) => t.len(),
        None => hourly
            .values()
            .filter_map(Value::as_array)
            .map(Vec::len)
            .max()
            .unwrap_or(0),
    };

    (0..len)
        .map(|i| {
            let time = times
                .and_then(|t| t.get(i))
                .and_then(Value::as_str)
                .map(str::to_string);
            let cells = hourly
                .iter()
                .filter(|(column, _)| column.as_str() != constants::COL_TIME)
                .filter_map(|(column, series)| {
                    let cell = series.as_array()?.get(i).cloned().unwrap_or(Value::Null);
                    Some((column.clone(), cell))
                })
                .collect();
            FlatRow {
                city: city.to_string(),
                time,
                cells,
            }
        })
        .collect()
}

/// Numeric coercion: numbers and numeric strings pass, everything else
/// (including NaN and infinities) is missing.
pub fn coerce_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Explicit hour cells must be integral and within a day
pub fn coerce_hour(value: &Value) -> Option<u32> {
    let n = coerce_number(value)?;
    (n.fract() == 0.0 && (0.0..24.0).contains(&n)).then(|| n as u32)
}

/// RFC 3339 first, then the offset-less formats the providers emit (taken as UTC)
pub fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use serde_json::json;

    #[test]
    fn test_openaq_pivot_one_row_per_timestamp() {
        let payload = json!({
            "results": [
                {"measurements": [
                    {"parameter": "pm25", "value": 80.0, "lastUpdated": "2024-01-01T10:00:00Z"},
                    {"parameter": "pm10", "value": 120.0, "lastUpdated": "2024-01-01T10:00:00Z"},
                    {"parameter": "bc", "value": 3.0, "lastUpdated": "2024-01-01T10:00:00Z"}
                ]},
                {"measurements": [
                    {"parameter": {"name": "pm25"}, "value": 99.0, "lastUpdated": "2024-01-01T10:00:00Z"},
                    {"parameter": "no2", "value": 15.0, "date": {"utc": "2024-01-01T11:00:00Z"}}
                ]},
                {"name": "station without measurements"}
            ]
        });
        let rows = flatten_openaq("Delhi", &payload);
        assert_eq!(rows.len(), 2);

        let first = &rows[0];
        assert_eq!(first.city, "Delhi");
        assert_eq!(first.time.as_deref(), Some("2024-01-01T10:00:00Z"));
        assert_eq!(first.cells["pm2_5"], json!(80.0));
        assert_eq!(first.cells["pm10"], json!(120.0));
        assert!(!first.cells.contains_key("bc"));

        assert_eq!(rows[1].cells["nitrogen_dioxide"], json!(15.0));
    }

    #[test]
    fn test_open_meteo_rows_follow_time_axis() {
        let payload = json!({
            "hourly": {
                "time": ["2024-01-01T00:00", "2024-01-01T01:00", "2024-01-01T02:00"],
                "pm10": [10.0, null, 12.5],
                "pm2_5": [5.0, 6.0]
            }
        });
        let rows = flatten_open_meteo("Mumbai", &payload);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].cells["pm10"], Value::Null);
        assert_eq!(rows[2].cells["pm2_5"], Value::Null);
        assert_eq!(rows[2].time.as_deref(), Some("2024-01-01T02:00"));
        assert!(!rows[0].cells.contains_key("time"));
    }

    #[test]
    fn test_coercion() {
        assert_eq!(coerce_number(&json!(3)), Some(3.0));
        assert_eq!(coerce_number(&json!(" 4.5 ")), Some(4.5));
        assert_eq!(coerce_number(&json!("n/a")), None);
        assert_eq!(coerce_number(&json!("")), None);
        assert_eq!(coerce_number(&json!("NaN")), None);
        assert_eq!(coerce_number(&Value::Null), None);
        assert_eq!(coerce_hour(&json!(7.0)), Some(7));
        assert_eq!(coerce_hour(&json!(24)), None);
        assert_eq!(coerce_hour(&json!(1.5)), None);
    }

    #[test]
    fn test_parse_time_formats() {
        assert_eq!(parse_time("2024-01-01T05:00:00+05:30").unwrap().hour(), 23);
        assert_eq!(parse_time("2024-01-01T05:00").unwrap().hour(), 5);
        assert_eq!(parse_time("2024-01-01 06:15:00").unwrap().hour(), 6);
        assert!(parse_time("yesterday").is_none());
    }
}
