//! Typed records for stream payloads.
//!
//! Payloads are validated into these shapes at the consumer's entry point;
//! everything past dispatch works with typed fields instead of raw JSON.
//! All fields are optional because incremental updates are partial patches:
//! a `TimingData` update for one driver may carry nothing but a gap string.
//!
//! Two feed quirks are absorbed here:
//!
//! - Collections arrive as JSON arrays in snapshots but as objects keyed by
//!   index in incremental patches. [`indexed_entries`] yields both uniformly.
//! - Booleans arrive as `true`, `1`, or `"true"` depending on the stream.
//!   [`FlexBool`] accepts all three.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

/// A boolean that may arrive as a bool, a number, or a string.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FlexBool {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl FlexBool {
    pub fn as_bool(&self) -> bool {
        match self {
            FlexBool::Bool(b) => *b,
            FlexBool::Int(n) => *n != 0,
            FlexBool::Text(s) => s.eq_ignore_ascii_case("true") || s == "1",
        }
    }
}

/// Iterates a collection that is either an array or an index-keyed object.
///
/// Array elements are yielded with their position as the key. Object keys
/// beginning with `_` (bookkeeping markers like `_kf`) are skipped.
pub fn indexed_entries(value: &Value) -> Vec<(String, &Value)> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (k.clone(), v))
            .collect(),
        _ => Vec::new(),
    }
}

/// One driver's identity entry from `DriverList`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DriverEntry {
    pub racing_number: Option<String>,
    pub broadcast_name: Option<String>,
    pub full_name: Option<String>,
    pub tla: Option<String>,
    pub team_name: Option<String>,
    pub team_colour: Option<String>,
    pub line: Option<u32>,
}

/// A timed value with best-time markers, as used for laps and sectors.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TimedValue {
    pub value: Option<String>,
    pub personal_fastest: Option<FlexBool>,
    pub overall_fastest: Option<FlexBool>,
    pub lap: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IntervalValue {
    pub value: Option<String>,
}

/// Per-driver patch from `TimingData`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TimingLine {
    pub position: Option<String>,
    pub gap_to_leader: Option<String>,
    pub interval_to_position_ahead: Option<IntervalValue>,
    pub sectors: Option<Value>,
    pub last_lap_time: Option<TimedValue>,
    pub best_lap_time: Option<TimedValue>,
    pub in_pit: Option<FlexBool>,
    pub pit_out: Option<FlexBool>,
    pub retired: Option<FlexBool>,
    pub stopped: Option<FlexBool>,
    pub knocked_out: Option<FlexBool>,
    pub status: Option<u32>,
    pub number_of_laps: Option<u32>,
    pub number_of_pit_stops: Option<u32>,
}

/// One stint patch from `TimingAppData`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StintPatch {
    pub compound: Option<String>,
    pub new: Option<FlexBool>,
    pub total_laps: Option<u32>,
    pub start_laps: Option<u32>,
    pub lap_number: Option<u32>,
    pub lap_time: Option<String>,
    pub pit_in_time: Option<String>,
    pub pit_out_time: Option<String>,
}

/// Per-driver patch from `TimingAppData`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AppDataLine {
    pub racing_number: Option<String>,
    pub line: Option<u32>,
    pub stints: Option<Value>,
}

/// `SessionInfo` payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SessionInfo {
    pub key: Option<i64>,
    #[serde(rename = "Type")]
    pub session_type: Option<String>,
    pub name: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub gmt_offset: Option<String>,
    pub meeting: Option<MeetingInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MeetingInfo {
    pub name: Option<String>,
    pub official_name: Option<String>,
    pub circuit: Option<CircuitInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CircuitInfo {
    pub key: Option<i64>,
    pub short_name: Option<String>,
}

/// One entry in `SessionData.StatusSeries`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StatusSeriesEntry {
    pub utc: Option<String>,
    pub track_status: Option<String>,
    pub session_status: Option<String>,
}

/// `TrackStatus` payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TrackStatus {
    pub status: Option<String>,
    pub message: Option<String>,
}

/// `WeatherData` payload. All values are decimal strings on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WeatherData {
    pub air_temp: Option<String>,
    pub track_temp: Option<String>,
    pub humidity: Option<String>,
    pub pressure: Option<String>,
    pub rainfall: Option<String>,
    pub wind_direction: Option<String>,
    pub wind_speed: Option<String>,
}

/// One entry in `RaceControlMessages.Messages`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct RaceControlMessage {
    pub utc: Option<String>,
    pub lap: Option<u32>,
    pub category: Option<String>,
    pub flag: Option<String>,
    pub scope: Option<String>,
    pub sector: Option<u32>,
    pub message: Option<String>,
    pub status: Option<String>,
    pub racing_number: Option<String>,
}

/// One entry in `TeamRadio.Captures`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct TeamRadioCapture {
    pub utc: Option<String>,
    pub racing_number: Option<String>,
    pub path: Option<String>,
}

/// `ExtrapolatedClock` payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExtrapolatedClock {
    pub utc: Option<String>,
    pub remaining: Option<String>,
    pub extrapolating: Option<FlexBool>,
}

/// `LapCount` payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LapCount {
    pub current_lap: Option<u32>,
    pub total_laps: Option<u32>,
}

/// One capture batch from the decompressed `CarData` stream.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CarDataBatch {
    pub utc: Option<String>,
    pub cars: HashMap<String, CarChannelsEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CarChannelsEntry {
    pub channels: HashMap<String, f64>,
}

/// One capture batch from the decompressed `Position` stream.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PositionBatch {
    pub timestamp: Option<String>,
    pub entries: HashMap<String, PositionEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PositionEntry {
    pub status: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flex_bool_accepts_all_wire_shapes() {
        let b: FlexBool = serde_json::from_value(json!(true)).unwrap();
        assert!(b.as_bool());
        let b: FlexBool = serde_json::from_value(json!(1)).unwrap();
        assert!(b.as_bool());
        let b: FlexBool = serde_json::from_value(json!("true")).unwrap();
        assert!(b.as_bool());
        let b: FlexBool = serde_json::from_value(json!("false")).unwrap();
        assert!(!b.as_bool());
        let b: FlexBool = serde_json::from_value(json!(0)).unwrap();
        assert!(!b.as_bool());
    }

    #[test]
    fn indexed_entries_handles_both_collection_shapes() {
        let as_list = json!([{"Lap": 1}, {"Lap": 2}]);
        let entries = indexed_entries(&as_list);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "0");

        let as_map = json!({"3": {"Lap": 4}, "_kf": true});
        let entries = indexed_entries(&as_map);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "3");

        assert!(indexed_entries(&json!("scalar")).is_empty());
    }

    #[test]
    fn timing_line_deserializes_partial_patch() {
        let line: TimingLine = serde_json::from_value(json!({
            "GapToLeader": "+1.234",
            "InPit": 1,
        }))
        .unwrap();
        assert_eq!(line.gap_to_leader.as_deref(), Some("+1.234"));
        assert!(line.in_pit.unwrap().as_bool());
        assert!(line.position.is_none());
        assert!(line.last_lap_time.is_none());
    }

    #[test]
    fn timing_line_deserializes_full_snapshot_entry() {
        let line: TimingLine = serde_json::from_value(json!({
            "Position": "3",
            "GapToLeader": "+12.872",
            "IntervalToPositionAhead": {"Value": "+0.341"},
            "LastLapTime": {"Value": "1:23.456", "PersonalFastest": true},
            "BestLapTime": {"Value": "1:22.990", "Lap": 14},
            "NumberOfLaps": 17,
            "NumberOfPitStops": 1,
            "Retired": false,
        }))
        .unwrap();
        assert_eq!(line.position.as_deref(), Some("3"));
        assert_eq!(
            line.interval_to_position_ahead.unwrap().value.as_deref(),
            Some("+0.341")
        );
        assert!(line.last_lap_time.unwrap().personal_fastest.unwrap().as_bool());
        assert_eq!(line.best_lap_time.unwrap().lap, Some(14));
    }

    #[test]
    fn session_info_extracts_type_and_key() {
        let info: SessionInfo = serde_json::from_value(json!({
            "Key": 9512,
            "Type": "Qualifying",
            "Name": "Qualifying",
            "Meeting": {"Name": "Bahrain Grand Prix", "Circuit": {"ShortName": "Sakhir"}},
        }))
        .unwrap();
        assert_eq!(info.key, Some(9512));
        assert_eq!(info.session_type.as_deref(), Some("Qualifying"));
        assert_eq!(
            info.meeting.unwrap().circuit.unwrap().short_name.as_deref(),
            Some("Sakhir")
        );
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let status: TrackStatus = serde_json::from_value(json!({
            "Status": "2",
            "Message": "Yellow",
            "_kf": true,
        }))
        .unwrap();
        assert_eq!(status.status.as_deref(), Some("2"));
    }
}
