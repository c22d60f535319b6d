//! Wire frame classification and normalization.
//!
//! The push feed and recorded replay files carry the same three frame shapes:
//!
//! - **Snapshot**: `{"R": {stream: payload, ...}}`, the full session state
//!   delivered once after subscribing.
//! - **Incremental**: `{"M": [{"H": hub, "M": "feed", "A": [stream, payload,
//!   utc]}, ...]}` with one or more stream updates.
//! - **Heartbeat**: `{}` or an `M` envelope with no feed entries.
//!
//! Replay files additionally contain bare `[stream, payload, utc]` arrays from
//! older capture tooling. All shapes normalize to [`NormalizedMessage`] values
//! so the consumer never needs to know which transport produced them.
//!
//! Streams suffixed `.z` have their payload decompressed here and the suffix
//! stripped, so downstream dispatch sees one canonical stream name. A message
//! whose compressed payload fails to decode is dropped with a warning; the
//! rest of the frame survives.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::codec;
use crate::time_utils::parse_utc_timestamp;

/// A single stream update in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    /// Stream name with any `.z` suffix stripped.
    pub stream: String,
    /// Decoded payload; already decompressed for `.z` streams.
    pub payload: Value,
    /// Feed-side UTC timestamp string, when the frame carried one.
    pub timestamp: Option<String>,
}

/// The classified contents of one wire frame.
#[derive(Debug, Clone, Default)]
pub struct ParsedFrame {
    pub messages: Vec<NormalizedMessage>,
    /// Feed timestamp usable for replay pacing. Only incremental frames carry
    /// one; snapshots never drive pacing.
    pub pacing_timestamp: Option<DateTime<Utc>>,
    /// True when the frame contains at least one non-heartbeat update.
    pub is_action: bool,
    /// True for empty/heartbeat-only frames.
    pub is_heartbeat: bool,
}

/// Classifies a raw frame and normalizes its stream updates.
pub fn parse_frame(raw: &Value) -> ParsedFrame {
    if let Some(obj) = raw.as_object() {
        if let Some(snapshot) = obj.get("R").and_then(Value::as_object) {
            return parse_snapshot(snapshot);
        }
        if let Some(envelope) = obj.get("M").and_then(Value::as_array) {
            return parse_incremental(envelope);
        }
        // Keepalives and control frames (C/S/G/I keys) carry no stream data.
        let mut frame = ParsedFrame::default();
        if obj.is_empty() {
            frame.is_heartbeat = true;
            frame.messages.push(NormalizedMessage {
                stream: "Heartbeat".to_string(),
                payload: Value::Object(serde_json::Map::new()),
                timestamp: None,
            });
        }
        return frame;
    }

    if let Some(entry) = raw.as_array() {
        // Bare [stream, payload, utc] line from older replay captures.
        let mut frame = ParsedFrame::default();
        if let Some(msg) = normalize_entry(entry) {
            if let Some(ts) = msg.timestamp.as_deref() {
                frame.pacing_timestamp = parse_utc_timestamp(ts);
            }
            frame.is_action = msg.stream != "Heartbeat";
            frame.is_heartbeat = !frame.is_action;
            frame.messages.push(msg);
        }
        return frame;
    }

    warn!(frame = %raw, "unrecognized frame shape, skipping");
    ParsedFrame::default()
}

fn parse_snapshot(snapshot: &serde_json::Map<String, Value>) -> ParsedFrame {
    let mut frame = ParsedFrame::default();
    // Snapshot entries have no per-stream timestamps; borrow the heartbeat's.
    let snapshot_utc = snapshot
        .get("Heartbeat")
        .and_then(|hb| hb.get("Utc"))
        .and_then(Value::as_str)
        .map(str::to_string);

    for (stream, payload) in snapshot {
        let Some(msg) = normalize_stream(stream, payload, snapshot_utc.clone()) else {
            continue;
        };
        if msg.stream != "Heartbeat" {
            frame.is_action = true;
        }
        frame.messages.push(msg);
    }
    frame.is_heartbeat = !frame.is_action;
    frame
}

fn parse_incremental(envelope: &[Value]) -> ParsedFrame {
    let mut frame = ParsedFrame::default();
    for item in envelope {
        let Some(obj) = item.as_object() else { continue };
        if obj.get("M").and_then(Value::as_str) != Some("feed") {
            continue;
        }
        let Some(args) = obj.get("A").and_then(Value::as_array) else { continue };
        let Some(msg) = normalize_entry(args) else { continue };
        if let Some(ts) = msg.timestamp.as_deref() {
            // Last entry's timestamp wins; entries within a frame are ordered.
            if let Some(parsed) = parse_utc_timestamp(ts) {
                frame.pacing_timestamp = Some(parsed);
            }
        }
        if msg.stream != "Heartbeat" {
            frame.is_action = true;
        }
        frame.messages.push(msg);
    }
    frame.is_heartbeat = frame.messages.is_empty() || !frame.is_action;
    frame
}

/// Normalizes one `[stream, payload, utc]` argument triple.
fn normalize_entry(args: &[Value]) -> Option<NormalizedMessage> {
    let stream = args.first()?.as_str()?;
    let payload = args.get(1)?;
    let timestamp = args.get(2).and_then(Value::as_str).map(str::to_string);
    normalize_stream(stream, payload, timestamp)
}

fn normalize_stream(
    stream: &str,
    payload: &Value,
    timestamp: Option<String>,
) -> Option<NormalizedMessage> {
    if let Some(base) = stream.strip_suffix(".z") {
        let Some(encoded) = payload.as_str() else {
            warn!(stream, "compressed stream payload is not a string, skipping");
            return None;
        };
        match codec::decode(encoded) {
            Ok(decoded) => Some(NormalizedMessage {
                stream: base.to_string(),
                payload: decoded,
                timestamp,
            }),
            Err(err) => {
                warn!(stream, error = %err, "failed to decode compressed payload, skipping");
                None
            }
        }
    } else {
        Some(NormalizedMessage {
            stream: stream.to_string(),
            payload: payload.clone(),
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use flate2::Compression;
    use flate2::write::DeflateEncoder;
    use serde_json::json;
    use std::io::Write as _;

    fn compress(value: &Value) -> String {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(serde_json::to_string(value).unwrap().as_bytes()).unwrap();
        BASE64.encode(enc.finish().unwrap())
    }

    #[test]
    fn classifies_empty_object_as_heartbeat() {
        let frame = parse_frame(&json!({}));
        assert!(frame.is_heartbeat);
        assert!(!frame.is_action);
        assert!(frame.pacing_timestamp.is_none());
        assert_eq!(frame.messages.len(), 1);
        assert_eq!(frame.messages[0].stream, "Heartbeat");
    }

    #[test]
    fn parses_incremental_frame() {
        let frame = parse_frame(&json!({
            "M": [{
                "H": "Streaming",
                "M": "feed",
                "A": ["TrackStatus", {"Status": "2", "Message": "Yellow"},
                      "2024-03-02T15:04:05.123Z"]
            }]
        }));
        assert!(frame.is_action);
        assert!(!frame.is_heartbeat);
        assert!(frame.pacing_timestamp.is_some());
        assert_eq!(frame.messages.len(), 1);
        assert_eq!(frame.messages[0].stream, "TrackStatus");
        assert_eq!(frame.messages[0].payload["Message"], "Yellow");
    }

    #[test]
    fn incremental_pacing_timestamp_is_last_entry() {
        let frame = parse_frame(&json!({
            "M": [
                {"M": "feed", "A": ["TrackStatus", {}, "2024-03-02T15:00:00Z"]},
                {"M": "feed", "A": ["TimingData", {}, "2024-03-02T15:00:07Z"]},
            ]
        }));
        let ts = frame.pacing_timestamp.unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-02T15:00:07+00:00");
        assert_eq!(frame.messages.len(), 2);
    }

    #[test]
    fn heartbeat_only_envelope_is_not_action() {
        let frame = parse_frame(&json!({
            "M": [{"M": "feed", "A": ["Heartbeat", {"Utc": "2024-03-02T15:00:00Z"},
                                      "2024-03-02T15:00:00Z"]}]
        }));
        assert!(!frame.is_action);
        assert!(frame.is_heartbeat);
        assert_eq!(frame.messages.len(), 1);
    }

    #[test]
    fn snapshot_never_drives_pacing() {
        let frame = parse_frame(&json!({
            "R": {
                "Heartbeat": {"Utc": "2024-03-02T15:00:00Z"},
                "TrackStatus": {"Status": "1", "Message": "AllClear"},
                "SessionInfo": {"Type": "Qualifying"},
            }
        }));
        assert!(frame.is_action);
        assert!(frame.pacing_timestamp.is_none());
        assert_eq!(frame.messages.len(), 3);
        // Streams without their own timestamp inherit the heartbeat's
        let track = frame.messages.iter().find(|m| m.stream == "TrackStatus").unwrap();
        assert_eq!(track.timestamp.as_deref(), Some("2024-03-02T15:00:00Z"));
    }

    #[test]
    fn decompresses_z_streams_and_strips_suffix() {
        let inner = json!({"Entries": {"1": {"Channels": {"2": 301}}}});
        let frame = parse_frame(&json!({
            "M": [{"M": "feed", "A": ["CarData.z", compress(&inner), "2024-03-02T15:00:00Z"]}]
        }));
        assert_eq!(frame.messages.len(), 1);
        assert_eq!(frame.messages[0].stream, "CarData");
        assert_eq!(frame.messages[0].payload, inner);
    }

    #[test]
    fn bad_compressed_entry_is_dropped_but_frame_survives() {
        let frame = parse_frame(&json!({
            "M": [
                {"M": "feed", "A": ["CarData.z", "!!garbage!!", "2024-03-02T15:00:00Z"]},
                {"M": "feed", "A": ["TrackStatus", {"Status": "1"}, "2024-03-02T15:00:01Z"]},
            ]
        }));
        assert_eq!(frame.messages.len(), 1);
        assert_eq!(frame.messages[0].stream, "TrackStatus");
        assert!(frame.is_action);
    }

    #[test]
    fn parses_bare_array_replay_line() {
        let frame = parse_frame(&json!(
            ["WeatherData", {"AirTemp": "24.1"}, "2024-03-02T15:00:00Z"]
        ));
        assert!(frame.is_action);
        assert!(frame.pacing_timestamp.is_some());
        assert_eq!(frame.messages[0].stream, "WeatherData");
    }

    #[test]
    fn control_frames_produce_nothing() {
        let frame = parse_frame(&json!({"C": "d-ABC123", "S": 1, "G": "groupToken"}));
        assert!(frame.messages.is_empty());
        assert!(!frame.is_action);
        assert!(!frame.is_heartbeat);
    }

    #[test]
    fn scalar_frames_are_skipped() {
        let frame = parse_frame(&json!(42));
        assert!(frame.messages.is_empty());
        assert!(!frame.is_action);
    }
}
