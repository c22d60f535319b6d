//! Feed endpoint constants and per-session configuration.

use std::path::PathBuf;
use std::time::Duration;

/// HTTP endpoint used for the pre-socket negotiation handshake.
pub const NEGOTIATE_URL: &str = "https://livetiming.formula1.com/signalr";

/// Websocket endpoint the negotiated connection attaches to.
pub const WEBSOCKET_URL: &str = "wss://livetiming.formula1.com/signalr";

/// Hub name sent during negotiation and in the subscribe message.
pub const HUB_NAME: &str = "Streaming";

/// Client protocol version expected by the remote end.
pub const CLIENT_PROTOCOL: &str = "1.5";

/// Bounded capacity of the producer-to-consumer message queue.
pub const QUEUE_CAPACITY: usize = 1024;

/// Maximum retained race control messages (newest first).
pub const RACE_CONTROL_LOG_CAPACITY: usize = 50;

/// Maximum retained team radio captures (newest first).
pub const TEAM_RADIO_LOG_CAPACITY: usize = 20;

/// How long a completed pit stop duration stays displayable.
pub const PIT_DISPLAY_TTL: Duration = Duration::from_secs(15);

/// Minimum remaining time on the clock for a mid-segment replay join to be
/// trusted as a pacing anchor. Anything shorter is likely a dying segment and
/// extrapolating from it produces nonsense.
pub const REPLAY_ANCHOR_MIN_REMAINING_SECS: f64 = 240.0;

/// Hard cap on any single replay pacing sleep, in wall time.
pub const MAX_PACING_SLEEP: Duration = Duration::from_secs(5);

/// Granularity of interruptible pacing sleeps. Each chunk re-checks the stop
/// signal and re-reads the current replay speed.
pub const PACING_CHUNK: Duration = Duration::from_millis(50);

/// Upper bound on waiting for producer/consumer tasks to exit during stop.
pub const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Streams requested in the subscribe message after the socket opens.
pub fn default_streams() -> Vec<String> {
    [
        "Heartbeat",
        "CarData.z",
        "Position.z",
        "ExtrapolatedClock",
        "TimingStats",
        "TimingAppData",
        "WeatherData",
        "TrackStatus",
        "SessionStatus",
        "DriverList",
        "RaceControlMessages",
        "SessionInfo",
        "SessionData",
        "LapCount",
        "TimingData",
        "TeamRadio",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Configuration for a single session's feed handling.
///
/// The defaults point at the public timing endpoints and subscribe to the
/// full stream set; tests override the URLs and trim the stream list.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub negotiate_url: String,
    pub websocket_url: String,
    pub hub: String,
    pub streams: Vec<String>,
    /// When set, every raw inbound socket frame is appended to this file in
    /// the same line-per-frame format the replay engine reads back.
    pub record_to: Option<PathBuf>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            negotiate_url: NEGOTIATE_URL.to_string(),
            websocket_url: WEBSOCKET_URL.to_string(),
            hub: HUB_NAME.to_string(),
            streams: default_streams(),
            record_to: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_streams_cover_core_topics() {
        let streams = default_streams();
        assert!(streams.iter().any(|s| s == "TimingData"));
        assert!(streams.iter().any(|s| s == "SessionData"));
        assert!(streams.iter().any(|s| s == "CarData.z"));
        assert!(streams.iter().any(|s| s == "Heartbeat"));
    }

    #[test]
    fn default_config_points_at_public_endpoints() {
        let config = FeedConfig::default();
        assert!(config.negotiate_url.starts_with("https://"));
        assert!(config.websocket_url.starts_with("wss://"));
        assert_eq!(config.hub, "Streaming");
        assert!(config.record_to.is_none());
    }
}
