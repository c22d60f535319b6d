//! Aggregate session state.
//!
//! Everything the consumer writes and callers read lives in [`SessionState`],
//! guarded by a mutex owned by the session. The lock is only ever held for
//! synchronous work, never across an await point.

pub mod bests;
pub mod clock;
pub mod driver;
pub mod feed;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};

use crate::config::{RACE_CONTROL_LOG_CAPACITY, TEAM_RADIO_LOG_CAPACITY};
use crate::replay::ReplayOutcome;
pub use bests::{BestHolder, LapHistory, LapRecord, SessionBests};
pub use clock::{SegmentClock, SessionKind, SessionStatus, Segment};
pub use driver::{DriverTiming, StintRecord};

/// A fixed-capacity log that keeps the newest entries, newest first.
#[derive(Debug, Clone)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedLog<T> {
    pub fn new(capacity: usize) -> Self {
        BoundedLog { entries: VecDeque::with_capacity(capacity), capacity }
    }

    /// Pushes a new entry to the front, evicting the oldest when full.
    pub fn push(&mut self, entry: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front(entry);
    }

    /// Entries newest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// How the session is currently being fed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    #[default]
    Idle,
    Live,
    Replay,
}

/// Where the session is in its run lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Lifecycle {
    #[default]
    Idle,
    Connecting,
    Live,
    Replaying,
    Stopping,
    Stopped,
    Error(String),
}

/// Descriptive metadata from `SessionInfo`.
#[derive(Debug, Clone, Default)]
pub struct SessionDetails {
    pub key: Option<i64>,
    pub session_type: Option<String>,
    pub name: Option<String>,
    pub meeting_name: Option<String>,
    pub circuit_name: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub gmt_offset: Option<String>,
}

/// Latest track flag state.
#[derive(Debug, Clone, Default)]
pub struct TrackFlag {
    pub status: Option<String>,
    pub message: Option<String>,
}

/// Latest weather reading.
#[derive(Debug, Clone, Default)]
pub struct Weather {
    pub air_temp: Option<f64>,
    pub track_temp: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub rainfall: Option<f64>,
    pub wind_direction: Option<f64>,
    pub wind_speed: Option<f64>,
}

/// Race lap progress from `LapCount`.
#[derive(Debug, Clone, Default)]
pub struct LapProgress {
    pub current: Option<u32>,
    pub total: Option<u32>,
}

/// The full mutable state of one session.
#[derive(Debug)]
pub struct SessionState {
    pub mode: SessionMode,
    pub lifecycle: Lifecycle,
    pub details: SessionDetails,
    pub drivers: BTreeMap<String, DriverTiming>,
    pub bests: SessionBests,
    pub lap_history: BTreeMap<String, LapHistory>,
    pub clock: SegmentClock,
    pub track_flag: TrackFlag,
    pub weather: Weather,
    pub lap_progress: LapProgress,
    pub race_control: BoundedLog<feed::RaceControlMessage>,
    pub team_radio: BoundedLog<feed::TeamRadioCapture>,
    /// Track sectors currently under a local yellow.
    pub yellow_sectors: BTreeSet<u32>,
    pub last_heartbeat: Option<String>,
    /// Feed timestamp of the newest consumed message; drives replay-mode
    /// clock extrapolation.
    pub processed_feed_time: Option<DateTime<Utc>>,
    /// Current replay speed multiplier; 1 in live mode.
    pub replay_speed: f64,
    /// Terminal status of the most recent replay run.
    pub last_replay_outcome: Option<ReplayOutcome>,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState {
            mode: SessionMode::Idle,
            lifecycle: Lifecycle::Idle,
            details: SessionDetails::default(),
            drivers: BTreeMap::new(),
            bests: SessionBests::default(),
            lap_history: BTreeMap::new(),
            clock: SegmentClock::default(),
            track_flag: TrackFlag::default(),
            weather: Weather::default(),
            lap_progress: LapProgress::default(),
            race_control: BoundedLog::new(RACE_CONTROL_LOG_CAPACITY),
            team_radio: BoundedLog::new(TEAM_RADIO_LOG_CAPACITY),
            yellow_sectors: BTreeSet::new(),
            last_heartbeat: None,
            processed_feed_time: None,
            replay_speed: 1.0,
            last_replay_outcome: None,
        }
    }
}

impl SessionState {
    /// Clears all feed-derived state while keeping lifecycle bookkeeping.
    /// Used when a new session starts on the same feed connection and before
    /// each run.
    pub fn reset_feed_state(&mut self) {
        self.details = SessionDetails::default();
        self.drivers.clear();
        self.bests = SessionBests::default();
        self.lap_history.clear();
        self.clock.reset();
        self.track_flag = TrackFlag::default();
        self.weather = Weather::default();
        self.lap_progress = LapProgress::default();
        self.race_control.clear();
        self.team_radio.clear();
        self.yellow_sectors.clear();
        self.last_heartbeat = None;
        self.processed_feed_time = None;
    }

    pub fn driver_mut(&mut self, racing_number: &str) -> &mut DriverTiming {
        self.drivers
            .entry(racing_number.to_string())
            .or_insert_with(|| DriverTiming::new(racing_number))
    }
}
