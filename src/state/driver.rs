//! Per-driver timing state.

use tokio::time::Instant;

use crate::config::PIT_DISPLAY_TTL;

/// One sector's latest time with its best-time markers.
#[derive(Debug, Clone, Default)]
pub struct SectorTime {
    pub seconds: Option<f64>,
    pub personal_best: bool,
    pub overall_best: bool,
}

/// A lap time with its best-time markers.
#[derive(Debug, Clone, Default)]
pub struct LapTime {
    pub seconds: Option<f64>,
    pub display: Option<String>,
    pub personal_best: bool,
    pub overall_best: bool,
}

/// Current tyre fitment.
#[derive(Debug, Clone, Default)]
pub struct TyreState {
    pub compound: Option<String>,
    pub age_laps: Option<u32>,
    pub is_new: bool,
}

/// One stint in the driver's tyre history, in feed order.
#[derive(Debug, Clone, Default)]
pub struct StintRecord {
    pub compound: Option<String>,
    pub is_new: bool,
    pub start_laps: Option<u32>,
    pub total_laps: Option<u32>,
}

/// Latest decoded car telemetry channels.
#[derive(Debug, Clone, Default)]
pub struct CarChannels {
    pub rpm: Option<f64>,
    pub speed_kph: Option<f64>,
    pub gear: Option<i32>,
    pub throttle: Option<f64>,
    pub brake: Option<f64>,
    pub drs: Option<f64>,
}

/// Latest track position sample.
#[derive(Debug, Clone, Default)]
pub struct PositionSample {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub status: Option<String>,
}

/// A measured pit stop duration, displayable until its TTL lapses.
#[derive(Debug, Clone)]
pub struct PitDisplay {
    pub seconds: f64,
    shown_at: Instant,
}

impl PitDisplay {
    pub fn is_visible(&self, now: Instant) -> bool {
        now.duration_since(self.shown_at) < PIT_DISPLAY_TTL
    }
}

/// Tracks an in-progress pit stop and the last measured duration.
///
/// Entry and exit are edges on the `InPit` flag. The duration is wall time
/// between the edges multiplied by the replay speed in effect at entry, so a
/// stop replayed at 2x reports its original feed duration.
#[derive(Debug, Clone, Default)]
pub struct PitTracker {
    entry: Option<PitEntry>,
    pub display: Option<PitDisplay>,
}

#[derive(Debug, Clone)]
struct PitEntry {
    at: Instant,
    speed: f64,
}

impl PitTracker {
    pub fn enter(&mut self, now: Instant, replay_speed: f64) {
        if self.entry.is_none() {
            self.entry = Some(PitEntry { at: now, speed: replay_speed });
        }
    }

    /// Closes an open stop and records its display duration. Returns the
    /// measured duration in feed seconds, or `None` if no stop was open.
    pub fn exit(&mut self, now: Instant) -> Option<f64> {
        let entry = self.entry.take()?;
        let seconds = now.duration_since(entry.at).as_secs_f64() * entry.speed;
        self.display = Some(PitDisplay { seconds, shown_at: now });
        Some(seconds)
    }

    pub fn is_in_pit(&self) -> bool {
        self.entry.is_some()
    }

    /// Records a duration the feed measured itself, bypassing edge timing.
    pub fn set_feed_display(&mut self, seconds: f64, now: Instant) {
        self.display = Some(PitDisplay { seconds, shown_at: now });
    }

    /// The last measured duration, if still within its display window.
    pub fn visible_display(&self, now: Instant) -> Option<f64> {
        self.display
            .as_ref()
            .filter(|d| d.is_visible(now))
            .map(|d| d.seconds)
    }

    pub fn reset(&mut self) {
        self.entry = None;
        self.display = None;
    }
}

/// Complete live picture for one car.
#[derive(Debug, Clone, Default)]
pub struct DriverTiming {
    pub racing_number: String,
    pub broadcast_name: Option<String>,
    pub full_name: Option<String>,
    pub tla: Option<String>,
    pub team_name: Option<String>,
    pub team_colour: Option<String>,

    pub position: Option<u32>,
    pub gap_to_leader: Option<String>,
    pub interval_ahead: Option<String>,

    pub sectors: [SectorTime; 3],
    pub last_lap: LapTime,
    pub best_lap: LapTime,
    /// Fastest lap seen for this driver, tracked independently of the feed's
    /// own `BestLapTime` field.
    pub personal_best_lap_seconds: Option<f64>,
    pub personal_best_sectors: [Option<f64>; 3],

    pub tyres: TyreState,
    pub stint_number: u32,
    pub stints: Vec<StintRecord>,

    pub in_pit: bool,
    pub pit_out: bool,
    pub retired: bool,
    pub stopped: bool,
    pub knocked_out: bool,
    pub laps_completed: Option<u32>,
    pub pit_stop_count: Option<u32>,
    pub pit: PitTracker,

    pub car: CarChannels,
    pub track_position: PositionSample,
    pub previous_track_position: PositionSample,
}

impl DriverTiming {
    pub fn new(racing_number: &str) -> Self {
        DriverTiming {
            racing_number: racing_number.to_string(),
            ..DriverTiming::default()
        }
    }

    /// One-word status for display, most severe flag first.
    pub fn status_text(&self) -> &'static str {
        if self.retired {
            "Retired"
        } else if self.stopped {
            "Stopped"
        } else if self.knocked_out {
            "Out"
        } else if self.in_pit {
            "Pit"
        } else if self.pit_out {
            "Out lap"
        } else {
            "On track"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn pit_duration_scales_with_replay_speed() {
        let mut pit = PitTracker::default();
        pit.enter(Instant::now(), 2.0);
        assert!(pit.is_in_pit());

        tokio::time::advance(Duration::from_secs(5)).await;
        let measured = pit.exit(Instant::now()).unwrap();
        assert!((measured - 10.0).abs() < 1e-6);
        assert!(!pit.is_in_pit());
    }

    #[tokio::test(start_paused = true)]
    async fn pit_display_expires_after_ttl() {
        let mut pit = PitTracker::default();
        pit.enter(Instant::now(), 1.0);
        tokio::time::advance(Duration::from_secs(3)).await;
        pit.exit(Instant::now());

        assert!(pit.visible_display(Instant::now()).is_some());
        tokio::time::advance(Duration::from_secs(14)).await;
        assert!(pit.visible_display(Instant::now()).is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(pit.visible_display(Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_entry_keeps_first_edge() {
        let mut pit = PitTracker::default();
        pit.enter(Instant::now(), 1.0);
        tokio::time::advance(Duration::from_secs(2)).await;
        pit.enter(Instant::now(), 5.0);
        tokio::time::advance(Duration::from_secs(2)).await;
        let measured = pit.exit(Instant::now()).unwrap();
        assert!((measured - 4.0).abs() < 1e-6);
    }

    #[test]
    fn status_text_orders_flags_by_severity() {
        let mut driver = DriverTiming::new("44");
        assert_eq!(driver.status_text(), "On track");
        driver.pit_out = true;
        assert_eq!(driver.status_text(), "Out lap");
        driver.in_pit = true;
        assert_eq!(driver.status_text(), "Pit");
        driver.knocked_out = true;
        assert_eq!(driver.status_text(), "Out");
        driver.retired = true;
        assert_eq!(driver.status_text(), "Retired");
    }

    #[tokio::test]
    async fn exit_without_entry_is_a_no_op() {
        let mut pit = PitTracker::default();
        assert!(pit.exit(Instant::now()).is_none());
        assert!(pit.display.is_none());
    }
}
