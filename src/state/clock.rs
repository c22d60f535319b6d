//! Session segment tracking and remaining-time extrapolation.
//!
//! Qualifying-style sessions run a fixed ladder of timed segments (Q1/Q2/Q3,
//! or SQ1/SQ2/SQ3 for a sprint shootout). The feed announces transitions via
//! `SessionStatus` entries in `SessionData`, and publishes the authoritative
//! clock via `ExtrapolatedClock` captures. Between captures the remaining
//! time is extrapolated:
//!
//! - **live**: `remaining = official − (now − capture) × speed`, where speed
//!   is 1 for a live feed and the replay multiplier during replay;
//! - **replay**: `remaining = scheduled − (processed − segment_start)`, both
//!   in feed time, which is immune to pacing jitter and stalls.
//!
//! A replay joined mid-segment cannot know the segment start; the first clock
//! capture showing enough remaining time is trusted to reconstruct it. Short
//! remainders are not trusted as anchors since a segment about to expire
//! gives the reconstruction no headroom.

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::debug;

use crate::config::REPLAY_ANCHOR_MIN_REMAINING_SECS;

/// The broad shape of a session, which decides the segment ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKind {
    Practice,
    Qualifying,
    SprintShootout,
    Race,
    #[default]
    Other,
}

impl SessionKind {
    /// Classifies a session from its feed `Type` and `Name` fields. The feed
    /// labels a sprint shootout as `Type: Qualifying`, so the name decides.
    pub fn from_session(session_type: Option<&str>, name: Option<&str>) -> Self {
        let name_lower = name.map(str::to_lowercase).unwrap_or_default();
        if name_lower.contains("sprint") && name_lower.contains("shootout") {
            return SessionKind::SprintShootout;
        }
        match session_type {
            Some("Qualifying") => SessionKind::Qualifying,
            Some("Practice") => SessionKind::Practice,
            Some("Race") => SessionKind::Race,
            _ => SessionKind::Other,
        }
    }

    /// The ordered timed segments this kind of session runs through.
    pub fn segment_order(&self) -> &'static [Segment] {
        match self {
            SessionKind::Qualifying => &[Segment::Q1, Segment::Q2, Segment::Q3],
            SessionKind::SprintShootout => &[Segment::Sq1, Segment::Sq2, Segment::Sq3],
            SessionKind::Practice => &[Segment::Practice],
            SessionKind::Race | SessionKind::Other => &[],
        }
    }
}

/// Where the session currently is on its segment ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Segment {
    #[default]
    NotStarted,
    Practice,
    PracticeEnded,
    Q1,
    Q2,
    Q3,
    Sq1,
    Sq2,
    Sq3,
    /// Gap between two timed segments.
    BetweenSegments,
    Ended,
}

impl Segment {
    /// Scheduled duration of a timed segment, in seconds.
    pub fn scheduled_duration(&self) -> Option<f64> {
        match self {
            Segment::Q1 => Some(18.0 * 60.0),
            Segment::Q2 => Some(15.0 * 60.0),
            Segment::Q3 => Some(12.0 * 60.0),
            Segment::Sq1 => Some(12.0 * 60.0),
            Segment::Sq2 => Some(10.0 * 60.0),
            Segment::Sq3 => Some(8.0 * 60.0),
            _ => None,
        }
    }

    pub fn is_timed(&self) -> bool {
        !matches!(
            self,
            Segment::NotStarted
                | Segment::PracticeEnded
                | Segment::BetweenSegments
                | Segment::Ended
        )
    }
}

/// Session status values from the `SessionData` status series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Unknown,
    Inactive,
    Started,
    Aborted,
    Suspended,
    Finished,
    Ends,
}

impl SessionStatus {
    pub fn from_feed(raw: &str) -> Self {
        match raw {
            "Inactive" => SessionStatus::Inactive,
            "Started" => SessionStatus::Started,
            "Aborted" => SessionStatus::Aborted,
            "Suspended" => SessionStatus::Suspended,
            "Finished" | "Finalised" => SessionStatus::Finished,
            "Ends" => SessionStatus::Ends,
            _ => SessionStatus::Unknown,
        }
    }

    fn halts_clock(&self) -> bool {
        matches!(
            self,
            SessionStatus::Aborted
                | SessionStatus::Inactive
                | SessionStatus::Suspended
                | SessionStatus::Finished
                | SessionStatus::Ends
        )
    }
}

/// The latest authoritative clock reading and when it was taken.
#[derive(Debug, Clone)]
struct ClockCapture {
    remaining: f64,
    at: Instant,
    speed: f64,
    extrapolating: bool,
}

/// Replay-time anchor: when the current segment started, in feed time.
#[derive(Debug, Clone)]
struct ReplayAnchor {
    segment_start: DateTime<Utc>,
    scheduled: f64,
}

/// Tracks segment progression and the session clock for one session.
#[derive(Debug, Clone, Default)]
pub struct SegmentClock {
    kind: SessionKind,
    current: Segment,
    previous: Segment,
    status: SessionStatus,
    capture: Option<ClockCapture>,
    anchor: Option<ReplayAnchor>,
    /// Set when an aborted segment resumes; the next clock capture clears it.
    /// While set, the frozen remaining value is reported as-is because the
    /// pre-abort capture no longer reflects the restarted clock.
    just_resumed: bool,
}

impl SegmentClock {
    pub fn set_kind(&mut self, kind: SessionKind) {
        if self.kind != kind {
            self.kind = kind;
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn current_segment(&self) -> Segment {
        self.current
    }

    pub fn previous_segment(&self) -> Segment {
        self.previous
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn just_resumed(&self) -> bool {
        self.just_resumed
    }

    /// Applies a session status transition. `feed_time` is the message's feed
    /// timestamp when available; it anchors replay extrapolation at segment
    /// starts.
    pub fn apply_status(&mut self, status: SessionStatus, feed_time: Option<DateTime<Utc>>) {
        let was = self.status;
        match status {
            SessionStatus::Started => {
                let interrupted = matches!(
                    was,
                    SessionStatus::Aborted | SessionStatus::Inactive | SessionStatus::Suspended
                );
                if interrupted && self.current.is_timed() {
                    // Red-flag resume: same segment, clock restarts from the
                    // frozen value.
                    self.just_resumed = true;
                    debug!(segment = ?self.current, "segment resumed after abort");
                } else {
                    self.advance_segment(feed_time);
                }
            }
            SessionStatus::Finished | SessionStatus::Ends => {
                if self.current.is_timed() {
                    self.previous = self.current;
                    let order = self.kind.segment_order();
                    self.current = if self.current == Segment::Practice {
                        Segment::PracticeEnded
                    } else if order.last() == Some(&self.current) {
                        Segment::Ended
                    } else {
                        Segment::BetweenSegments
                    };
                    self.anchor = None;
                    debug!(from = ?self.previous, to = ?self.current, "segment ended");
                }
                // The segment is over; nothing remains on its clock.
                if let Some(capture) = &mut self.capture {
                    capture.remaining = 0.0;
                }
            }
            SessionStatus::Aborted | SessionStatus::Inactive | SessionStatus::Suspended => {
                // Freeze the clock at the latest extrapolated value.
                if let Some(capture) = &mut self.capture {
                    if capture.extrapolating && !self.just_resumed {
                        let elapsed = capture.at.elapsed().as_secs_f64() * capture.speed;
                        capture.remaining = (capture.remaining - elapsed).max(0.0);
                        capture.at = Instant::now();
                    }
                }
            }
            SessionStatus::Unknown => {}
        }
        self.status = status;
    }

    fn advance_segment(&mut self, feed_time: Option<DateTime<Utc>>) {
        let order = self.kind.segment_order();
        if order.is_empty() {
            return;
        }
        let next = match order.iter().position(|s| *s == self.current) {
            Some(i) => order.get(i + 1).copied().unwrap_or(Segment::Ended),
            None if matches!(self.current, Segment::Ended | Segment::PracticeEnded) => {
                self.current
            }
            None => order[0],
        };
        if next == self.current {
            return;
        }
        self.previous = self.current;
        self.current = next;
        self.just_resumed = false;
        self.anchor = match (feed_time, next.scheduled_duration()) {
            (Some(start), Some(scheduled)) => {
                Some(ReplayAnchor { segment_start: start, scheduled })
            }
            _ => None,
        };
        debug!(from = ?self.previous, to = ?self.current, "segment started");
    }

    /// Records an `ExtrapolatedClock` capture.
    pub fn on_clock_capture(
        &mut self,
        remaining: f64,
        extrapolating: bool,
        now: Instant,
        speed: f64,
        feed_time: Option<DateTime<Utc>>,
    ) {
        self.capture = Some(ClockCapture { remaining, at: now, speed, extrapolating });
        self.just_resumed = false;
        self.maybe_prime_anchor(remaining, feed_time);
    }

    /// Reconstructs the segment-start anchor from a mid-segment clock
    /// reading. Only trusted when the segment still has real time left.
    fn maybe_prime_anchor(&mut self, remaining: f64, feed_time: Option<DateTime<Utc>>) {
        if self.anchor.is_some() || !self.current.is_timed() {
            return;
        }
        if self.status != SessionStatus::Started {
            return;
        }
        if remaining < REPLAY_ANCHOR_MIN_REMAINING_SECS {
            return;
        }
        let Some(feed_time) = feed_time else { return };
        let scheduled = self.current.scheduled_duration().unwrap_or(remaining);
        let elapsed = (scheduled - remaining).max(0.0);
        let segment_start = feed_time - chrono::Duration::milliseconds((elapsed * 1000.0) as i64);
        debug!(segment = ?self.current, remaining, "replay anchor primed from clock");
        self.anchor = Some(ReplayAnchor { segment_start, scheduled });
    }

    /// Remaining time by wall-clock extrapolation from the last capture.
    pub fn remaining_live(&self, now: Instant) -> Option<f64> {
        let capture = self.capture.as_ref()?;
        if !capture.extrapolating || self.status.halts_clock() || self.just_resumed {
            return Some(capture.remaining.max(0.0));
        }
        let elapsed = now.duration_since(capture.at).as_secs_f64() * capture.speed;
        Some((capture.remaining - elapsed).max(0.0))
    }

    /// Remaining time by feed-time extrapolation, for replay. `processed` is
    /// the feed timestamp of the most recently consumed message.
    pub fn remaining_replay(&self, processed: DateTime<Utc>) -> Option<f64> {
        let anchor = self.anchor.as_ref()?;
        let elapsed = (processed - anchor.segment_start)
            .num_milliseconds() as f64
            / 1000.0;
        Some((anchor.scheduled - elapsed.max(0.0)).max(0.0))
    }

    /// Re-anchors the wall-clock capture across a replay speed change so the
    /// extrapolated value stays continuous: the remaining time under the old
    /// speed becomes the new capture, taken now, at the new speed.
    pub fn reanchor_for_speed(&mut self, now: Instant, new_speed: f64) {
        let Some(capture) = &mut self.capture else { return };
        if capture.extrapolating && !self.just_resumed && !self.status.halts_clock() {
            let elapsed = now.duration_since(capture.at).as_secs_f64() * capture.speed;
            capture.remaining = (capture.remaining - elapsed).max(0.0);
        }
        capture.at = now;
        capture.speed = new_speed;
    }

    pub fn reset(&mut self) {
        *self = SegmentClock { kind: self.kind, ..SegmentClock::default() };
    }
}
