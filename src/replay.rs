//! Paced playback of recorded feed files.
//!
//! A recording is newline-delimited JSON: one wire frame per line, with
//! blank lines and `#` comment lines ignored. The engine replays frames in
//! file order, sleeping between them so that feed-time gaps are reproduced
//! in wall time divided by the speed multiplier.
//!
//! Pacing starts at an anchor: the first frame carrying real stream updates.
//! Everything before the anchor (snapshot, control frames, leading
//! heartbeats) is delivered immediately so state is primed without a wait.
//! Sleeps happen before the frame is enqueued, are clamped so one quiet gap
//! in the recording never stalls playback for more than a bounded wall
//! interval, and run in short chunks so both a stop request and a speed
//! change take effect mid-gap.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{MAX_PACING_SLEEP, PACING_CHUNK};
use crate::wire::{NormalizedMessage, parse_frame};

/// Terminal status of a replay run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The file was fully played back.
    Complete,
    /// A stop request interrupted playback.
    Stopped,
    /// The recording file does not exist.
    FileNotFound,
    /// An I/O failure interrupted playback.
    RuntimeError,
}

/// Plays one recording into a session queue.
pub struct ReplayEngine {
    path: PathBuf,
    speed: watch::Receiver<f64>,
    cancel: CancellationToken,
}

impl ReplayEngine {
    pub fn new(path: PathBuf, speed: watch::Receiver<f64>, cancel: CancellationToken) -> Self {
        ReplayEngine { path, speed, cancel }
    }

    pub async fn run(mut self, queue: mpsc::Sender<NormalizedMessage>) -> ReplayOutcome {
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                error!(path = %self.path.display(), "replay file not found");
                return ReplayOutcome::FileNotFound;
            }
            Err(err) => {
                error!(path = %self.path.display(), error = %err, "cannot open replay file");
                return ReplayOutcome::RuntimeError;
            }
        };
        info!(path = %self.path.display(), "replay started");

        let mut lines = BufReader::new(file).lines();
        let mut previous_feed_time: Option<DateTime<Utc>> = None;
        let mut last_delivery: Option<tokio::time::Instant> = None;
        let mut anchored = false;
        let mut line_number = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                info!("replay stopped by request");
                return ReplayOutcome::Stopped;
            }
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!(lines = line_number, "replay complete");
                    return ReplayOutcome::Complete;
                }
                Err(err) => {
                    error!(line = line_number + 1, error = %err, "replay read failed");
                    return ReplayOutcome::RuntimeError;
                }
            };
            line_number += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let raw: serde_json::Value = match serde_json::from_str(trimmed) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(line = line_number, error = %err, "malformed replay line, skipping");
                    continue;
                }
            };

            let frame = parse_frame(&raw);

            if let Some(feed_time) = frame.pacing_timestamp {
                if anchored {
                    if let Some(previous) = previous_feed_time {
                        let delta = (feed_time - previous).num_milliseconds() as f64 / 1000.0;
                        // Time already spent reading and delivering since the
                        // previous frame counts against the gap, so pacing does
                        // not drift behind the recording.
                        let consumed = last_delivery
                            .map(|at| at.elapsed().as_secs_f64() * *self.speed.borrow())
                            .unwrap_or(0.0);
                        if delta < 0.0 {
                            warn!(line = line_number, delta, "feed time went backwards, not pacing");
                        } else if !self.paced_sleep((delta - consumed).max(0.0)).await {
                            info!("replay stopped by request");
                            return ReplayOutcome::Stopped;
                        }
                    }
                } else if frame.is_action {
                    debug!(line = line_number, "pacing anchor set");
                    anchored = true;
                }
                previous_feed_time = Some(feed_time);
            }

            for message in frame.messages {
                match queue.try_send(message) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(message)) => {
                        warn!(stream = %message.stream, "queue full, dropping message");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        info!("queue closed, replay stopping");
                        return ReplayOutcome::Stopped;
                    }
                }
            }
            last_delivery = Some(tokio::time::Instant::now());
        }
    }

    /// Sleeps out a feed-time gap at the current speed. Returns false when a
    /// stop request interrupts the sleep. The total wall time spent on one
    /// gap is clamped; a long dead stretch in the recording is skipped over
    /// rather than waited out.
    async fn paced_sleep(&mut self, feed_gap_seconds: f64) -> bool {
        let mut remaining_feed = feed_gap_seconds;
        let mut wall_spent = std::time::Duration::ZERO;
        while remaining_feed > 0.0 && wall_spent < MAX_PACING_SLEEP {
            let speed = (*self.speed.borrow()).max(f64::MIN_POSITIVE);
            let wall_secs = (remaining_feed / speed).min(MAX_PACING_SLEEP.as_secs_f64());
            let wall_needed = std::time::Duration::from_secs_f64(wall_secs.max(0.0));
            let chunk = wall_needed.min(PACING_CHUNK).min(MAX_PACING_SLEEP - wall_spent);
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(chunk) => {}
            }
            wall_spent += chunk;
            remaining_feed -= chunk.as_secs_f64() * speed;
        }
        true
    }
}
