//! A session: one isolated feed context with its producer/consumer pair.
//!
//! Each session owns its state, its bounded queue, and its stop signal. At
//! most one producer (live connection or replay) and exactly one consumer run
//! at a time; starting while a run is active is an error, not an implicit
//! restart. The state mutex is synchronous and is never held across an await
//! point.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{FeedConfig, QUEUE_CAPACITY, SHUTDOWN_JOIN_TIMEOUT};
use crate::connect::{LiveConnector, LiveOutcome};
use crate::error::{FeedError, Result};
use crate::processor;
use crate::replay::{ReplayEngine, ReplayOutcome};
use crate::state::{Lifecycle, SessionMode, SessionState};

/// How cleanly a stop request brought the session's tasks down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Producer task exited within the shutdown window.
    pub producer_clean: bool,
    /// Consumer task exited within the shutdown window.
    pub consumer_clean: bool,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.producer_clean && self.consumer_clean
    }
}

#[derive(Default)]
struct Tasks {
    cancel: Option<CancellationToken>,
    producer: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

/// One user's feed context.
pub struct Session {
    id: String,
    config: FeedConfig,
    state: Arc<Mutex<SessionState>>,
    speed: watch::Sender<f64>,
    tasks: Mutex<Tasks>,
}

fn lock<'a>(state: &'a Mutex<SessionState>) -> MutexGuard<'a, SessionState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Session {
    pub fn new(id: impl Into<String>, config: FeedConfig) -> Arc<Self> {
        let (speed, _) = watch::channel(1.0);
        Arc::new(Session {
            id: id.into(),
            config,
            state: Arc::new(Mutex::new(SessionState::default())),
            speed,
            tasks: Mutex::new(Tasks::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Locks and returns the session state. Hold the guard briefly.
    pub fn state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }

    pub fn replay_speed(&self) -> f64 {
        *self.speed.borrow()
    }

    /// Whether a producer run is currently active.
    pub fn is_running(&self) -> bool {
        let tasks = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.producer.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Changes the replay speed multiplier, re-anchoring clock extrapolation
    /// so the displayed remaining time stays continuous across the change.
    pub fn set_replay_speed(&self, speed: f64) -> Result<()> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(FeedError::InvalidSpeed { value: speed });
        }
        {
            let mut state = lock(&self.state);
            if state.mode == SessionMode::Replay {
                state.clock.reanchor_for_speed(Instant::now(), speed);
            }
            state.replay_speed = speed;
        }
        self.speed.send_replace(speed);
        info!(session = %self.id, speed, "replay speed set");
        Ok(())
    }

    /// Starts a replay run from a recording file.
    pub fn start_replay(self: &Arc<Self>, path: PathBuf) -> Result<()> {
        let mut tasks = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if tasks.producer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(FeedError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        {
            let mut state = lock(&self.state);
            state.reset_feed_state();
            state.mode = SessionMode::Replay;
            state.lifecycle = Lifecycle::Replaying;
            state.last_replay_outcome = None;
        }
        info!(session = %self.id, path = %path.display(), "starting replay");

        tasks.consumer = Some(tokio::spawn(processor::run(
            self.state.clone(),
            rx,
            cancel.clone(),
        )));

        let engine = ReplayEngine::new(path, self.speed.subscribe(), cancel.clone());
        let state = self.state.clone();
        let id = self.id.clone();
        tasks.producer = Some(tokio::spawn(async move {
            let outcome = engine.run(tx).await;
            info!(session = %id, ?outcome, "replay ended");
            let mut guard = lock(&state);
            guard.last_replay_outcome = Some(outcome);
            guard.lifecycle = match outcome {
                ReplayOutcome::Complete | ReplayOutcome::Stopped => Lifecycle::Stopped,
                ReplayOutcome::FileNotFound => {
                    Lifecycle::Error("replay file not found".to_string())
                }
                ReplayOutcome::RuntimeError => Lifecycle::Error("replay failed".to_string()),
            };
        }));
        tasks.cancel = Some(cancel);
        Ok(())
    }

    /// Starts a live feed run.
    pub fn start_live(self: &Arc<Self>) -> Result<()> {
        let mut tasks = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if tasks.producer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(FeedError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        {
            let mut state = lock(&self.state);
            state.reset_feed_state();
            state.mode = SessionMode::Live;
            state.lifecycle = Lifecycle::Connecting;
            state.replay_speed = 1.0;
        }
        self.speed.send_replace(1.0);
        info!(session = %self.id, "starting live feed");

        tasks.consumer = Some(tokio::spawn(processor::run(
            self.state.clone(),
            rx,
            cancel.clone(),
        )));

        let connector = LiveConnector::new(self.config.clone(), cancel.clone());
        let state = self.state.clone();
        let id = self.id.clone();
        tasks.producer = Some(tokio::spawn(async move {
            match connector.connect().await {
                Ok(feed) => {
                    lock(&state).lifecycle = Lifecycle::Live;
                    match feed.pump(tx).await {
                        Ok(LiveOutcome::Closed) => {
                            warn!(session = %id, "live feed closed");
                            lock(&state).lifecycle = Lifecycle::Stopped;
                        }
                        Ok(LiveOutcome::Stopped) => {
                            lock(&state).lifecycle = Lifecycle::Stopped;
                        }
                        Err(err) => {
                            error!(session = %id, error = %err, "live feed failed");
                            lock(&state).lifecycle = Lifecycle::Error(err.to_string());
                        }
                    }
                }
                Err(err) => {
                    error!(session = %id, error = %err, "live connection failed");
                    lock(&state).lifecycle = Lifecycle::Error(err.to_string());
                }
            }
        }));
        tasks.cancel = Some(cancel);
        Ok(())
    }

    /// Requests a cooperative stop and waits, bounded, for both tasks.
    pub async fn stop(&self) -> ShutdownReport {
        let (cancel, producer, consumer) = {
            let mut tasks = match self.tasks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            (tasks.cancel.take(), tasks.producer.take(), tasks.consumer.take())
        };
        if cancel.is_none() && producer.is_none() && consumer.is_none() {
            return ShutdownReport { producer_clean: true, consumer_clean: true };
        }

        {
            let mut state = lock(&self.state);
            state.lifecycle = Lifecycle::Stopping;
        }
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        let report = ShutdownReport {
            producer_clean: join_within(producer, "producer").await,
            consumer_clean: join_within(consumer, "consumer").await,
        };

        {
            let mut state = lock(&self.state);
            if state.lifecycle == Lifecycle::Stopping {
                state.lifecycle = Lifecycle::Stopped;
            }
        }
        info!(session = %self.id, clean = report.is_clean(), "session stopped");
        report
    }

    /// Clears accumulated state. Only valid while no run is active.
    pub fn reset(&self) -> Result<()> {
        if self.is_running() {
            return Err(FeedError::AlreadyRunning);
        }
        let mut state = lock(&self.state);
        state.reset_feed_state();
        state.mode = SessionMode::Idle;
        state.lifecycle = Lifecycle::Idle;
        state.last_replay_outcome = None;
        state.replay_speed = 1.0;
        drop(state);
        self.speed.send_replace(1.0);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.lock() {
            if let Some(cancel) = &tasks.cancel {
                cancel.cancel();
            }
        }
    }
}

async fn join_within(handle: Option<JoinHandle<()>>, role: &str) -> bool {
    let Some(handle) = handle else { return true };
    match tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await {
        Ok(Ok(())) => true,
        Ok(Err(join_err)) => {
            warn!(role, error = %join_err, "task did not exit cleanly");
            false
        }
        Err(_) => {
            warn!(role, "task did not exit within the shutdown window");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::time::Duration;

    fn write_recording(name: &str, lines: &[&str]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "session-{name}-{}-{}.txt",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    async fn wait_until(session: &Arc<Session>, predicate: impl Fn(&SessionState) -> bool) {
        for _ in 0..500 {
            {
                let state = session.state();
                if predicate(&state) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn replay_run_reaches_completion_and_updates_state() {
        let path = write_recording(
            "complete",
            &[
                "# header",
                r#"{"R": {"TrackStatus": {"Status": "1", "Message": "AllClear"}}}"#,
                r#"{"M": [{"M": "feed", "A": ["TrackStatus", {"Status": "2", "Message": "Yellow"}, "2024-03-02T15:00:00Z"]}]}"#,
            ],
        );
        let session = Session::new("alice", FeedConfig::default());
        session.start_replay(path.clone()).unwrap();
        wait_until(&session, |s| s.last_replay_outcome.is_some()).await;
        // Consumer drains the queue after the producer finishes.
        wait_until(&session, |s| s.track_flag.message.as_deref() == Some("Yellow")).await;

        let state = session.state();
        assert_eq!(state.last_replay_outcome, Some(ReplayOutcome::Complete));
        assert_eq!(state.lifecycle, Lifecycle::Stopped);
        assert_eq!(state.mode, SessionMode::Replay);
        drop(state);
        std::fs::remove_file(path).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_replay_file_becomes_an_error_lifecycle() {
        let session = Session::new("bob", FeedConfig::default());
        session.start_replay(PathBuf::from("/no/such/recording.txt")).unwrap();
        wait_until(&session, |s| s.last_replay_outcome.is_some()).await;
        let state = session.state();
        assert_eq!(state.last_replay_outcome, Some(ReplayOutcome::FileNotFound));
        assert!(matches!(state.lifecycle, Lifecycle::Error(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_while_running_is_rejected() {
        let path = write_recording(
            "busy",
            &[
                r#"{"M": [{"M": "feed", "A": ["TrackStatus", {"Status": "1"}, "2024-03-02T15:00:00Z"]}]}"#,
                r#"{"M": [{"M": "feed", "A": ["TrackStatus", {"Status": "2"}, "2024-03-02T16:00:00Z"]}]}"#,
            ],
        );
        let session = Session::new("carol", FeedConfig::default());
        session.start_replay(path.clone()).unwrap();
        let second = session.start_replay(path.clone());
        assert!(matches!(second, Err(FeedError::AlreadyRunning)));
        session.stop().await;
        std::fs::remove_file(path).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_replay_cleanly() {
        let path = write_recording(
            "stop",
            &[
                r#"{"M": [{"M": "feed", "A": ["TrackStatus", {"Status": "1"}, "2024-03-02T15:00:00Z"]}]}"#,
                r#"{"M": [{"M": "feed", "A": ["TrackStatus", {"Status": "2"}, "2024-03-02T16:00:00Z"]}]}"#,
            ],
        );
        let session = Session::new("dave", FeedConfig::default());
        session.start_replay(path.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = session.stop().await;
        assert!(report.is_clean());
        let state = session.state();
        assert_eq!(state.lifecycle, Lifecycle::Stopped);
        assert_eq!(state.last_replay_outcome, Some(ReplayOutcome::Stopped));
        drop(state);
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn stop_without_a_run_is_clean() {
        let session = Session::new("erin", FeedConfig::default());
        let report = session.stop().await;
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn speed_validation_rejects_bad_values() {
        let session = Session::new("frank", FeedConfig::default());
        assert!(matches!(
            session.set_replay_speed(0.0),
            Err(FeedError::InvalidSpeed { .. })
        ));
        assert!(matches!(
            session.set_replay_speed(-2.0),
            Err(FeedError::InvalidSpeed { .. })
        ));
        assert!(matches!(
            session.set_replay_speed(f64::NAN),
            Err(FeedError::InvalidSpeed { .. })
        ));
        assert!(matches!(
            session.set_replay_speed(f64::INFINITY),
            Err(FeedError::InvalidSpeed { .. })
        ));
        session.set_replay_speed(4.0).unwrap();
        assert_eq!(session.replay_speed(), 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_is_rejected_while_running_and_works_after_stop() {
        let path = write_recording(
            "reset",
            &[
                r#"{"M": [{"M": "feed", "A": ["TrackStatus", {"Status": "1"}, "2024-03-02T15:00:00Z"]}]}"#,
                r#"{"M": [{"M": "feed", "A": ["TrackStatus", {"Status": "2"}, "2024-03-02T16:00:00Z"]}]}"#,
            ],
        );
        let session = Session::new("grace", FeedConfig::default());
        session.start_replay(path.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(session.reset(), Err(FeedError::AlreadyRunning)));

        session.stop().await;
        session.reset().unwrap();
        let state = session.state();
        assert_eq!(state.lifecycle, Lifecycle::Idle);
        assert_eq!(state.mode, SessionMode::Idle);
        assert!(state.last_replay_outcome.is_none());
        drop(state);
        std::fs::remove_file(path).ok();
    }
}
