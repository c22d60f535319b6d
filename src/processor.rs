//! The single consumer task that folds feed messages into session state.
//!
//! Exactly one processor runs per session. It owns the receiving half of the
//! session queue and is the only writer of feed-derived state. Dispatch is a
//! fixed match on the canonical stream name; a handler failure is logged and
//! isolated to that one message, the loop itself only exits on cancellation
//! or when the producer side closes the queue.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};
use crate::state::feed::{
    AppDataLine, CarDataBatch, DriverEntry, ExtrapolatedClock, LapCount, PositionBatch,
    RaceControlMessage, SessionInfo, StintPatch, TeamRadioCapture, TimedValue, TimingLine,
    TrackStatus, WeatherData, indexed_entries,
};
use crate::state::{SessionKind, SessionMode, SessionState, SessionStatus, StintRecord};
use crate::time_utils::{parse_clock_to_seconds, parse_lap_time, parse_utc_timestamp};
use crate::wire::NormalizedMessage;

/// Runs the consumer loop until cancelled or the queue closes.
pub async fn run(
    state: Arc<Mutex<SessionState>>,
    mut rx: mpsc::Receiver<NormalizedMessage>,
    cancel: CancellationToken,
) {
    info!("state processor started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("state processor cancelled");
                break;
            }
            received = rx.recv() => {
                match received {
                    Some(msg) => {
                        let now = Instant::now();
                        let mut guard = match state.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        process_message(&mut guard, &msg, now);
                    }
                    None => {
                        debug!("queue closed, state processor exiting");
                        break;
                    }
                }
            }
        }
    }
    info!("state processor stopped");
}

/// Applies one message to the state. Handler errors are contained here.
pub(crate) fn process_message(state: &mut SessionState, msg: &NormalizedMessage, now: Instant) {
    let feed_time = msg.timestamp.as_deref().and_then(parse_utc_timestamp);
    if let Some(ts) = feed_time {
        state.processed_feed_time = Some(ts);
    }

    let result = match msg.stream.as_str() {
        "DriverList" => handle_driver_list(state, &msg.payload),
        "TimingData" => handle_timing_data(state, &msg.payload, now),
        "TimingAppData" => handle_timing_app_data(state, &msg.payload, now),
        "SessionInfo" => handle_session_info(state, &msg.payload),
        "SessionData" => handle_session_data(state, &msg.payload, feed_time),
        "SessionStatus" => handle_session_status(state, &msg.payload, feed_time),
        "TrackStatus" => handle_track_status(state, &msg.payload),
        "WeatherData" => handle_weather(state, &msg.payload),
        "RaceControlMessages" => handle_race_control(state, &msg.payload),
        "TeamRadio" => handle_team_radio(state, &msg.payload),
        "ExtrapolatedClock" => handle_extrapolated_clock(state, &msg.payload, feed_time, now),
        "Heartbeat" => handle_heartbeat(state, &msg.payload),
        "LapCount" => handle_lap_count(state, &msg.payload),
        "CarData" => handle_car_data(state, &msg.payload),
        "Position" => handle_position(state, &msg.payload),
        other => {
            debug!(stream = other, "no handler for stream");
            Ok(())
        }
    };
    if let Err(err) = result {
        warn!(stream = %msg.stream, error = %err, "message handling failed, state unchanged for it");
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(context: &str, value: &Value) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| FeedError::parse_error(context, e.to_string()))
}

fn handle_driver_list(state: &mut SessionState, payload: &Value) -> Result<()> {
    let Some(map) = payload.as_object() else {
        return Err(FeedError::parse_error("DriverList", "payload is not an object"));
    };
    for (number, value) in map.iter().filter(|(k, _)| !k.starts_with('_')) {
        let entry: DriverEntry = match parse_payload("DriverList entry", value) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(driver = %number, error = %err, "bad driver entry, skipping");
                continue;
            }
        };
        let driver = state.driver_mut(number);
        if entry.broadcast_name.is_some() {
            driver.broadcast_name = entry.broadcast_name;
        }
        if entry.full_name.is_some() {
            driver.full_name = entry.full_name;
        }
        if entry.tla.is_some() {
            driver.tla = entry.tla;
        }
        if entry.team_name.is_some() {
            driver.team_name = entry.team_name;
        }
        if entry.team_colour.is_some() {
            driver.team_colour = entry.team_colour;
        }
        if let Some(line) = entry.line {
            driver.position = Some(line);
        }
    }
    Ok(())
}

fn handle_timing_data(state: &mut SessionState, payload: &Value, now: Instant) -> Result<()> {
    let Some(lines) = payload.get("Lines").and_then(Value::as_object) else {
        // An update without Lines is legal and carries nothing we track.
        return Ok(());
    };
    for (number, value) in lines.iter().filter(|(k, _)| !k.starts_with('_')) {
        let line: TimingLine = match parse_payload("TimingData line", value) {
            Ok(line) => line,
            Err(err) => {
                warn!(driver = %number, error = %err, "bad timing line, skipping");
                continue;
            }
        };
        apply_timing_line(state, number, &line, now);
    }
    Ok(())
}

fn apply_timing_line(state: &mut SessionState, number: &str, line: &TimingLine, now: Instant) {
    let pit_speed = match state.mode {
        SessionMode::Replay => state.replay_speed,
        _ => 1.0,
    };

    let mut lap_candidate: Option<f64> = None;
    let mut sector_candidates: [Option<f64>; 3] = [None; 3];
    let mut completed_lap: Option<(u32, f64)> = None;

    {
        let driver = state.driver_mut(number);

        if let Some(position) = line.position.as_deref().and_then(|p| p.parse().ok()) {
            driver.position = Some(position);
        }
        if let Some(gap) = &line.gap_to_leader {
            driver.gap_to_leader = Some(gap.clone());
        }
        if let Some(interval) = &line.interval_to_position_ahead {
            if let Some(value) = &interval.value {
                driver.interval_ahead = Some(value.clone());
            }
        }

        if let Some(sectors) = &line.sectors {
            for (key, sector_value) in indexed_entries(sectors) {
                let Ok(index) = key.parse::<usize>() else { continue };
                if index >= 3 {
                    continue;
                }
                let Ok(timed) = serde_json::from_value::<TimedValue>(sector_value.clone()) else {
                    continue;
                };
                let slot = &mut driver.sectors[index];
                if let Some(seconds) = timed.value.as_deref().and_then(parse_lap_time) {
                    slot.seconds = Some(seconds);
                    sector_candidates[index] = Some(seconds);
                    let personal = &mut driver.personal_best_sectors[index];
                    if personal.is_none_or(|best| seconds < best) {
                        *personal = Some(seconds);
                        slot.personal_best = true;
                    }
                }
                if let Some(flag) = &timed.personal_fastest {
                    slot.personal_best = flag.as_bool();
                }
                if let Some(flag) = &timed.overall_fastest {
                    slot.overall_best = flag.as_bool();
                }
            }
        }

        if let Some(last) = &line.last_lap_time {
            if let Some(value) = &last.value {
                driver.last_lap.display = Some(value.clone());
                if let Some(seconds) = parse_lap_time(value) {
                    driver.last_lap.seconds = Some(seconds);
                    lap_candidate = Some(seconds);
                    if driver.personal_best_lap_seconds.is_none_or(|best| seconds < best) {
                        driver.personal_best_lap_seconds = Some(seconds);
                        driver.last_lap.personal_best = true;
                    }
                    if let Some(lap) = line.number_of_laps.or(driver.laps_completed) {
                        completed_lap = Some((lap, seconds));
                    }
                }
            }
            if let Some(flag) = &last.personal_fastest {
                driver.last_lap.personal_best = flag.as_bool();
            }
            if let Some(flag) = &last.overall_fastest {
                driver.last_lap.overall_best = flag.as_bool();
            }
        }

        if let Some(best) = &line.best_lap_time {
            if let Some(value) = &best.value {
                driver.best_lap.display = Some(value.clone());
                driver.best_lap.seconds = parse_lap_time(value);
            }
        }

        if let Some(retired) = &line.retired {
            driver.retired = retired.as_bool();
        }
        if let Some(stopped) = &line.stopped {
            driver.stopped = stopped.as_bool();
        }
        if let Some(knocked_out) = &line.knocked_out {
            driver.knocked_out = knocked_out.as_bool();
        }
        if let Some(laps) = line.number_of_laps {
            driver.laps_completed = Some(laps);
        }
        if let Some(stops) = line.number_of_pit_stops {
            driver.pit_stop_count = Some(stops);
        }
        if let Some(pit_out) = &line.pit_out {
            driver.pit_out = pit_out.as_bool();
        }

        // Pit stop timing works on InPit edges; retirement ends any open stop
        // without producing a display value.
        if let Some(in_pit) = &line.in_pit {
            let flag = in_pit.as_bool();
            if flag && !driver.in_pit && !driver.retired {
                driver.pit.enter(now, pit_speed);
            } else if !flag && driver.in_pit {
                driver.pit.exit(now);
            }
            driver.in_pit = flag;
        }
        if driver.retired && driver.pit.is_in_pit() {
            driver.pit.reset();
        }
    }

    if let Some((lap, seconds)) = completed_lap {
        let compound = state.drivers.get(number).and_then(|d| d.tyres.compound.clone());
        state
            .lap_history
            .entry(number.to_string())
            .or_default()
            .record(crate::state::LapRecord { lap, seconds, compound });
    }

    // Session benchmarks and overall-best flag ownership. Laps set while in
    // the pits, on an out lap, or after stopping are not representative and
    // never move a benchmark.
    let eligible = state
        .drivers
        .get(number)
        .is_some_and(|d| !(d.in_pit || d.pit_out || d.stopped || d.retired));
    if !eligible {
        return;
    }
    if let Some(seconds) = lap_candidate {
        if state.bests.offer_lap(number, seconds) {
            for (n, d) in state.drivers.iter_mut() {
                d.best_lap.overall_best = n == number;
            }
        }
    }
    for (index, candidate) in sector_candidates.iter().enumerate() {
        let Some(seconds) = candidate else { continue };
        if state.bests.offer_sector(index, number, *seconds) {
            for (n, d) in state.drivers.iter_mut() {
                d.sectors[index].overall_best = n == number;
            }
        }
    }
}

fn handle_timing_app_data(state: &mut SessionState, payload: &Value, now: Instant) -> Result<()> {
    let Some(lines) = payload.get("Lines").and_then(Value::as_object) else {
        return Ok(());
    };
    for (number, value) in lines.iter().filter(|(k, _)| !k.starts_with('_')) {
        let line: AppDataLine = match parse_payload("TimingAppData line", value) {
            Ok(line) => line,
            Err(err) => {
                warn!(driver = %number, error = %err, "bad app data line, skipping");
                continue;
            }
        };
        let Some(stints) = &line.stints else { continue };
        let entries = indexed_entries(stints);
        let driver = state.driver_mut(number);
        let mut max_stint = driver.stint_number;
        for (key, stint_value) in entries {
            let Ok(stint) = serde_json::from_value::<StintPatch>(stint_value.clone()) else {
                warn!(driver = %number, stint = %key, "bad stint patch, skipping");
                continue;
            };
            let index = key.parse::<usize>().ok();
            if let Some(i) = index {
                max_stint = max_stint.max(i as u32 + 1);
                // Stint patches arrive incrementally; grow the history and
                // merge into the addressed slot.
                if driver.stints.len() <= i {
                    driver.stints.resize_with(i + 1, StintRecord::default);
                }
                let record = &mut driver.stints[i];
                if stint.compound.is_some() {
                    record.compound = stint.compound.clone();
                }
                if let Some(is_new) = &stint.new {
                    record.is_new = is_new.as_bool();
                }
                if stint.start_laps.is_some() {
                    record.start_laps = stint.start_laps;
                }
                if stint.total_laps.is_some() {
                    record.total_laps = stint.total_laps;
                }
            }
            if let Some(compound) = stint.compound {
                driver.tyres.compound = Some(compound);
            }
            if let Some(is_new) = &stint.new {
                driver.tyres.is_new = is_new.as_bool();
            }
            if let Some(age) = stint.total_laps {
                driver.tyres.age_laps = Some(age);
            }
            // The feed occasionally reports the stop duration itself via
            // session-clock pit in/out times; trust it over edge timing.
            if let (Some(pit_in), Some(pit_out)) =
                (stint.pit_in_time.as_deref(), stint.pit_out_time.as_deref())
            {
                if let (Some(entered), Some(left)) =
                    (parse_clock_to_seconds(pit_in), parse_clock_to_seconds(pit_out))
                {
                    let duration = left - entered;
                    if duration > 0.0 {
                        driver.pit.set_feed_display(duration, now);
                    }
                }
            }
        }
        driver.stint_number = max_stint;
    }
    Ok(())
}

fn handle_session_info(state: &mut SessionState, payload: &Value) -> Result<()> {
    let info: SessionInfo = parse_payload("SessionInfo", payload)?;

    // A new session key on the same connection means a fresh session; all
    // accumulated feed state belongs to the old one.
    if let (Some(old), Some(new)) = (state.details.key, info.key) {
        if old != new {
            info!(old_key = old, new_key = new, "session changed, resetting feed state");
            state.reset_feed_state();
        }
    }

    if info.key.is_some() {
        state.details.key = info.key;
    }
    if info.session_type.is_some() {
        state.details.session_type = info.session_type.clone();
    }
    if info.name.is_some() {
        state.details.name = info.name.clone();
    }
    if info.start_date.is_some() {
        state.details.start_date = info.start_date.clone();
    }
    if info.end_date.is_some() {
        state.details.end_date = info.end_date.clone();
    }
    if info.gmt_offset.is_some() {
        state.details.gmt_offset = info.gmt_offset.clone();
    }
    if let Some(meeting) = &info.meeting {
        if meeting.name.is_some() {
            state.details.meeting_name = meeting.name.clone();
        }
        if let Some(circuit) = &meeting.circuit {
            if circuit.short_name.is_some() {
                state.details.circuit_name = circuit.short_name.clone();
            }
        }
    }

    let kind = SessionKind::from_session(
        state.details.session_type.as_deref(),
        state.details.name.as_deref(),
    );
    state.clock.set_kind(kind);
    Ok(())
}

fn handle_session_data(
    state: &mut SessionState,
    payload: &Value,
    frame_time: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<()> {
    let Some(series) = payload.get("StatusSeries") else {
        return Ok(());
    };
    for (_, value) in indexed_entries(series) {
        let entry: crate::state::feed::StatusSeriesEntry =
            match parse_payload("StatusSeries entry", value) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "bad status series entry, skipping");
                    continue;
                }
            };
        let entry_time = entry
            .utc
            .as_deref()
            .and_then(parse_utc_timestamp)
            .or(frame_time);
        if let Some(raw) = entry.session_status.as_deref() {
            state.clock.apply_status(SessionStatus::from_feed(raw), entry_time);
        }
        if let Some(track) = entry.track_status {
            state.track_flag.status = Some(track);
        }
    }
    Ok(())
}

fn handle_session_status(
    state: &mut SessionState,
    payload: &Value,
    frame_time: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<()> {
    if let Some(raw) = payload.get("Status").and_then(Value::as_str) {
        state.clock.apply_status(SessionStatus::from_feed(raw), frame_time);
    }
    Ok(())
}

fn handle_track_status(state: &mut SessionState, payload: &Value) -> Result<()> {
    let status: TrackStatus = parse_payload("TrackStatus", payload)?;
    if status.status.is_some() {
        state.track_flag.status = status.status;
    }
    if status.message.is_some() {
        state.track_flag.message = status.message;
    }
    Ok(())
}

fn handle_weather(state: &mut SessionState, payload: &Value) -> Result<()> {
    let weather: WeatherData = parse_payload("WeatherData", payload)?;
    let parse = |v: &Option<String>| v.as_deref().and_then(|s| s.trim().parse::<f64>().ok());
    if let Some(v) = parse(&weather.air_temp) {
        state.weather.air_temp = Some(v);
    }
    if let Some(v) = parse(&weather.track_temp) {
        state.weather.track_temp = Some(v);
    }
    if let Some(v) = parse(&weather.humidity) {
        state.weather.humidity = Some(v);
    }
    if let Some(v) = parse(&weather.pressure) {
        state.weather.pressure = Some(v);
    }
    if let Some(v) = parse(&weather.rainfall) {
        state.weather.rainfall = Some(v);
    }
    if let Some(v) = parse(&weather.wind_direction) {
        state.weather.wind_direction = Some(v);
    }
    if let Some(v) = parse(&weather.wind_speed) {
        state.weather.wind_speed = Some(v);
    }
    Ok(())
}

fn handle_race_control(state: &mut SessionState, payload: &Value) -> Result<()> {
    let Some(messages) = payload.get("Messages") else {
        return Ok(());
    };
    for (_, value) in indexed_entries(messages) {
        let message: RaceControlMessage = match parse_payload("RaceControlMessages entry", value) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "bad race control entry, skipping");
                continue;
            }
        };
        apply_yellow_sectors(state, &message);
        state.race_control.push(message);
    }
    Ok(())
}

/// Maintains the set of sectors under a local yellow from race control flag
/// messages. Track-wide green or clear wipes the set.
fn apply_yellow_sectors(state: &mut SessionState, message: &RaceControlMessage) {
    let Some(flag) = message.flag.as_deref() else { return };
    let sector_scoped = message.scope.as_deref() == Some("Sector");
    match flag {
        "YELLOW" | "DOUBLE YELLOW" if sector_scoped => {
            if let Some(sector) = message.sector {
                state.yellow_sectors.insert(sector);
            }
        }
        "CLEAR" if sector_scoped => {
            if let Some(sector) = message.sector {
                state.yellow_sectors.remove(&sector);
            }
        }
        "GREEN" | "CLEAR" => {
            if message.scope.as_deref() == Some("Track") {
                state.yellow_sectors.clear();
            }
        }
        _ => {}
    }
}

fn handle_team_radio(state: &mut SessionState, payload: &Value) -> Result<()> {
    let Some(captures) = payload.get("Captures") else {
        return Ok(());
    };
    for (_, value) in indexed_entries(captures) {
        match parse_payload::<TeamRadioCapture>("TeamRadio capture", value) {
            Ok(capture) => state.team_radio.push(capture),
            Err(err) => warn!(error = %err, "bad team radio capture, skipping"),
        }
    }
    Ok(())
}

fn handle_extrapolated_clock(
    state: &mut SessionState,
    payload: &Value,
    frame_time: Option<chrono::DateTime<chrono::Utc>>,
    now: Instant,
) -> Result<()> {
    let clock: ExtrapolatedClock = parse_payload("ExtrapolatedClock", payload)?;
    let Some(remaining) = clock.remaining.as_deref().and_then(parse_clock_to_seconds) else {
        return Ok(());
    };
    let extrapolating = clock.extrapolating.as_ref().map(|f| f.as_bool()).unwrap_or(true);
    let speed = match state.mode {
        SessionMode::Replay => state.replay_speed,
        _ => 1.0,
    };
    let capture_time = clock.utc.as_deref().and_then(parse_utc_timestamp).or(frame_time);
    state.clock.on_clock_capture(remaining, extrapolating, now, speed, capture_time);
    Ok(())
}

fn handle_heartbeat(state: &mut SessionState, payload: &Value) -> Result<()> {
    if let Some(utc) = payload.get("Utc").and_then(Value::as_str) {
        state.last_heartbeat = Some(utc.to_string());
    }
    Ok(())
}

fn handle_lap_count(state: &mut SessionState, payload: &Value) -> Result<()> {
    let count: LapCount = parse_payload("LapCount", payload)?;
    if count.current_lap.is_some() {
        state.lap_progress.current = count.current_lap;
    }
    if count.total_laps.is_some() {
        state.lap_progress.total = count.total_laps;
    }
    Ok(())
}

fn handle_car_data(state: &mut SessionState, payload: &Value) -> Result<()> {
    let Some(entries) = payload.get("Entries").and_then(Value::as_array) else {
        return Err(FeedError::parse_error("CarData", "missing Entries array"));
    };
    // Only the newest batch matters for current channel values.
    let Some(last) = entries.last() else {
        return Ok(());
    };
    let batch: CarDataBatch = parse_payload("CarData batch", last)?;
    for (number, entry) in &batch.cars {
        let driver = state.driver_mut(number);
        let channels = &entry.channels;
        if let Some(v) = channels.get("0") {
            driver.car.rpm = Some(*v);
        }
        if let Some(v) = channels.get("2") {
            driver.car.speed_kph = Some(*v);
        }
        if let Some(v) = channels.get("3") {
            driver.car.gear = Some(*v as i32);
        }
        if let Some(v) = channels.get("4") {
            driver.car.throttle = Some(*v);
        }
        if let Some(v) = channels.get("5") {
            driver.car.brake = Some(*v);
        }
        if let Some(v) = channels.get("45") {
            driver.car.drs = Some(*v);
        }
    }
    Ok(())
}

fn handle_position(state: &mut SessionState, payload: &Value) -> Result<()> {
    let Some(batches) = payload.get("Position").and_then(Value::as_array) else {
        return Err(FeedError::parse_error("Position", "missing Position array"));
    };
    let Some(last) = batches.last() else {
        return Ok(());
    };
    let batch: PositionBatch = parse_payload("Position batch", last)?;
    for (number, entry) in &batch.entries {
        let driver = state.driver_mut(number);
        driver.previous_track_position = driver.track_position.clone();
        driver.track_position.x = entry.x;
        driver.track_position.y = entry.y;
        if entry.status.is_some() {
            driver.track_position.status = entry.status.clone();
        }
    }
    Ok(())
}
