//! Session-wide best times and per-driver lap history.

use tracing::warn;

/// A best time together with the driver who holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct BestHolder {
    pub seconds: f64,
    pub driver: String,
}

/// Session-wide benchmarks: best lap and best time per sector.
///
/// A candidate replaces the incumbent only when strictly faster; ties keep
/// the earlier holder.
#[derive(Debug, Clone, Default)]
pub struct SessionBests {
    pub lap: Option<BestHolder>,
    pub sectors: [Option<BestHolder>; 3],
}

impl SessionBests {
    /// Offers a lap time; returns true when it becomes the new benchmark.
    pub fn offer_lap(&mut self, driver: &str, seconds: f64) -> bool {
        Self::offer(&mut self.lap, driver, seconds)
    }

    /// Offers a sector time for sector index 0-2.
    pub fn offer_sector(&mut self, index: usize, driver: &str, seconds: f64) -> bool {
        match self.sectors.get_mut(index) {
            Some(slot) => Self::offer(slot, driver, seconds),
            None => false,
        }
    }

    fn offer(slot: &mut Option<BestHolder>, driver: &str, seconds: f64) -> bool {
        if !seconds.is_finite() || seconds <= 0.0 {
            return false;
        }
        match slot {
            Some(holder) if seconds >= holder.seconds => false,
            _ => {
                *slot = Some(BestHolder { seconds, driver: driver.to_string() });
                true
            }
        }
    }
}

/// One completed lap for a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct LapRecord {
    pub lap: u32,
    pub seconds: f64,
    pub compound: Option<String>,
}

/// Per-driver lap history, append-only in lap-number order.
#[derive(Debug, Clone, Default)]
pub struct LapHistory {
    laps: Vec<LapRecord>,
}

impl LapHistory {
    /// Records a completed lap. Out-of-order or duplicate lap numbers are
    /// rejected; replay seeks and feed retransmits produce them.
    pub fn record(&mut self, record: LapRecord) -> bool {
        if let Some(last) = self.laps.last() {
            if record.lap <= last.lap {
                warn!(
                    lap = record.lap,
                    last = last.lap,
                    "non-monotonic lap number, ignoring"
                );
                return false;
            }
        }
        self.laps.push(record);
        true
    }

    pub fn laps(&self) -> &[LapRecord] {
        &self.laps
    }

    pub fn personal_best(&self) -> Option<&LapRecord> {
        self.laps
            .iter()
            .min_by(|a, b| a.seconds.partial_cmp(&b.seconds).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn clear(&mut self) {
        self.laps.clear();
    }
}
