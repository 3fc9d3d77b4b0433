//! Simulated clock and scaled timing parameters.
//!
//! Every duration in the configuration is expressed in simulated minutes.
//! The director scales them to wall-clock milliseconds once, stores the
//! result in the shared state segment, and every worker reads the same
//! [`Timing`] back from there.

use nix::time::{clock_gettime, ClockId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a unit's capacity permits return to the gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleasePoint {
    /// Registration releases when it forwards the unit to triage.
    #[default]
    Registration,
    /// Permits stay held until triage sends the unit home or a specialist finishes.
    Terminal,
}

impl ReleasePoint {
    /// Stable integer code used in the shared state segment.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Registration => 0,
            Self::Terminal => 1,
        }
    }

    /// Decode a shared state code; unknown values fall back to the default.
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Terminal,
            _ => Self::Registration,
        }
    }
}

/// Inclusive range of wall-clock milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsRange {
    pub min: u64,
    pub max: u64,
}

impl MsRange {
    #[must_use]
    pub const fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }
}

/// Scale simulated minutes to wall-clock milliseconds.
///
/// Positive inputs never scale below 1 ms so a tiny range still yields
/// a real pause.
#[must_use]
pub fn scale_minutes(minutes: f64, ms_per_sim_minute: u64) -> u64 {
    if minutes <= 0.0 || ms_per_sim_minute == 0 {
        return 0;
    }
    let ms = (minutes * ms_per_sim_minute as f64).round();
    (ms as u64).max(1)
}

/// Milliseconds on the monotonic clock, shared across processes on one host.
#[must_use]
pub fn monotonic_ms() -> i64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as i64) * 1000 + (ts.tv_nsec() as i64) / 1_000_000,
        Err(_) => 0,
    }
}

/// Whole simulated minutes between two monotonic readings (pure function).
#[must_use]
pub fn elapsed_sim_minutes(start_ms: i64, now_ms: i64, ms_per_sim_minute: u64) -> i64 {
    if ms_per_sim_minute == 0 {
        return 0;
    }
    (now_ms - start_ms).max(0) / ms_per_sim_minute as i64
}

/// Scaled parameters shared with every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub ms_per_sim_minute: u64,
    pub duration_minutes: u64,
    pub arrival: MsRange,
    pub registration: MsRange,
    pub triage: MsRange,
    pub exam: MsRange,
    pub leave: MsRange,
    pub max_live_patients: u32,
    pub send_retry_limit: u32,
    pub send_backoff: Duration,
    pub poll_interval: Duration,
    pub seed: u64,
    pub release_point: ReleasePoint,
    pub sim_start_ms: i64,
}

impl Timing {
    /// Simulated minutes since the director started the clock.
    #[must_use]
    pub fn elapsed_minutes(&self) -> i64 {
        elapsed_sim_minutes(self.sim_start_ms, monotonic_ms(), self.ms_per_sim_minute)
    }

    /// Whether the configured run length has passed.
    #[must_use]
    pub fn duration_elapsed(&self) -> bool {
        self.elapsed_minutes() >= self.duration_minutes as i64
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            ms_per_sim_minute: 100,
            duration_minutes: 60,
            arrival: MsRange::default(),
            registration: MsRange::default(),
            triage: MsRange::default(),
            exam: MsRange::default(),
            leave: MsRange::default(),
            max_live_patients: 2000,
            send_retry_limit: 5000,
            send_backoff: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
            seed: 12345,
            release_point: ReleasePoint::default(),
            sim_start_ms: monotonic_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_minutes() {
        assert_eq!(scale_minutes(0.5, 100), 50);
        assert_eq!(scale_minutes(2.5, 100), 250);
        assert_eq!(scale_minutes(0.0, 100), 0);
        assert_eq!(scale_minutes(-1.0, 100), 0);
        // Positive inputs keep a 1 ms floor.
        assert_eq!(scale_minutes(0.001, 10), 1);
    }

    #[test]
    fn test_elapsed_sim_minutes() {
        assert_eq!(elapsed_sim_minutes(1_000, 1_000, 100), 0);
        assert_eq!(elapsed_sim_minutes(1_000, 1_099, 100), 0);
        assert_eq!(elapsed_sim_minutes(1_000, 1_100, 100), 1);
        assert_eq!(elapsed_sim_minutes(1_000, 7_000, 100), 60);
        assert_eq!(elapsed_sim_minutes(5_000, 1_000, 100), 0);
        assert_eq!(elapsed_sim_minutes(0, 1_000, 0), 0);
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let first = monotonic_ms();
        std::thread::sleep(Duration::from_millis(2));
        assert!(monotonic_ms() >= first);
    }

    #[test]
    fn test_release_point_codes() {
        assert_eq!(ReleasePoint::from_code(ReleasePoint::Terminal.code()), ReleasePoint::Terminal);
        assert_eq!(ReleasePoint::from_code(0), ReleasePoint::Registration);
        assert_eq!(ReleasePoint::from_code(42), ReleasePoint::Registration);
    }
}
