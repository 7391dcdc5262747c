//! Alignment of event timestamps to volume indices.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Recorded durations of zero fall back to this many seconds.
pub const DEFAULT_FALLBACK_DURATION_SECS: f64 = 6.0;
pub const DEFAULT_MIN_TRIAL_VOLUMES: usize = 3;

// Absorbs representation error in onset/TR quotients (0.3 / 0.1 = 2.9999...).
const INDEX_EPSILON: f64 = 1e-9;

/// Half-open volume range `[start_volume, end_volume)` of one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialWindow {
    pub start_volume: usize,
    pub end_volume: usize,
    pub length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    InvalidInput,
    OutOfBounds,
    TooShort,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::InvalidInput => write!(f, "invalid_input"),
            RejectionReason::OutOfBounds => write!(f, "out_of_bounds"),
            RejectionReason::TooShort => write!(f, "too_short"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowRejection {
    pub reason: RejectionReason,
    pub start_volume: i64,
    pub end_volume: i64,
}

impl fmt::Display for WindowRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (volumes {}..{})",
            self.reason, self.start_volume, self.end_volume
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialWindowResolver {
    pub min_length: usize,
    pub fallback_duration_secs: f64,
}

impl Default for TrialWindowResolver {
    fn default() -> Self {
        Self {
            min_length: DEFAULT_MIN_TRIAL_VOLUMES,
            fallback_duration_secs: DEFAULT_FALLBACK_DURATION_SECS,
        }
    }
}

impl TrialWindowResolver {
    pub fn new(min_length: usize, fallback_duration_secs: f64) -> Self {
        Self {
            min_length,
            fallback_duration_secs,
        }
    }

    pub fn resolve(
        &self,
        onset: f64,
        duration: f64,
        tr: f64,
        total_volumes: usize,
    ) -> Result<TrialWindow, WindowRejection> {
        let invalid = WindowRejection {
            reason: RejectionReason::InvalidInput,
            start_volume: 0,
            end_volume: 0,
        };
        if !onset.is_finite() || onset < 0.0 || !duration.is_finite() || duration < 0.0 {
            return Err(invalid);
        }
        if !tr.is_finite() || tr <= 0.0 || total_volumes == 0 {
            return Err(invalid);
        }

        let duration = if duration == 0.0 {
            self.fallback_duration_secs
        } else {
            duration
        };
        let start = volume_index(onset, tr);
        let end = volume_index(onset + duration, tr);
        let total = total_volumes as i64;

        if start >= total || end > total {
            return Err(WindowRejection {
                reason: RejectionReason::OutOfBounds,
                start_volume: start,
                end_volume: end,
            });
        }
        let length = end - start;
        if length < self.min_length as i64 || length <= 0 {
            return Err(WindowRejection {
                reason: RejectionReason::TooShort,
                start_volume: start,
                end_volume: end,
            });
        }

        Ok(TrialWindow {
            start_volume: start as usize,
            end_volume: end as usize,
            length: length as usize,
        })
    }

    /// The whole scan as a single window.
    pub fn full_scan(&self, total_volumes: usize) -> Result<TrialWindow, WindowRejection> {
        if total_volumes < self.min_length.max(1) {
            return Err(WindowRejection {
                reason: RejectionReason::TooShort,
                start_volume: 0,
                end_volume: total_volumes as i64,
            });
        }
        Ok(TrialWindow {
            start_volume: 0,
            end_volume: total_volumes,
            length: total_volumes,
        })
    }
}

fn volume_index(seconds: f64, tr: f64) -> i64 {
    (seconds / tr + INDEX_EPSILON).floor() as i64
}
