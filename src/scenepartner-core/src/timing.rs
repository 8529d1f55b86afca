//! Speaking-time estimates used to pace automatic advances.

use std::time::Duration;

use serde::Deserialize;

/// Typical speaking speed at rate 1.0.
pub const DEFAULT_WORDS_PER_SECOND: f64 = 2.5;

/// Rates below this are treated as this value.
pub const MIN_RATE: f64 = 0.6;

/// Floor and fixed overhead applied to a raw estimate.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PacingProfile {
    pub floor_seconds: f64,
    #[serde(default)]
    pub overhead_seconds: f64,
}

impl PacingProfile {
    /// Partner lines: keep short lines on screen long enough to be read.
    pub const PARTNER: PacingProfile = PacingProfile {
        floor_seconds: 1.0,
        overhead_seconds: 0.35,
    };

    /// Performer lines when not waiting for the user.
    pub const PERFORMER: PacingProfile = PacingProfile {
        floor_seconds: 1.5,
        overhead_seconds: 0.0,
    };
}

/// Number of whitespace-delimited words in `text`.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Estimated seconds to speak `text` at `rate` times the normal speed.
pub fn estimate_seconds(
    text: &str,
    words_per_second: f64,
    rate: f64,
    profile: PacingProfile,
) -> f64 {
    let rate = if rate.is_finite() { rate.max(MIN_RATE) } else { MIN_RATE };
    let speed = words_per_second * rate;
    let raw = if speed > 0.0 {
        word_count(text) as f64 / speed
    } else {
        0.0
    };

    profile.floor_seconds.max(raw + profile.overhead_seconds)
}

/// [`estimate_seconds`] at the default speaking speed, as a [`Duration`].
pub fn estimate(text: &str, rate: f64, profile: PacingProfile) -> Duration {
    seconds(estimate_seconds(text, DEFAULT_WORDS_PER_SECOND, rate, profile))
}

/// Convert seconds to a [`Duration`], clamping negatives and NaN to zero.
pub fn seconds(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}
