//! Spaced-repetition scheduling arithmetic.
//!
//! A pure SM-2-shaped function consumed by the `schedule_review` tool. No
//! clock, no I/O: callers hold the state and stamp dates themselves.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Minimum ease factor; below this, intervals stop shrinking.
const EASE_FLOOR: f32 = 1.3;

/// Review scheduling state for a single item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReviewState {
    /// Consecutive successful recalls.
    pub repetitions: u32,
    /// Days until the next review.
    pub interval_days: u32,
    /// Growth factor applied to the interval after the second repetition.
    pub ease: f32,
}

impl Default for ReviewState {
    fn default() -> Self {
        Self {
            repetitions: 0,
            interval_days: 0,
            ease: 2.5,
        }
    }
}

/// Advances the schedule from one recall of quality `0..=5`.
///
/// Quality below 3 resets the repetition run to a one-day interval without
/// touching the ease factor; quality 3 and above grows the interval
/// (1 day, 6 days, then `interval × ease`) and adjusts ease toward the
/// answer quality, clamped at [`EASE_FLOOR`].
pub fn next_review(state: ReviewState, quality: u8) -> ReviewState {
    let quality = quality.min(5);
    if quality < 3 {
        return ReviewState {
            repetitions: 0,
            interval_days: 1,
            ease: state.ease,
        };
    }

    let interval_days = match state.repetitions {
        0 => 1,
        1 => 6,
        _ => (state.interval_days as f32 * state.ease).round() as u32,
    };

    let q = quality as f32;
    let ease = (state.ease + 0.1 - (5.0 - q) * (0.08 + (5.0 - q) * 0.02)).max(EASE_FLOOR);

    ReviewState {
        repetitions: state.repetitions + 1,
        interval_days,
        ease,
    }
}
