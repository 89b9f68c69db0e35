//! Retry delay schedule for retryable delivery failures.

use chrono::Duration;

/// Delay before the next attempt, in minutes, indexed by attempt number - 1.
const SCHEDULE_MINUTES: [i64; 5] = [1, 5, 30, 120, 360];

/// Delay to wait after the `attempt_count`-th failed attempt.
///
/// Attempts past the end of the schedule reuse the last step. An attempt
/// count of zero is treated as the first attempt.
pub fn backoff(attempt_count: i32) -> Duration {
    let index = (attempt_count.max(1) as usize - 1).min(SCHEDULE_MINUTES.len() - 1);
    Duration::minutes(SCHEDULE_MINUTES[index])
}
