//! Controller reconnect backoff policy
//!
//! When a controller loses its connection it retries with exponential
//! backoff: `baseDelay × 2^attempt`, capped at `maxDelay`, for at most
//! `maxRetries` attempts. Two close codes suppress reconnection entirely
//! because retrying would just repeat the failure: 1008 (policy
//! violation) and 1011 (server error).

use std::time::Duration;

use crate::protocol::NO_RECONNECT_CLOSE_CODES;
use crate::{BASE_DELAY, MAX_DELAY};

/// Delay before reconnect attempt number `attempt` (zero-based).
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    // Saturate the shift; 2^attempt overflows quickly and the cap wins
    // anyway.
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Delay for an attempt under the default policy constants.
pub fn default_reconnect_delay(attempt: u32) -> Duration {
    reconnect_delay(attempt, BASE_DELAY, MAX_DELAY)
}

/// Whether a controller should attempt to reconnect after a close.
///
/// `close_code` is the WebSocket close code when one was received.
pub fn should_reconnect(close_code: Option<u16>, attempt: u32, max_retries: u32) -> bool {
    if attempt >= max_retries {
        return false;
    }
    match close_code {
        Some(code) => !NO_RECONNECT_CLOSE_CODES.contains(&code),
        None => true,
    }
}
