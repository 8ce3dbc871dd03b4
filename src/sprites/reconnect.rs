use rand::Rng;
use std::time::Duration;

use crate::sprites::SpriteError;

/// Maximum backoff cap: 10 seconds.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Error substrings that indicate a retry is worth attempting.
const TRANSIENT_MESSAGES: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection reset by peer",
    "no such host",
    "i/o timeout",
    "broken pipe",
    "websocket: close",
];

/// Whether an error is transient: a timeout anywhere on the error chain,
/// or a textual form matching the known transport failure messages.
///
/// Everything else is fatal: auth failures, malformed requests, and
/// cancellation must not be retried.
pub fn is_transient(err: &SpriteError) -> bool {
    if matches!(err, SpriteError::Cancelled | SpriteError::NotFound(_)) {
        return false;
    }

    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) {
                return true;
            }
        }
        source = e.source();
    }

    let text = err.to_string().to_lowercase();
    TRANSIENT_MESSAGES.iter().any(|msg| text.contains(msg))
}

/// Randomized backoff before retry `attempt` (1-based): uniform in
/// `[0, min(2^attempt, 10 s))`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let cap = Duration::from_secs(1u64 << attempt.clamp(1, 6)).min(MAX_BACKOFF);
    let cap_ms = cap.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..cap_ms))
}
