//! General utilities shared across the application.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::airplay::traits::{SessionError, SessionResult};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Unix timestamp (milliseconds) of a point `delay` from now.
#[must_use]
pub fn millis_from_now(delay: Duration) -> u64 {
    now_millis().saturating_add(delay.as_millis() as u64)
}

// ─────────────────────────────────────────────────────────────────────────────
// Bounded I/O
// ─────────────────────────────────────────────────────────────────────────────

/// Runs a session operation under an explicit timeout and a cancellation token.
///
/// Exceeding the timeout is reported as [`SessionError::Timeout`], which callers
/// treat exactly like a failure response from the peer. Cancellation wins over
/// both and yields [`SessionError::Cancelled`].
pub(crate) async fn bounded<T, F>(
    cancel: &CancellationToken,
    limit: Duration,
    operation: F,
) -> SessionResult<T>
where
    F: Future<Output = SessionResult<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SessionError::Cancelled),
        result = tokio::time::timeout(limit, operation) => match result {
            Ok(inner) => inner,
            Err(_) => Err(SessionError::Timeout(limit)),
        },
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`.
///
/// `attempt` is 1-based; attempt 0 is treated as 1.
#[must_use]
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, max, 5), Duration::from_secs(32));
        assert_eq!(backoff_delay(base, max, 6), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, max, 40), Duration::from_secs(60));
    }

    #[test]
    fn backoff_treats_zero_as_first_attempt() {
        let base = Duration::from_secs(2);
        assert_eq!(
            backoff_delay(base, Duration::from_secs(60), 0),
            Duration::from_secs(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_reports_timeout() {
        let cancel = CancellationToken::new();
        let result: SessionResult<()> = bounded(&cancel, Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(SessionError::Timeout(_))));
    }

    #[tokio::test]
    async fn bounded_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = bounded(&cancel, Duration::from_secs(1), async { Ok(7) }).await;
        assert!(matches!(result, Err(SessionError::Cancelled)));
    }
}
