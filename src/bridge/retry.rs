use std::time::Duration;

use tracing::warn;

use crate::error::BridgeError;

/// Runs `op` up to `attempts` times, backing off exponentially between
/// transient failures. Permanent failures return immediately.
pub async fn retry_transient<T, F, Fut>(
    attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, BridgeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = base_delay.saturating_mul(1 << (attempt - 1).min(16));
                warn!(
                    "attempt {}/{} failed, retrying in {:?}: {}",
                    attempt, attempts, delay, e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::db::MappingKind;

    fn transient() -> BridgeError {
        BridgeError::MatrixRequest("502 bad gateway".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_with_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result = retry_transient(3, Duration::from_millis(100), || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok("sent")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_last_attempt() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = retry_transient(2, Duration::from_millis(10), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = retry_transient(5, Duration::from_millis(10), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BridgeError::AlreadyMapped {
                    remote_room_id: "room-1".to_string(),
                    matrix_room_id: "!a:example.org".to_string(),
                    kind: MappingKind::Live,
                })
            }
        })
        .await;

        assert!(matches!(result, Err(BridgeError::AlreadyMapped { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
