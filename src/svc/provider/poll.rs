//! # Poll module
//!
//! This module provide a bounded fixed-interval polling helper used to wait
//! for eventually-consistent external state

use std::{future::Future, time::Duration};

use tokio::time::{sleep, Instant};

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_CEILING: Duration = Duration::from_secs(300);

// -----------------------------------------------------------------------------
// TimeoutError structure

#[derive(thiserror::Error, Debug)]
#[error("condition was not met within {0:?}")]
pub struct TimeoutError(pub Duration);

// -----------------------------------------------------------------------------
// helpers

/// evaluate the condition immediately and then at a fixed interval until it
/// returns true, giving up once the ceiling is reached.
///
/// Cancel-safe: dropping the returned future aborts the wait, so a caller
/// deadline can cut the poll short
pub async fn immediate<F, Fut>(
    interval: Duration,
    ceiling: Duration,
    mut condition: F,
) -> Result<(), TimeoutError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + ceiling;

    loop {
        if condition().await {
            return Ok(());
        }

        if Instant::now() + interval > deadline {
            return Err(TimeoutError(ceiling));
        }

        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::immediate;

    #[tokio::test]
    async fn condition_met_immediately() {
        let result = immediate(Duration::from_secs(5), Duration::from_secs(300), || async {
            true
        })
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn condition_met_after_few_attempts() {
        let attempts = AtomicUsize::new(0);

        let result = immediate(Duration::from_secs(5), Duration::from_secs(300), || async {
            attempts.fetch_add(1, Ordering::SeqCst) >= 2
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(3, attempts.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_reached_without_success() {
        let attempts = AtomicUsize::new(0);

        let result = immediate(Duration::from_secs(5), Duration::from_secs(300), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            false
        })
        .await;

        assert!(result.is_err());
        // one immediate evaluation plus one per interval up to the ceiling
        assert_eq!(61, attempts.load(Ordering::SeqCst));
    }
}
