//! Backoff circuit breaker for an upstream proxy
//!
//! A single long-running task per proxy owns the failure counter and the
//! backoff flag. Dial paths report CONNECT timeouts and transport failures
//! through a bounded hint channel; a storm of failures can never queue more
//! than the channel capacity because excess hints are dropped, which is fine
//! for the coarse counting done here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Capacity of the hint channel; sends beyond it are dropped
pub const HINT_CAPACITY: usize = 5;

/// Period of the reset ticker
pub const RESET_PERIOD: Duration = Duration::from_secs(60);

/// Create the bounded hint channel for one watchdog
pub fn hint_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    mpsc::channel(HINT_CAPACITY)
}

/// Run the watchdog until every hint sender is gone.
///
/// Each hint bumps the counter; reaching `threshold` trips the backoff flag,
/// zeroes the counter and consumes the next tick without clearing state, so
/// a tripped proxy cools for at least one full period. Any other tick clears
/// the flag and the counter.
pub async fn run(
    name: String,
    backoff: Arc<AtomicBool>,
    mut hints: mpsc::Receiver<()>,
    threshold: usize,
    period: Duration,
) {
    let mut count = 0usize;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            hint = hints.recv() => match hint {
                Some(()) => {
                    count += 1;
                    if count >= threshold {
                        backoff.store(true, Ordering::Relaxed);
                        count = 0;
                        debug!(proxy = %name, "backoff tripped");
                        ticker.tick().await; // skip this tick
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if backoff.swap(false, Ordering::Relaxed) {
                    debug!(proxy = %name, "backoff cleared");
                }
                count = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn spawn_watchdog(threshold: usize) -> (Arc<AtomicBool>, mpsc::Sender<()>) {
        let backoff = Arc::new(AtomicBool::new(false));
        let (tx, rx) = hint_channel();
        tokio::spawn(run(
            "proxy.test:443".to_string(),
            backoff.clone(),
            rx,
            threshold,
            RESET_PERIOD,
        ));
        (backoff, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_at_threshold_and_cools_for_a_full_period() {
        let (backoff, tx) = spawn_watchdog(3);

        for _ in 0..3 {
            tx.send(()).await.unwrap();
        }
        sleep(Duration::from_millis(1)).await;
        assert!(backoff.load(Ordering::Relaxed), "should trip at threshold");

        // The first tick after tripping is skipped: still backing off.
        sleep(RESET_PERIOD).await;
        assert!(
            backoff.load(Ordering::Relaxed),
            "skipped tick must not clear backoff"
        );

        // The following tick clears the flag.
        sleep(RESET_PERIOD).await;
        assert!(!backoff.load(Ordering::Relaxed), "should recover after cooling");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_resets_the_counter() {
        let (backoff, tx) = spawn_watchdog(3);

        tx.send(()).await.unwrap();
        tx.send(()).await.unwrap();
        sleep(Duration::from_millis(1)).await;
        assert!(!backoff.load(Ordering::Relaxed));

        // A tick zeroes the partial count, so two more hints stay below
        // threshold and only a third trips.
        sleep(RESET_PERIOD).await;
        tx.send(()).await.unwrap();
        tx.send(()).await.unwrap();
        sleep(Duration::from_millis(1)).await;
        assert!(!backoff.load(Ordering::Relaxed));

        tx.send(()).await.unwrap();
        sleep(Duration::from_millis(1)).await;
        assert!(backoff.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_hints_beyond_capacity_are_dropped() {
        // No watchdog draining the channel: the bounded sender refuses the
        // overflow instead of blocking the dial path.
        let (tx, _rx) = hint_channel();
        for _ in 0..HINT_CAPACITY {
            tx.try_send(()).unwrap();
        }
        assert!(tx.try_send(()).is_err());
    }
}
