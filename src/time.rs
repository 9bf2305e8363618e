use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Shortest period a repeating timer runs at.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Wall-clock milliseconds since the UNIX epoch.
///
/// Contact freshness is kept in wall-clock time because it is persisted across sessions.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Timer ticking every `period`, the first tick right away. A zero period is raised to one
/// millisecond instead of panicking.
pub(crate) fn interval(period: Duration) -> tokio::time::Interval {
    tokio::time::interval(period.max(MIN_PERIOD))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_clock_is_monotonic_enough() {
        let earlier = unix_millis();
        let later = unix_millis();

        assert!(earlier > 0);
        assert!(later >= earlier);
    }

    #[tokio::test]
    async fn negative_zero_period_still_ticks() {
        let mut timer = interval(Duration::ZERO);

        tokio::time::timeout(Duration::from_secs(1), async {
            for _ in 0..3 {
                timer.tick().await;
            }
        })
        .await
        .unwrap();
    }
}
