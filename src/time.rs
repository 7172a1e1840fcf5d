use tokio::time::Instant;

/// Monotonic millisecond clock shared by everything in one endpoint.
///
/// Timestamps are relative to clock creation, so they are meaningless
///  across processes - they only ever travel the wire inside PING/PONG
///  payloads, where the sender is the sole consumer.
///
/// Built on `tokio::time::Instant` so tests running under a paused runtime
///  clock see simulated time.
#[derive(Clone)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since clock creation.
    pub fn now(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_under_paused_clock() {
        let clock = MonotonicClock::new();
        assert_eq!(clock.now(), 0);

        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.now(), 250);

        tokio::time::advance(Duration::from_millis(4750)).await;
        assert_eq!(clock.now(), 5000);
    }
}
