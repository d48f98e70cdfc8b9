use std::time::Duration;

use tokio::time::Instant;

/// Consecutive heartbeats allowed to go unacknowledged before the session
/// is declared dead.
pub const MAX_MISSED_ACKS: u32 = 2;

/// Drives heartbeat cadence for one transport. The first beat is delayed by
/// a random fraction of the interval.
#[derive(Debug)]
pub struct HeartbeatTimer {
    interval: Duration,
    next: Instant,
}

impl HeartbeatTimer {
    pub fn start(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now() + jittered(interval),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.next
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Schedules the next beat one full interval from now.
    pub fn reset(&mut self) {
        self.next = Instant::now() + self.interval;
    }
}

pub fn jittered(interval: Duration) -> Duration {
    interval.mul_f64(rand::random::<f64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_within_interval() {
        let interval = Duration::from_millis(41_250);
        for _ in 0..100 {
            assert!(jittered(interval) < interval);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_schedules_full_interval() {
        let mut timer = HeartbeatTimer::start(Duration::from_secs(10));
        assert!(timer.deadline() < Instant::now() + Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(3)).await;
        timer.reset();
        assert_eq!(timer.deadline(), Instant::now() + Duration::from_secs(10));
    }
}
