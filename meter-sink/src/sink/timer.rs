use std::time::Duration;

use tokio::time::Instant;

/// Tracks how long it has been since the last flush.
#[derive(Debug)]
pub struct FlushTimer {
    max_wait: Duration,
    last_flush: Instant,
}

impl FlushTimer {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            max_wait,
            last_flush: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> bool {
        self.last_flush.elapsed() >= self.max_wait
    }

    pub fn remaining(&self) -> Duration {
        self.max_wait.saturating_sub(self.last_flush.elapsed())
    }

    pub fn reset(&mut self) {
        self.last_flush = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_elapses_after_max_wait_and_resets() {
        let mut timer = FlushTimer::new(Duration::from_secs(5));
        assert!(!timer.elapsed());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(timer.remaining(), Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(timer.elapsed());
        assert_eq!(timer.remaining(), Duration::ZERO);

        timer.reset();
        assert!(!timer.elapsed());
    }
}
