use std::time::Duration;
use tokio::time::Instant;

/// Decides liveness based on elapsed time since the most recent heartbeat: if that time exceeds
///  a given fixed timeout, the node is considered unreachable.
///
/// A new decider treats the node as if it had just sent a heartbeat, so peers get the full
///  timeout to announce themselves after startup.
pub struct FixedTimeoutDecider {
    unreachable_threshold: Duration,
    last_heartbeat_timestamp: Instant,
}

impl FixedTimeoutDecider {
    pub fn new_for_threshold(unreachable_threshold: Duration) -> Self {
        FixedTimeoutDecider {
            unreachable_threshold,
            last_heartbeat_timestamp: Instant::now(),
        }
    }

    pub fn on_heartbeat(&mut self) {
        self.last_heartbeat_timestamp = Instant::now();
    }

    pub fn set_threshold(&mut self, unreachable_threshold: Duration) {
        self.unreachable_threshold = unreachable_threshold;
    }

    pub fn is_reachable(&self) -> bool {
        self.last_heartbeat_timestamp.elapsed() < self.unreachable_threshold
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat_timestamp
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fixed_timeout_decider() {
        let mut decider = FixedTimeoutDecider::new_for_threshold(Duration::from_millis(100));

        assert!(decider.is_reachable());

        advance(Duration::from_millis(100)).await;
        assert!(!decider.is_reachable());

        for _ in 0..20 {
            decider.on_heartbeat();
            advance(Duration::from_millis(99)).await;
            assert!(decider.is_reachable());
        }

        advance(Duration::from_millis(1)).await;
        assert!(!decider.is_reachable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_threshold() {
        let mut decider = FixedTimeoutDecider::new_for_threshold(Duration::from_millis(100));
        advance(Duration::from_millis(150)).await;
        assert!(!decider.is_reachable());

        decider.set_threshold(Duration::from_millis(200));
        assert!(decider.is_reachable());
    }
}
