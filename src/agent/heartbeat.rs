use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Paces the `<Alive>` records an agent sends while a job runs, so the
/// dispatcher's idle-read timeout only fires for a dead peer.
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    interval: Duration,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// A ticker whose first tick is one interval from now. Ticks missed
    /// while the session was busy writing are not bunched up.
    pub fn ticker(&self) -> Interval {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}
