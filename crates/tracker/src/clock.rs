use std::future::pending;
use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval};

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub enum ProgressClock {
    Stopped,
    Running(Interval),
}

impl ProgressClock {
    pub fn new() -> Self {
        Self::Stopped
    }

    pub fn start(&mut self) {
        *self = Self::Running(interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL));
    }

    pub fn stop(&mut self) {
        *self = Self::Stopped;
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }

    pub async fn tick(&mut self) {
        match self {
            // Never resolves while stopped.
            Self::Stopped => pending().await,
            Self::Running(interval) => {
                interval.tick().await;
            }
        }
    }
}

impl Default for ProgressClock {
    fn default() -> Self {
        Self::new()
    }
}
