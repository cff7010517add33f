//! Global inactivity watchdog.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Debounced deadline that fires after `wait` without activity.
///
/// [`fired`](Self::fired) is cancel safe: polling it from a `select!` loop and
/// dropping it keeps the trigger state intact.
#[derive(Debug)]
pub struct TimeoutTrigger {
    wait: Duration,
    deadline: Option<Instant>,
    ignore_until: Option<Instant>,
    discarded: bool,
}

impl TimeoutTrigger {
    /// Create a disarmed trigger; the first [`debounce`](Self::debounce) arms it.
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            deadline: None,
            ignore_until: None,
            discarded: false,
        }
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Restart the countdown. No-op once discarded.
    pub fn debounce(&mut self) {
        if !self.discarded {
            self.deadline = Some(Instant::now() + self.wait);
        }
    }

    /// Never fire again.
    pub fn discard(&mut self) {
        self.discarded = true;
        self.deadline = None;
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    /// Suppress firing for `period` from now. Only ever extends the window.
    pub fn ignore_for(&mut self, period: Duration) {
        let until = Instant::now() + period;
        if self.ignore_until.map_or(true, |current| current < until) {
            self.ignore_until = Some(until);
        }
    }

    /// Resolve with the configured wait when the deadline passes.
    ///
    /// A deadline reached inside the ignore window is swallowed and the
    /// trigger stays disarmed until the next debounce.
    pub async fn fired(&mut self) -> Duration {
        loop {
            match self.deadline {
                Some(deadline) if !self.discarded => {
                    tokio::time::sleep_until(deadline).await;
                    self.deadline = None;
                    if self.ignore_until.is_some_and(|until| Instant::now() < until) {
                        debug!("Timeout suppressed by a per-test timeout");
                        continue;
                    }
                    return self.wait;
                }
                _ => std::future::pending::<()>().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fires_within(trigger: &mut TimeoutTrigger, limit: Duration) -> Option<Duration> {
        tokio::time::timeout(limit, trigger.fired()).await.ok()
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_until_debounced() {
        let mut trigger = TimeoutTrigger::new(Duration::from_millis(100));
        assert_eq!(fires_within(&mut trigger, Duration::from_secs(10)).await, None);

        trigger.debounce();
        assert_eq!(
            fires_within(&mut trigger, Duration::from_millis(150)).await,
            Some(Duration::from_millis(100))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_postpones_deadline() {
        let mut trigger = TimeoutTrigger::new(Duration::from_millis(100));
        trigger.debounce();

        tokio::time::sleep(Duration::from_millis(80)).await;
        trigger.debounce();
        assert_eq!(fires_within(&mut trigger, Duration::from_millis(50)).await, None);
        assert!(fires_within(&mut trigger, Duration::from_millis(100)).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discarded_never_fires() {
        let mut trigger = TimeoutTrigger::new(Duration::from_millis(10));
        trigger.debounce();
        trigger.discard();
        for _ in 0..5 {
            trigger.debounce();
        }
        assert!(trigger.is_discarded());
        assert_eq!(fires_within(&mut trigger, Duration::from_secs(60)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignore_window_swallows_fire_without_rearming() {
        let mut trigger = TimeoutTrigger::new(Duration::from_millis(100));
        trigger.ignore_for(Duration::from_millis(500));
        trigger.ignore_for(Duration::from_millis(200));
        trigger.debounce();

        assert_eq!(fires_within(&mut trigger, Duration::from_secs(5)).await, None);

        // Past the ignore window, the next activity arms it again.
        trigger.debounce();
        assert!(fires_within(&mut trigger, Duration::from_millis(150)).await.is_some());
    }
}
