//! Cancellable timers.
//!
//! [`Debouncer`] is pure deadline bookkeeping so the sync engine can be driven
//! with explicit instants. [`TimerHandle`] owns a spawned tokio task and
//! aborts it when dropped, so a timer never outlives its owner.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Trailing-edge debounce: fires once `window` has passed since the last touch.
#[derive(Clone, Debug)]
pub struct Debouncer {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// Restart the window at `now`.
    pub fn touch(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// True once if the window elapsed; clears the deadline.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// A spawned timer task, aborted on drop.
#[derive(Debug, Default)]
pub struct TimerHandle {
    task: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Call `tick` every `period`, starting one period from now.
    pub fn every<F>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                tick();
            }
        });
        Self { task: Some(task) }
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_debouncer_restarts_window() {
        let start = Instant::now();
        let mut debounce = Debouncer::new(Duration::from_millis(300));
        debounce.touch(start);
        debounce.touch(start + Duration::from_millis(200));

        assert!(!debounce.take_due(start + Duration::from_millis(300)));
        assert!(debounce.take_due(start + Duration::from_millis(500)));
        assert!(!debounce.take_due(start + Duration::from_millis(900)));
    }

    #[test]
    fn test_debouncer_cancel() {
        let start = Instant::now();
        let mut debounce = Debouncer::new(Duration::from_millis(300));
        debounce.touch(start);
        debounce.cancel();
        assert!(!debounce.is_pending());
        assert!(!debounce.take_due(start + Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = TimerHandle::every(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(timer);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_timer_ticks() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let mut timer = TimerHandle::every(Duration::from_secs(3), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(9500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        timer.cancel();
        assert!(!timer.is_active());
    }
}
