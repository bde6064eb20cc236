//! Delayed-task scheduling.
//!
//! One logical timer service runs every reboot monitor tick. Delivery is
//! best-effort and unordered across unrelated tasks.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

/// A unit of deferred work.
pub type ScheduledTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs tasks after a delay.
pub trait Scheduler: Send + Sync {
    fn schedule_after(&self, delay: Duration, task: ScheduledTask);
}

/// Scheduler backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, delay: Duration, task: ScheduledTask) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }
}

/// Scheduler that queues tasks until the caller runs them.
///
/// Lets tests step a reboot session tick by tick and inspect the delay each
/// tick was scheduled with.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<VecDeque<(Duration, ScheduledTask)>>,
    history: Mutex<Vec<Duration>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<(Duration, ScheduledTask)>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn history(&self) -> MutexGuard<'_, Vec<Duration>> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    /// Delay of the task that would run next.
    pub fn next_delay(&self) -> Option<Duration> {
        self.queue().front().map(|(delay, _)| *delay)
    }

    /// Every delay ever scheduled, in order.
    pub fn scheduled_delays(&self) -> Vec<Duration> {
        self.history().clone()
    }

    /// Run the oldest queued task to completion and return its delay.
    pub async fn run_next(&self) -> Option<Duration> {
        let (delay, task) = self.queue().pop_front()?;
        debug!(delay_secs = delay.as_secs(), "Running scheduled task");
        task.await;
        Some(delay)
    }

    /// Run queued tasks until none remain or `limit` tasks have run.
    pub async fn run_until_idle(&self, limit: usize) -> usize {
        let mut ran = 0;
        while ran < limit && self.run_next().await.is_some() {
            ran += 1;
        }
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_after(&self, delay: Duration, task: ScheduledTask) {
        self.history().push(delay);
        self.queue().push_back((delay, task));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_manual_scheduler_runs_in_order() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let counter = Arc::clone(&counter);
            scheduler.schedule_after(
                Duration::from_secs(5),
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        assert_eq!(scheduler.pending(), 2);
        assert_eq!(scheduler.next_delay(), Some(Duration::from_secs(5)));
        assert_eq!(scheduler.run_until_idle(10).await, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.scheduled_delays().len(), 2);
    }

    #[tokio::test]
    async fn test_manual_scheduler_task_can_reschedule() {
        let scheduler = Arc::new(ManualScheduler::new());
        let inner = Arc::clone(&scheduler);
        scheduler.schedule_after(
            Duration::from_secs(30),
            Box::pin(async move {
                inner.schedule_after(Duration::from_secs(5), Box::pin(async {}));
            }),
        );

        assert_eq!(scheduler.run_next().await, Some(Duration::from_secs(30)));
        assert_eq!(scheduler.next_delay(), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_waits_for_delay() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        TokioScheduler.schedule_after(
            Duration::from_secs(30),
            Box::pin(async move {
                let _ = tx.send(());
            }),
        );

        let started = tokio::time::Instant::now();
        rx.await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
    }
}
