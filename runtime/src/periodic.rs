//! Periodic background jobs.
//!
//! [`PeriodicTask`] runs an async job on a fixed interval until its
//! [`ShutdownSignal`] fires. The reapers (expired seat locks, stale queue
//! admissions) are built on it. Each tick awaits the job to completion before
//! the next one is scheduled, so a slow sweep never overlaps with itself;
//! missed ticks are skipped rather than burst.

use crate::shutdown::ShutdownSignal;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// A named job that runs every `interval`.
#[derive(Debug, Clone)]
pub struct PeriodicTask {
    name: String,
    interval: Duration,
    run_immediately: bool,
}

impl PeriodicTask {
    /// Create a periodic task. The first run happens after one full interval.
    ///
    /// A zero interval is bumped to one millisecond.
    #[must_use]
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval: interval.max(Duration::from_millis(1)),
            run_immediately: false,
        }
    }

    /// Run the job once right away, then on every interval.
    #[must_use]
    pub const fn run_immediately(mut self) -> Self {
        self.run_immediately = true;
        self
    }

    /// Task name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the loop onto the current tokio runtime.
    ///
    /// The returned handle resolves once `shutdown` fires and the in-flight run
    /// (if any) has finished.
    pub fn spawn<F, Fut>(self, mut shutdown: ShutdownSignal, mut job: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let start = if self.run_immediately {
                tokio::time::Instant::now()
            } else {
                tokio::time::Instant::now() + self.interval
            };
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(task = %self.name, interval_ms = self.interval.as_millis(), "Periodic task started");

            loop {
                tokio::select! {
                    () = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        debug!(task = %self.name, "Periodic task tick");
                        job().await;
                    }
                }
            }

            info!(task = %self.name, "Periodic task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::shutdown_channel;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn runs_on_every_interval_until_shutdown() {
        let (trigger, signal) = shutdown_channel();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let handle = PeriodicTask::new("counter", Duration::from_secs(10)).spawn(signal, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        trigger.trigger();
        let _ = handle.await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_immediately_fires_first_tick_at_start() {
        let (trigger, signal) = shutdown_channel();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let handle = PeriodicTask::new("eager", Duration::from_secs(60))
            .run_immediately()
            .spawn(signal, move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });

        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.trigger();
        let _ = handle.await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_interval_is_bumped() {
        let task = PeriodicTask::new("fast", Duration::ZERO);
        assert_eq!(task.interval(), Duration::from_millis(1));
        assert_eq!(task.name(), "fast");
    }
}
