//! Keyed, cancellable background tasks.
//!
//! A [`TaskSupervisor`] owns at most one running task per key. Every task gets
//! its own [`ShutdownSignal`], so a single task can be cancelled without
//! touching the others, and [`TaskSupervisor::shutdown`] stops them all.
//!
//! Tasks deregister themselves when they finish. A generation counter keeps a
//! finished task from removing a newer task that was started under the same key.

use crate::shutdown::{ShutdownSignal, ShutdownTrigger, shutdown_channel};
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

struct SupervisedTask {
    trigger: ShutdownTrigger,
    handle: JoinHandle<()>,
    generation: u64,
}

type TaskMap<K> = Arc<Mutex<HashMap<K, SupervisedTask>>>;

/// Owner of keyed background tasks.
///
/// Cloning is cheap; clones share the same task table.
pub struct TaskSupervisor<K> {
    tasks: TaskMap<K>,
    generation: Arc<AtomicU64>,
}

impl<K> Clone for TaskSupervisor<K> {
    fn clone(&self) -> Self {
        Self {
            tasks: Arc::clone(&self.tasks),
            generation: Arc::clone(&self.generation),
        }
    }
}

impl<K> Debug for TaskSupervisor<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("tasks", &lock(&self.tasks).len())
            .finish()
    }
}

impl<K> Default for TaskSupervisor<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// A poisoned table only means a panic happened while it was held; the map
// itself is still consistent because every mutation is a single insert/remove.
fn lock<K>(tasks: &Mutex<HashMap<K, SupervisedTask>>) -> MutexGuard<'_, HashMap<K, SupervisedTask>> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K> TaskSupervisor<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Create an empty supervisor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn a task under `key`.
    ///
    /// The closure receives the task's own shutdown signal. Returns `false`
    /// (and spawns nothing) if a task under `key` is still running.
    pub fn spawn<F, Fut>(&self, key: K, task: F) -> bool
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = lock(&self.tasks);
        if tasks.get(&key).is_some_and(|existing| !existing.handle.is_finished()) {
            tracing::debug!(?key, "Task already running, not spawning another");
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (trigger, signal) = shutdown_channel();
        let future = task(signal);
        let table = Arc::clone(&self.tasks);
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            future.await;
            let mut tasks = lock(&table);
            if tasks.get(&task_key).is_some_and(|entry| entry.generation == generation) {
                tasks.remove(&task_key);
            }
        });

        tasks.insert(
            key,
            SupervisedTask {
                trigger,
                handle,
                generation,
            },
        );
        true
    }

    /// Whether a task under `key` is still running.
    #[must_use]
    pub fn is_running(&self, key: &K) -> bool {
        lock(&self.tasks)
            .get(key)
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Number of running tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.tasks)
            .values()
            .filter(|task| !task.handle.is_finished())
            .count()
    }

    /// Whether no task is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal the task under `key` to stop without waiting for it.
    ///
    /// Returns `false` if no task was registered under `key`.
    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.tasks).remove(key) {
            Some(task) => {
                task.trigger.trigger();
                true
            }
            None => false,
        }
    }

    /// Signal the task under `key` and wait up to `timeout` for it to stop.
    ///
    /// Returns `true` if the task stopped in time or nothing was running.
    pub async fn cancel_and_wait(&self, key: &K, timeout: Duration) -> bool {
        let Some(task) = lock(&self.tasks).remove(key) else {
            return true;
        };
        task.trigger.trigger();

        if tokio::time::timeout(timeout, task.handle).await.is_ok() {
            true
        } else {
            tracing::warn!(?key, timeout_ms = timeout.as_millis(), "Task did not stop within timeout");
            false
        }
    }

    /// Signal every task and wait up to `timeout` for all of them to stop.
    ///
    /// Returns the number of tasks that were still running when the timeout hit.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let drained: Vec<(K, SupervisedTask)> = lock(&self.tasks).drain().collect();
        if drained.is_empty() {
            return 0;
        }

        tracing::info!(tasks = drained.len(), "Shutting down supervised tasks");
        for (_, task) in &drained {
            task.trigger.trigger();
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut stragglers = 0;
        for (key, task) in drained {
            if tokio::time::timeout_at(deadline, task.handle).await.is_err() {
                tracing::warn!(?key, "Supervised task still running at shutdown deadline");
                stragglers += 1;
            }
        }

        if stragglers == 0 {
            tracing::info!("All supervised tasks stopped");
        }
        stragglers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    async fn wait_for_shutdown(mut signal: ShutdownSignal) {
        signal.recv().await;
    }

    #[tokio::test]
    async fn spawn_rejects_duplicate_running_key() {
        let supervisor: TaskSupervisor<u32> = TaskSupervisor::new();

        assert!(supervisor.spawn(1, wait_for_shutdown));
        assert!(!supervisor.spawn(1, wait_for_shutdown));
        assert!(supervisor.spawn(2, wait_for_shutdown));
        assert_eq!(supervisor.len(), 2);

        assert_eq!(supervisor.shutdown(Duration::from_secs(1)).await, 0);
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn cancel_and_wait_stops_only_that_task() {
        let supervisor: TaskSupervisor<&'static str> = TaskSupervisor::new();
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);

        supervisor.spawn("a", move |mut signal| async move {
            signal.recv().await;
            flag.store(true, Ordering::SeqCst);
        });
        supervisor.spawn("b", wait_for_shutdown);

        assert!(supervisor.cancel_and_wait(&"a", Duration::from_secs(1)).await);
        assert!(stopped.load(Ordering::SeqCst));
        assert!(!supervisor.is_running(&"a"));
        assert!(supervisor.is_running(&"b"));

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn finished_task_frees_its_key() {
        let supervisor: TaskSupervisor<u32> = TaskSupervisor::new();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        supervisor.spawn(7, move |_signal| async move {
            let _ = done_tx.send(());
        });
        let _ = done_rx.await;
        tokio::task::yield_now().await;

        assert!(supervisor.spawn(7, wait_for_shutdown));
        assert!(supervisor.is_running(&7));
        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn cancel_unknown_key_is_a_noop() {
        let supervisor: TaskSupervisor<u32> = TaskSupervisor::new();
        assert!(!supervisor.cancel(&42));
        assert!(supervisor.cancel_and_wait(&42, Duration::from_millis(10)).await);
    }
}
