//! Core limiter implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace};

use crate::config::LimiterConfig;
use crate::error::Result;

use super::queue::{PendingQueue, Placement, QueuedTask, Scheduled};
use super::window::{Window, WindowPair};

/// Queues tasks and admits them at most `limit` per `interval`.
///
/// One instance is one quota. Share it by reference (usually an `Arc`) with
/// every caller that must respect that quota jointly.
///
/// Tasks run one at a time in submission order on a drain loop the limiter
/// spawns onto the current Tokio runtime. When the current window is full, the
/// loop sleeps until the next window opens and then runs the head task
/// without re-checking the limit. A window can therefore go over `limit` by
/// one task, but the head of the queue is never held past the next window
/// boundary. Tasks further back wait roughly one interval per `limit` tasks
/// ahead of them.
pub struct Limiter {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    limit: u32,
    interval: Duration,
    max_queue_size: usize,
    /// Monotonic and wall-clock readings taken together at construction
    origin: (Instant, DateTime<Utc>),
    state: Mutex<State>,
    /// Signalled whenever a drain loop exits
    idle: Notify,
}

struct State {
    windows: WindowPair,
    pending: PendingQueue,
    draining: bool,
    next_id: u64,
}

/// Point-in-time view of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    #[serde(skip)]
    pub start: Instant,
    /// `start` on the wall clock
    pub started_at: DateTime<Utc>,
    pub count: u32,
}

/// Point-in-time view of a limiter. May already be stale when read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterStatus {
    pub limit: u32,
    pub interval_ms: u64,
    pub current_window: WindowStatus,
    pub next_window: WindowStatus,
    /// Tasks waiting for admission
    pub queue_length: usize,
    /// Submissions held back until the queue has room
    pub backlog_length: usize,
    pub draining: bool,
}

impl Limiter {
    /// Create a limiter from a validated quota.
    pub fn new(name: impl Into<String>, config: &LimiterConfig) -> Result<Self> {
        config.validate()?;

        let name = name.into();
        let now = Instant::now();
        let interval = config.interval();

        info!(
            limiter = %name,
            limit = config.limit,
            interval_ms = config.interval_ms,
            max_queue_size = config.max_queue_size,
            "Limiter created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                name,
                limit: config.limit,
                interval,
                max_queue_size: config.max_queue_size,
                origin: (now, Utc::now()),
                state: Mutex::new(State {
                    windows: WindowPair::new(now, interval),
                    pending: PendingQueue::new(config.max_queue_size),
                    draining: false,
                    next_id: 0,
                }),
                idle: Notify::new(),
            }),
        })
    }

    /// The name this limiter logs under.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn limit(&self) -> u32 {
        self.shared.limit
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    pub fn max_queue_size(&self) -> usize {
        self.shared.max_queue_size
    }

    /// Submit a task and get a future that resolves with its output.
    ///
    /// The task is enqueued before this returns, so submission order is call
    /// order, not first-poll order. If the queue is full the submission waits
    /// in a backlog and moves into the queue, in order, as slots free up.
    ///
    /// Dropping the returned future before the task is admitted cancels it
    /// without consuming quota. Once admitted, the task runs to completion even
    /// if nobody is waiting for it.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn schedule<F, Fut>(&self, task: F) -> Scheduled<Fut::Output>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let shared = &self.shared;

        let (scheduled, start_drain) = {
            let mut state = shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;

            let (queued, scheduled) = QueuedTask::new(id, task);
            match state.pending.push(queued) {
                Placement::Queued => trace!(
                    limiter = %shared.name,
                    task = id,
                    queue_length = state.pending.len(),
                    "Task queued"
                ),
                Placement::Backlogged => trace!(
                    limiter = %shared.name,
                    task = id,
                    backlog_length = state.pending.backlog_len(),
                    "Queue full, task held in backlog"
                ),
            }

            let start_drain = !state.draining;
            state.draining = true;
            (scheduled, start_drain)
        };

        if start_drain {
            tokio::spawn(Arc::clone(shared).drain());
        }

        scheduled
    }

    /// Snapshot of both windows and the queue.
    pub fn status(&self) -> LimiterStatus {
        let shared = &self.shared;
        let state = shared.state.lock();

        LimiterStatus {
            limit: shared.limit,
            interval_ms: shared.interval.as_millis() as u64,
            current_window: shared.window_status(state.windows.current()),
            next_window: shared.window_status(state.windows.next()),
            queue_length: state.pending.len(),
            backlog_length: state.pending.backlog_len(),
            draining: state.draining,
        }
    }

    /// Whether the queue is empty and no drain loop is running.
    pub fn is_idle(&self) -> bool {
        self.shared.is_idle()
    }

    /// Wait until the queue is empty and no drain loop is running.
    ///
    /// This never resolves while a task is still executing.
    pub async fn drain_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            // Register before checking so an exit between the two is not missed
            notified.as_mut().enable();

            if self.shared.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("name", &self.shared.name)
            .field("limit", &self.shared.limit)
            .field("interval", &self.shared.interval)
            .field("max_queue_size", &self.shared.max_queue_size)
            .finish()
    }
}

impl Shared {
    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        !state.draining && state.pending.is_empty()
    }

    fn window_status(&self, window: Window) -> WindowStatus {
        let (origin, origin_utc) = self.origin;
        let offset = window.start.saturating_duration_since(origin);
        let started_at = chrono::Duration::from_std(offset)
            .ok()
            .and_then(|offset| origin_utc.checked_add_signed(offset))
            .unwrap_or(origin_utc);

        WindowStatus {
            start: window.start,
            started_at,
            count: window.count,
        }
    }

    /// Run queued tasks one at a time until the queue is empty.
    async fn drain(self: Arc<Self>) {
        debug!(limiter = %self.name, "Drain loop started");

        while let Some(task) = self.next_task() {
            self.admit(task).await;
        }

        self.idle.notify_waiters();
        debug!(limiter = %self.name, "Drain loop stopped");
    }

    /// Pop the head task, or clear `draining` if there is none.
    fn next_task(&self) -> Option<QueuedTask> {
        let mut state = self.state.lock();
        let task = state.pending.pop();
        if task.is_none() {
            state.draining = false;
        }
        task
    }

    /// Charge a window for `task`, waiting for the next one if the current
    /// window is full, then run it to completion.
    async fn admit(&self, task: QueuedTask) {
        if task.is_abandoned() {
            trace!(limiter = %self.name, task = task.id, "Skipping abandoned task");
            return;
        }

        let now = Instant::now();
        let saturated = {
            let mut state = self.state.lock();
            state.windows.rotate(now);
            if state.windows.has_capacity(self.limit) {
                state.windows.charge(self.limit);
                None
            } else {
                Some((state.windows.next().start, state.windows.until_next(now)))
            }
        };

        match saturated {
            None => {
                debug!(limiter = %self.name, task = task.id, "Task admitted");
            }
            Some((deadline, delay)) => {
                debug!(
                    limiter = %self.name,
                    task = task.id,
                    delay_ms = delay.as_millis() as u64,
                    "Window saturated, delaying task until next window"
                );
                sleep_until(deadline).await;

                if task.is_abandoned() {
                    trace!(
                        limiter = %self.name,
                        task = task.id,
                        "Task abandoned while waiting for the next window"
                    );
                    return;
                }

                let count = {
                    let mut state = self.state.lock();
                    state.windows.rotate(Instant::now());
                    state.windows.charge(self.limit);
                    state.windows.current().count
                };
                debug!(
                    limiter = %self.name,
                    task = task.id,
                    window_count = count,
                    "Delayed task admitted"
                );
            }
        }

        task.run().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ThrottleError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter(limit: u32, interval_ms: u64) -> Limiter {
        Limiter::new("test", &LimiterConfig::new(limit, interval_ms)).unwrap()
    }

    #[tokio::test]
    async fn test_limiter_creation() {
        let limiter = limiter(5, 1000);

        assert_eq!(limiter.name(), "test");
        assert_eq!(limiter.limit(), 5);
        assert_eq!(limiter.interval(), Duration::from_secs(1));
        assert_eq!(limiter.max_queue_size(), 1000);
        assert!(limiter.is_idle());
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let zero_limit = Limiter::new("test", &LimiterConfig::new(0, 1000));
        assert!(matches!(zero_limit, Err(ThrottleError::Config(_))));

        let zero_interval = Limiter::new("test", &LimiterConfig::new(1, 0));
        assert!(matches!(zero_interval, Err(ThrottleError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_returns_task_output() {
        let limiter = limiter(1, 1000);

        let output = limiter.schedule(|| async { 42 }).await;
        assert_eq!(output, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_window_delays_task() {
        let limiter = limiter(1, 1000);
        let start = Instant::now();

        let first = limiter.schedule(|| async { Instant::now() });
        let second = limiter.schedule(|| async { Instant::now() });

        assert_eq!(first.await - start, Duration::ZERO);
        assert_eq!(second.await - start, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reflects_admissions() {
        let limiter = limiter(2, 1000);
        let start = Instant::now();

        limiter.schedule(|| async {}).await;
        limiter.schedule(|| async {}).await;
        limiter.drain_idle().await;

        let status = limiter.status();
        assert_eq!(status.limit, 2);
        assert_eq!(status.interval_ms, 1000);
        assert_eq!(status.current_window.start, start);
        assert_eq!(status.current_window.count, 2);
        assert_eq!(status.next_window.start, start + Duration::from_secs(1));
        assert_eq!(status.next_window.count, 0);
        assert_eq!(status.queue_length, 0);
        assert_eq!(status.backlog_length, 0);
        assert!(!status.draining);
        assert_eq!(
            (status.next_window.started_at - status.current_window.started_at).num_milliseconds(),
            1000
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_while_draining() {
        let limiter = limiter(1, 1000);

        let tasks: Vec<_> = (0..3).map(|i| limiter.schedule(move || async move { i })).collect();

        // Let the drain loop admit the first task and park on the saturated window
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let status = limiter.status();
        assert!(status.draining);
        assert_eq!(status.current_window.count, 1);
        assert_eq!(status.queue_length, 1);
        assert!(!limiter.is_idle());

        assert_eq!(futures::future::join_all(tasks).await, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_task_does_not_consume_quota() {
        let limiter = limiter(1, 1000);
        let runs = Arc::new(AtomicUsize::new(0));

        let blocker = limiter.schedule(|| async {});
        let abandoned = {
            let runs = Arc::clone(&runs);
            limiter.schedule(move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };
        drop(abandoned);

        blocker.await;
        limiter.drain_idle().await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.status().current_window.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_dropped_during_window_wait_is_skipped() {
        let limiter = limiter(1, 1000);
        let runs = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        let first = limiter.schedule(|| async {});
        let second = {
            let runs = Arc::clone(&runs);
            limiter.schedule(move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };

        first.await;
        // Let the drain loop park on the saturated window with `second` in hand
        tokio::task::yield_now().await;
        assert_eq!(limiter.status().queue_length, 0);
        assert!(limiter.status().draining);

        drop(second);
        tokio::time::advance(Duration::from_millis(1500)).await;
        limiter.drain_idle().await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        // Only `first` was ever charged, and the wait charged nothing
        let status = limiter.status();
        assert_eq!(status.current_window.start, start);
        assert_eq!(status.current_window.count, 1);
        assert_eq!(status.next_window.count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_limiter_realigns_windows() {
        let limiter = limiter(1, 1000);
        let start = Instant::now();

        limiter.schedule(|| async {}).await;
        tokio::time::advance(Duration::from_millis(10_500)).await;
        limiter.schedule(|| async {}).await;

        let status = limiter.status();
        assert_eq!(status.current_window.start, start + Duration::from_secs(10));
        assert_eq!(status.current_window.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_idle_on_fresh_limiter() {
        let limiter = limiter(1, 1000);
        let start = Instant::now();

        limiter.drain_idle().await;
        assert_eq!(Instant::now(), start);
    }
}
