//! Pending task queue with a backpressure backlog.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;

/// A type-erased task together with the handle that settles its caller.
trait Job: Send {
    fn is_abandoned(&self) -> bool;
    fn run(self: Box<Self>) -> BoxFuture<'static, ()>;
}

struct Pending<F, T> {
    task: F,
    settle: oneshot::Sender<thread::Result<T>>,
}

impl<F, Fut, T> Job for Pending<F, T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    fn is_abandoned(&self) -> bool {
        self.settle.is_closed()
    }

    fn run(self: Box<Self>) -> BoxFuture<'static, ()> {
        let Pending { task, settle } = *self;
        async move {
            // A panic while building the future is caught along with one raised while polling it
            let outcome = AssertUnwindSafe(async move { task().await })
                .catch_unwind()
                .await;
            // The caller may have stopped waiting; the task still counted
            let _ = settle.send(outcome);
        }
        .boxed()
    }
}

/// A submitted task waiting for admission.
pub(crate) struct QueuedTask {
    pub(crate) id: u64,
    job: Box<dyn Job>,
}

impl QueuedTask {
    /// Wrap `task` and return the future its caller awaits.
    pub(crate) fn new<F, Fut>(id: u64, task: F) -> (Self, Scheduled<Fut::Output>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let (settle, outcome) = oneshot::channel();
        let job = Box::new(Pending { task, settle });
        (QueuedTask { id, job }, Scheduled { id, outcome })
    }

    /// Whether the caller dropped its [`Scheduled`] before admission.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.job.is_abandoned()
    }

    /// Invoke the task and settle the caller with its output.
    pub(crate) async fn run(self) {
        self.job.run().await
    }
}

impl fmt::Debug for QueuedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedTask").field("id", &self.id).finish()
    }
}

/// Future returned by [`Limiter::schedule`](super::Limiter::schedule).
///
/// Resolves with the task's own output once the task has run. A panic inside
/// the task is resumed here, in the caller.
#[must_use = "dropping a Scheduled before admission cancels the task"]
#[derive(Debug)]
pub struct Scheduled<T> {
    id: u64,
    outcome: oneshot::Receiver<thread::Result<T>>,
}

impl<T> Scheduled<T> {
    /// Submission sequence number, unique within one limiter.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Future for Scheduled<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.outcome).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Ok(output))) => Poll::Ready(output),
            Poll::Ready(Ok(Err(payload))) => panic::resume_unwind(payload),
            // Only a torn-down drain loop drops a task without running it
            Poll::Ready(Err(_)) => panic!("task {} was dropped by its limiter before running", self.id),
        }
    }
}

/// Where a pushed task ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Appended to the queue
    Queued,
    /// Held in the backlog until the queue has room
    Backlogged,
}

/// FIFO of tasks bounded by `capacity`, with a backlog of submissions waiting
/// for room.
///
/// A pop that frees a slot moves the head of the backlog into the queue, so
/// backlogged submissions keep their relative order.
#[derive(Debug)]
pub(crate) struct PendingQueue {
    queue: VecDeque<QueuedTask>,
    backlog: VecDeque<QueuedTask>,
    capacity: usize,
}

impl PendingQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            backlog: VecDeque::new(),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, task: QueuedTask) -> Placement {
        if self.queue.len() < self.capacity {
            self.queue.push_back(task);
            Placement::Queued
        } else {
            self.backlog.push_back(task);
            Placement::Backlogged
        }
    }

    pub(crate) fn pop(&mut self) -> Option<QueuedTask> {
        let task = self.queue.pop_front()?;
        if let Some(waiting) = self.backlog.pop_front() {
            self.queue.push_back(waiting);
        }
        Some(task)
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.backlog.is_empty()
    }
}
