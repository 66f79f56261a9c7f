//! Fixed-length quota windows.

use std::time::Duration;
use tokio::time::Instant;

/// One quota epoch and the number of tasks admitted within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// When this epoch begins
    pub start: Instant,
    /// Tasks admitted within this epoch so far
    pub count: u32,
}

impl Window {
    fn empty(start: Instant) -> Self {
        Self { start, count: 0 }
    }
}

/// The current window and the one directly after it.
///
/// `next.start == current.start + interval` holds after every operation.
#[derive(Debug, Clone)]
pub struct WindowPair {
    current: Window,
    next: Window,
    interval: Duration,
}

impl WindowPair {
    /// Open a window at `now`. `interval` must be non-zero.
    pub fn new(now: Instant, interval: Duration) -> Self {
        Self {
            current: Window::empty(now),
            next: Window::empty(now + interval),
            interval,
        }
    }

    pub fn current(&self) -> Window {
        self.current
    }

    pub fn next(&self) -> Window {
        self.next
    }

    /// Advance the pair until `current` contains `now`.
    ///
    /// A single step promotes `next` and keeps its count. When the pair is more
    /// than one interval behind, every skipped window was empty, so the pair
    /// jumps straight to the window containing `now`.
    pub fn rotate(&mut self, now: Instant) {
        if now < self.next.start {
            return;
        }

        let behind = now - self.next.start;
        if behind < self.interval {
            self.current = self.next;
        } else {
            let skipped = whole_intervals(behind, self.interval);
            self.current = Window::empty(self.next.start + skipped);
        }
        self.next = Window::empty(self.current.start + self.interval);
    }

    /// Whether the current window can admit another task under `limit`.
    pub fn has_capacity(&self, limit: u32) -> bool {
        self.current.count < limit
    }

    /// Count one admitted task.
    ///
    /// The current window is charged while it has room. Otherwise the task is
    /// booked against the next window, which then opens with that much less room.
    pub fn charge(&mut self, limit: u32) {
        if self.current.count < limit {
            self.current.count += 1;
        } else {
            self.next.count += 1;
        }
    }

    /// Time left until the next window opens, zero if it already has.
    pub fn until_next(&self, now: Instant) -> Duration {
        self.next.start.saturating_duration_since(now)
    }
}

/// `elapsed` rounded down to a whole multiple of `interval`.
fn whole_intervals(elapsed: Duration, interval: Duration) -> Duration {
    let interval_nanos = interval.as_nanos();
    let nanos = (elapsed.as_nanos() / interval_nanos) * interval_nanos;
    Duration::new(
        (nanos / 1_000_000_000) as u64,
        (nanos % 1_000_000_000) as u32,
    )
}
