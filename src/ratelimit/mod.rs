//! Windowed admission of queued tasks.

mod limiter;
mod queue;
mod registry;
mod window;

pub use limiter::{Limiter, LimiterStatus, WindowStatus};
pub use queue::Scheduled;
pub use registry::Limiters;
pub use window::{Window, WindowPair};
