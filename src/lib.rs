//! quota-pacer - windowed request pacing for outbound calls
//!
//! This crate keeps the call volume sent to a remote service under a fixed
//! quota per interval. Excess calls are queued and run, in submission order,
//! as soon as a window has room, instead of being rejected.
//!
//! ```no_run
//! use quota_pacer::config::LimiterConfig;
//! use quota_pacer::ratelimit::Limiter;
//!
//! # #[tokio::main]
//! # async fn main() -> quota_pacer::error::Result<()> {
//! let limiter = Limiter::new("public", &LimiterConfig::new(2, 1000))?;
//!
//! // The third call waits for the next one-second window
//! let calls: Vec<_> = (0..3)
//!     .map(|i| limiter.schedule(move || async move { i * 10 }))
//!     .collect();
//! assert_eq!(futures::future::join_all(calls).await, vec![0, 10, 20]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;
