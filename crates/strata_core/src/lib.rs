//! # STRATA Core
//!
//! Shared substrate for the background precomputation engine:
//! - Error taxonomy (`StrataError`, `SliceError`)
//! - TOML configuration (`StrataConfig`)
//! - Adaptive concurrency limiter with RAII tokens
//! - One-shot completion handles usable as blocking handles or futures
//! - Delayed-task timer, clocks and log throttling
//!
//! ## Example
//!
//! ```rust
//! use strata_core::AdaptiveConcurrencyLimiter;
//!
//! let limiter = AdaptiveConcurrencyLimiter::new(2, 1, 8);
//! let token = limiter.enter();
//! assert_eq!(limiter.active(), 1);
//! drop(token);
//! assert_eq!(limiter.active(), 0);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod clock;
pub mod completion;
pub mod config;
pub mod error;
pub mod limiter;
pub mod throttle;
pub mod timer;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use completion::{completion, Completer, CompletionHandle};
pub use config::{
    BatcherConfig, CacheConfig, ConfigError, DispatchConfig, LimiterConfig, MainThreadConfig,
    StrataConfig,
};
pub use error::{panic_message, SliceError, StrataError, StrataResult};
pub use limiter::{AdaptiveConcurrencyLimiter, LimiterToken};
pub use throttle::{LogThrottle, StateLatch};
pub use timer::Timer;
