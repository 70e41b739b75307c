//! # STRATA
//!
//! Background precomputation engine for tick-driven hosts.
//!
//! ```text
//! host thread                         background
//! ───────────                         ──────────
//! pre_schedule(unit) ──> batcher ──> dispatcher ──> worker pool / accelerator
//!                                                      │
//! on_tick(signal) <── main-thread queue <── results ───┘
//! ```
//!
//! The host never blocks: producers schedule regions, workers compute them,
//! and anything that must touch host state comes back through the
//! [`MainThreadIntegrationQueue`], drained under a budget at tick end.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use strata::{Engine, StrataConfig, TickSignal};
//!
//! let engine = Engine::builder(StrataConfig::default()).build().unwrap();
//! engine.submit_to_main_thread(|| println!("back on the host thread"));
//!
//! let report = engine.on_tick(TickSignal::new(
//!     Duration::from_millis(4),
//!     Duration::from_millis(16),
//! ));
//! assert_eq!(report.drain.executed, 1);
//! engine.shutdown();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod engine;
pub mod main_thread;
pub mod stats;

pub use engine::{Engine, EngineBuilder, EngineCounters, LimiterTuner, TickReport, TickSignal};
pub use main_thread::{
    DrainReport, HostScheduler, MainTask, MainThreadIntegrationQueue, QueueStats, StopReason,
};
pub use stats::TickStatsAccumulator;

pub use strata_cache as cache;
pub use strata_core::{
    Clock, CompletionHandle, ManualClock, SharedClock, SliceError, StrataConfig, StrataError,
    StrataResult, SystemClock,
};
pub use strata_dispatch as dispatch;
pub use strata_spatial::{
    RegionKey, ScheduleContext, ScheduleDecision, SpatialWorkBatcher, UnitPos, UnitWork,
};
