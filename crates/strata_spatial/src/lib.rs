//! # STRATA Spatial
//!
//! Region-level batching for spatially keyed precomputation.
//!
//! Producers ask for individual units; the batcher schedules the owning
//! region once per TTL, buffers it, and submits whole regions to the
//! [`strata_dispatch::ParallelDispatcher`] as named batches.
//!
//! ## Example
//!
//! ```rust
//! use strata_spatial::{RegionKey, ScheduleDecision, ScheduleTable};
//!
//! let table = ScheduleTable::new(30_000, 128);
//! let region = RegionKey::new(0, 3, -1);
//! assert_eq!(table.decide(region, 1_000, false), ScheduleDecision::Fresh);
//! assert_eq!(table.decide(region, 2_000, false), ScheduleDecision::Hit);
//! assert_eq!(table.decide(region, 3_000, true), ScheduleDecision::Escalated);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod batcher;
pub mod region;
pub mod schedule;

pub use batcher::{BatcherStats, RegionBatcher, ScheduleContext, SpatialWorkBatcher, UnitWork};
pub use region::{RegionKey, UnitPos};
pub use schedule::{ScheduleDecision, ScheduleState, ScheduleTable};
