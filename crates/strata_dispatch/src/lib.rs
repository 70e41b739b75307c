//! # STRATA Dispatch
//!
//! Parallel fan-out/fan-in execution for batches of independent slices.
//!
//! ## Components
//!
//! - [`ParallelDispatcher`]: splits a batch into jobs sized by a per-kind
//!   cost model, preserves slice order, caches slice results on request
//! - [`WorkerPoolBackend`]: bounded, all-or-nothing worker pool
//! - [`Accelerator`]: optional higher-capability backend, probed once
//! - [`FallbackLane`]: sequential lane that finishes saturated batches
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use strata_core::{DispatchConfig, SliceError};
//! use strata_dispatch::{DispatchOptions, ParallelDispatcher, WorkerPoolBackend};
//!
//! let backend = Arc::new(WorkerPoolBackend::new("doc-pool", 2, 64));
//! let dispatcher = ParallelDispatcher::builder(DispatchConfig::default(), backend).build();
//!
//! let slices: Vec<_> = (0..4u32)
//!     .map(|i| move || Ok::<_, SliceError>(i * i))
//!     .collect();
//! let squares = dispatcher
//!     .dispatch("squares", slices, DispatchOptions::new())
//!     .wait()
//!     .unwrap();
//! assert_eq!(squares, vec![0, 1, 4, 9]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod accelerator;
pub mod backend;
pub mod cost;
pub mod dispatcher;
pub mod fallback;

pub use accelerator::{
    AcceleratedWorkload, Accelerator, AcceleratorProbe, AcceleratorSlot, NoAccelerator,
};
pub use backend::{
    BackendError, BatchMeta, ExecutionBackend, Job, ResourceHint, WorkerPoolBackend,
};
pub use cost::CostModel;
pub use dispatcher::{
    BatchHandle, DispatchOptions, DispatchStats, DispatcherBuilder, ParallelDispatcher,
    PendingBatch, SliceCacheOptions, SliceCallback, SliceFn, SliceKeyFn,
};
pub use fallback::FallbackLane;
