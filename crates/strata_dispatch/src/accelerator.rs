//! # Accelerator Capability
//!
//! Optional higher-capability execution resource, resolved once at startup.
//!
//! ```text
//!   AcceleratorProbe::probe() ──> Some(accelerator) ──> AcceleratorSlot (cached)
//!                            └──> None              ──> every hinted batch runs on CPU
//! ```
//!
//! The slot never re-probes. Degradation (absent, refusing, timing out) is
//! logged once and again only after the accelerator has accepted work.

use std::sync::Arc;
use std::time::Duration;

use strata_core::StateLatch;

use crate::backend::{BackendError, BatchMeta, Job};

/// Description of accelerator-eligible work attached to a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceleratedWorkload {
    /// Kernel family the accelerator should prepare.
    pub kernel: String,
    /// Work units covered by the batch.
    pub units: usize,
}

impl AcceleratedWorkload {
    /// Creates a workload description.
    pub fn new(kernel: impl Into<String>, units: usize) -> Self {
        Self {
            kernel: kernel.into(),
            units,
        }
    }
}

/// A higher-capability execution resource.
pub trait Accelerator: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Offers the jobs. Must either accept all of them or none, and must
    /// return within `timeout`.
    ///
    /// # Errors
    ///
    /// Any error sends the batch to the CPU backend.
    fn submit(
        &self,
        meta: &BatchMeta,
        workload: &AcceleratedWorkload,
        jobs: Vec<Job>,
        timeout: Duration,
    ) -> Result<(), BackendError>;
}

/// Capability probe run once when the dispatcher is built.
pub trait AcceleratorProbe {
    /// Returns the accelerator if one is usable on this host.
    fn probe(&self) -> Option<Arc<dyn Accelerator>>;
}

impl<F> AcceleratorProbe for F
where
    F: Fn() -> Option<Arc<dyn Accelerator>>,
{
    fn probe(&self) -> Option<Arc<dyn Accelerator>> {
        self()
    }
}

/// Probe for hosts without an accelerator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAccelerator;

impl AcceleratorProbe for NoAccelerator {
    fn probe(&self) -> Option<Arc<dyn Accelerator>> {
        None
    }
}

/// The probe's answer, cached for the dispatcher's lifetime.
pub struct AcceleratorSlot {
    resolved: Option<Arc<dyn Accelerator>>,
    degraded: StateLatch,
}

impl AcceleratorSlot {
    /// Runs the probe once.
    pub fn resolve(probe: &dyn AcceleratorProbe) -> Self {
        let resolved = probe.probe();
        match &resolved {
            Some(accelerator) => {
                tracing::info!(accelerator = accelerator.name(), "accelerator resolved");
            }
            None => tracing::info!("no accelerator available; hinted batches run on CPU"),
        }
        Self {
            resolved,
            degraded: StateLatch::new(),
        }
    }

    /// A slot with no accelerator.
    #[must_use]
    pub fn empty() -> Self {
        Self::resolve(&NoAccelerator)
    }

    /// The resolved accelerator.
    #[must_use]
    pub fn get(&self) -> Option<&Arc<dyn Accelerator>> {
        self.resolved.as_ref()
    }

    /// Whether an accelerator was resolved.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.resolved.is_some()
    }

    /// Whether the last accelerator attempt fell back to CPU.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_set()
    }

    /// Records a CPU fallback, logging only on the first since recovery.
    pub fn note_fallback(&self, batch: &str, reason: &str) {
        if self.degraded.enter() {
            tracing::warn!(batch, reason, "accelerator unavailable; falling back to CPU");
        }
    }

    /// Records an accepted submission, clearing the degraded state.
    pub fn note_accepted(&self) {
        if self.degraded.clear() {
            tracing::info!("accelerator accepting work again");
        }
    }
}

impl std::fmt::Debug for AcceleratorSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceleratorSlot")
            .field("accelerator", &self.resolved.as_ref().map(|a| a.name().to_string()))
            .field("degraded", &self.degraded.is_set())
            .finish()
    }
}
