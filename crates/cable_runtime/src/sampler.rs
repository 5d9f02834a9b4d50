//! Registration and scheduling of probe samplers.

use std::collections::BTreeMap;

use cable_core::{CellMember, SampleRecord};

pub type SamplerHandle = u64;

/// Callback invoked once per macro-step with the contiguous samples of one
/// probe. The records are only valid for the duration of the call.
pub type SamplerFn = Box<dyn FnMut(CellMember, &[SampleRecord]) + Send>;

/// Sample times requested by a sampler.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    /// Every `dt` ms.
    Regular { dt: f64 },
    /// An explicit, ascending list of times.
    Explicit { times: Vec<f64> },
}

impl Schedule {
    pub fn regular(dt: f64) -> Self {
        assert!(dt > 0.0, "schedule interval must be positive");
        Schedule::Regular { dt }
    }

    pub fn explicit(times: Vec<f64>) -> Self {
        assert!(
            times.windows(2).all(|w| w[0] <= w[1]),
            "schedule times must ascend"
        );
        Schedule::Explicit { times }
    }

    /// Event times in (t0, t1].
    pub fn events(&self, t0: f64, t1: f64) -> Vec<f64> {
        match self {
            Schedule::Regular { dt } => {
                // Both boundary comparisons carry a tolerance so integer
                // multiples landing on an epoch boundary are emitted by
                // exactly one epoch despite rounding.
                let mut times = Vec::new();
                let mut k = (t0 / dt).floor() as i64;
                while k as f64 * dt <= t0 + dt * 1e-9 {
                    k += 1;
                }
                while k as f64 * dt <= t1 + dt * 1e-9 {
                    times.push((k as f64 * dt).min(t1));
                    k += 1;
                }
                times
            }
            Schedule::Explicit { times } => times
                .iter()
                .copied()
                .filter(|&t| t > t0 && t <= t1)
                .collect(),
        }
    }
}

pub struct SamplerAssociation {
    pub schedule: Schedule,
    pub sampler: SamplerFn,
    pub probe_ids: Vec<CellMember>,
}

/// Handle → (schedule, callback, probe set) registry of one cell group.
#[derive(Default)]
pub struct SamplerMap {
    next_handle: SamplerHandle,
    assocs: BTreeMap<SamplerHandle, SamplerAssociation>,
}

impl SamplerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, assoc: SamplerAssociation) -> SamplerHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.assocs.insert(handle, assoc);
        handle
    }

    pub fn remove(&mut self, handle: SamplerHandle) {
        self.assocs.remove(&handle);
    }

    pub fn clear(&mut self) {
        self.assocs.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.assocs.is_empty()
    }

    pub fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (&SamplerHandle, &mut SamplerAssociation)> {
        self.assocs.iter_mut()
    }

    pub fn get_mut(&mut self, handle: SamplerHandle) -> Option<&mut SamplerAssociation> {
        self.assocs.get_mut(&handle)
    }
}
