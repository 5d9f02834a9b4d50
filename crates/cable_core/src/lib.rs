#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel parent index marking the root CV of each cell.
pub const PARENT_NONE: u32 = u32::MAX;

/// Global cell identifier, assigned by the recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellGid(pub u32);

/// A per-cell item (spike source, event target or probe), addressed by the
/// owning gid and the item's index on that cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellMember {
    pub gid: CellGid,
    pub index: u32,
}

/// Integration interval between two synchronisation points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Epoch {
    pub t0: f64,
    pub tfinal: f64,
}

impl Epoch {
    pub fn new(t0: f64, tfinal: f64) -> Self {
        Self { t0, tfinal }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Spike {
    pub source: CellMember,
    pub time: f64,
}

/// Handle of one event target inside a lowered cell group: the mechanism
/// holding the target and the instance-local index within that mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetHandle {
    pub mech_id: u32,
    pub index: u32,
}

/// Event addressed to a target handle, deliverable within one cell group.
/// `cell` is the group-local cell index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliverableEvent {
    pub cell: u32,
    pub handle: TargetHandle,
    pub time: f64,
    pub weight: f64,
}

/// Event as submitted from outside the group: target is the cell-local
/// target index declared by the recipe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellEvent {
    pub target: u32,
    pub time: f64,
    pub weight: f64,
}

/// Scheduled probe read-out inside one cell group. `offset` addresses the
/// slot in the per-advance sample buffers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleEvent {
    pub cell: u32,
    pub time: f64,
    pub probe: ProbeHandle,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Voltage,
    Current,
}

/// Resolved probe: which state array to read and at which CV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeHandle {
    pub kind: ProbeKind,
    pub cv: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRecord {
    pub time: f64,
    pub value: f64,
}

/// Event-time rounding applied when staging external events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BinningPolicy {
    #[default]
    None,
    Regular {
        interval: f64,
    },
    Following {
        interval: f64,
    },
}

/// Stateful per-cell binner. `Following` keeps reusing the first event time
/// of a burst until events fall more than `interval` after it.
#[derive(Debug, Clone, Copy)]
pub struct EventBinner {
    policy: BinningPolicy,
    last_bin: Option<f64>,
}

impl EventBinner {
    pub fn new(policy: BinningPolicy) -> Self {
        Self {
            policy,
            last_bin: None,
        }
    }

    pub fn reset(&mut self) {
        self.last_bin = None;
    }

    /// Bin `t`, never producing a time earlier than `t_min`.
    pub fn bin(&mut self, t: f64, t_min: f64) -> f64 {
        let binned = match self.policy {
            BinningPolicy::None => t,
            BinningPolicy::Regular { interval } => (t / interval).floor() * interval,
            BinningPolicy::Following { interval } => match self.last_bin {
                Some(last) if t - last < interval => last,
                _ => t,
            },
        };
        let binned = binned.max(t_min);
        self.last_bin = Some(binned);
        binned
    }
}

/// Engine construction options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Upper bound on sub-step length [ms].
    pub dt_max: f64,
    /// Initial membrane voltage [mV].
    pub v_init: f64,
    /// Temperature used for Nernst reversal potentials [K].
    pub temperature_k: f64,
    pub binning: BinningPolicy,
    pub record_voltage_bounds: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            dt_max: 0.025,
            v_init: -65.0,
            temperature_k: 279.45,
            binning: BinningPolicy::None,
            record_voltage_bounds: false,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("dt_max must be positive, got {0}")]
    NonPositiveDtMax(f64),
    #[error("temperature must be positive, got {0} K")]
    NonPositiveTemperature(f64),
    #[error("binning interval must be positive, got {0}")]
    NonPositiveBinInterval(f64),
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.dt_max > 0.0) {
            return Err(ConfigError::NonPositiveDtMax(self.dt_max));
        }
        if !(self.temperature_k > 0.0) {
            return Err(ConfigError::NonPositiveTemperature(self.temperature_k));
        }
        match self.binning {
            BinningPolicy::Regular { interval } | BinningPolicy::Following { interval }
                if !(interval > 0.0) =>
            {
                Err(ConfigError::NonPositiveBinInterval(interval))
            }
            _ => Ok(()),
        }
    }
}
