#![forbid(unsafe_code)]

//! Kinetic mechanisms and the catalogue that binds them to cell groups.
//!
//! A mechanism is a polymorphic value over the operations `init`,
//! `compute_currents`, `advance_state`, `net_receive` and `reset`,
//! dispatched over its CV index list. Density mechanisms contribute
//! current density [mA/cm²] weighted by their area coverage; point
//! mechanisms contribute nA currents converted by a `100/area` weight.

use std::collections::BTreeMap;

use cable_state::SharedState;
use thiserror::Error;

mod expsyn;
mod hh;
mod pas;

pub use expsyn::ExpSyn;
pub use hh::Hh;
pub use pas::Pas;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismKind {
    Density,
    Point,
}

/// Declared parameter field with its default and valid range (inclusive).
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub default: f64,
    pub min: f64,
    pub max: f64,
}

impl ParamSpec {
    pub fn new(name: &str, default: f64, min: f64, max: f64) -> Self {
        Self {
            name: name.to_string(),
            default,
            min,
            max,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

/// Ion dependency of a mechanism. `writes_current` marks deps that
/// accumulate into the ion's `iX` array; all deps read the reversal
/// potential.
#[derive(Debug, Clone, PartialEq)]
pub struct IonDep {
    pub name: String,
    pub writes_current: bool,
}

/// Immutable description of one compiled mechanism.
#[derive(Debug, Clone, PartialEq)]
pub struct MechanismInfo {
    pub name: String,
    pub kind: MechanismKind,
    pub params: Vec<ParamSpec>,
    pub state_vars: Vec<String>,
    pub ions: Vec<IonDep>,
}

impl MechanismInfo {
    /// Digest of the compiled layout; two parameter sets interoperate only
    /// when their fingerprints agree.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"CABLE:MECH:FINGERPRINT");
        hasher.update(self.name.as_bytes());
        hasher.update(&[match self.kind {
            MechanismKind::Density => 0u8,
            MechanismKind::Point => 1u8,
        }]);
        hasher.update(&(self.params.len() as u32).to_le_bytes());
        for param in &self.params {
            hasher.update(param.name.as_bytes());
            hasher.update(&param.default.to_le_bytes());
        }
        for var in &self.state_vars {
            hasher.update(var.as_bytes());
        }
        for ion in &self.ions {
            hasher.update(ion.name.as_bytes());
            hasher.update(&[ion.writes_current as u8]);
        }
        *hasher.finalize().as_bytes()
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum MechanismError {
    #[error("no such mechanism: {0}")]
    NoSuchMechanism(String),
    #[error("fingerprint mismatch for mechanism {name}")]
    FingerprintMismatch { name: String },
    #[error("no such parameter {param} on mechanism {name}")]
    NoSuchParameter { name: String, param: String },
    #[error("invalid value {value} for parameter {param} on mechanism {name}")]
    InvalidParameterValue {
        name: String,
        param: String,
        value: f64,
    },
    #[error("invalid ion remap on mechanism {name}: {ion}")]
    InvalidIonRemap { name: String, ion: String },
    #[error("invalid operation: net_receive on non-point mechanism {0}")]
    InvalidOperation(String),
}

/// One mechanism bound to a subset of CVs.
///
/// Binding protocol, driven by the engine: `bind` with the sorted CV list
/// and per-instance weights, then parameter overrides via `set_param`,
/// then `set_ion_index` for every ion dependency, then `init` once the
/// shared voltage is in its initial state.
pub trait Mechanism: Send {
    fn info(&self) -> &MechanismInfo;

    /// Install the catalogue's view of this mechanism (used for derived
    /// entries whose name or ion bindings differ from the base).
    fn replace_info(&mut self, info: MechanismInfo);

    /// Attach to `cv_index` (ascending, duplicates allowed for point
    /// mechanisms) with matching per-instance weights.
    fn bind(&mut self, cv_index: Vec<u32>, weights: Vec<f64>);

    fn cv_index(&self) -> &[u32];

    /// Override a parameter across the whole instance.
    fn set_param(&mut self, param: &str, value: f64) -> Result<(), MechanismError>;

    /// Provide the instance-to-ion-array index map for ion dependency
    /// `dep` (position in `info().ions`).
    fn set_ion_index(&mut self, dep: usize, index: Vec<u32>);

    /// Set state to steady state at the current voltage.
    fn init(&mut self, state: &mut SharedState);

    /// Accumulate membrane currents at the start-of-sub-step voltage.
    fn compute_currents(&mut self, state: &mut SharedState);

    /// Integrate internal state by each CV's dt. Never writes voltage.
    fn advance_state(&mut self, state: &mut SharedState);

    /// Deliver one event on instance-local index `index`.
    fn net_receive(&mut self, index: usize, weight: f64) -> Result<(), MechanismError> {
        let _ = (index, weight);
        Err(MechanismError::InvalidOperation(self.info().name.clone()))
    }

    /// Back to the post-`init` state.
    fn reset(&mut self, state: &mut SharedState) {
        self.init(state);
    }

    /// Feed the mutable state fields into a digest, in declaration order.
    fn hash_state(&self, hasher: &mut blake3::Hasher) {
        let _ = hasher;
    }
}

/// Factory for a fresh, unbound mechanism instance.
pub type MechBuilder = fn() -> Box<dyn Mechanism>;

/// Name → factory registry of compiled mechanisms.
pub struct Catalogue {
    entries: BTreeMap<String, (MechanismInfo, MechBuilder)>,
    /// Derived-name → (base name, ion renames) bookkeeping, used to detect
    /// conflicting remaps.
    remaps: BTreeMap<String, Vec<(String, String)>>,
}

impl Catalogue {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
            remaps: BTreeMap::new(),
        }
    }

    /// The built-in mechanisms.
    pub fn builtin() -> Self {
        let mut cat = Self::empty();
        cat.register(Pas::mechanism_info(), || Box::<Pas>::default());
        cat.register(Hh::mechanism_info(), || Box::<Hh>::default());
        cat.register(ExpSyn::mechanism_info(), || Box::<ExpSyn>::default());
        cat
    }

    pub fn register(&mut self, info: MechanismInfo, builder: MechBuilder) {
        self.entries.insert(info.name.clone(), (info, builder));
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn info(&self, name: &str) -> Result<&MechanismInfo, MechanismError> {
        self.entries
            .get(name)
            .map(|(info, _)| info)
            .ok_or_else(|| MechanismError::NoSuchMechanism(name.to_string()))
    }

    pub fn fingerprint(&self, name: &str) -> Result<[u8; 32], MechanismError> {
        Ok(self.info(name)?.fingerprint())
    }

    pub fn make(&self, name: &str) -> Result<Box<dyn Mechanism>, MechanismError> {
        let (info, builder) = self
            .entries
            .get(name)
            .ok_or_else(|| MechanismError::NoSuchMechanism(name.to_string()))?;
        let mut mech = builder();
        mech.replace_info(info.clone());
        Ok(mech)
    }

    /// As `make`, but verify the caller's compiled fingerprint first.
    pub fn make_checked(
        &self,
        name: &str,
        fingerprint: [u8; 32],
    ) -> Result<Box<dyn Mechanism>, MechanismError> {
        if self.fingerprint(name)? != fingerprint {
            return Err(MechanismError::FingerprintMismatch {
                name: name.to_string(),
            });
        }
        self.make(name)
    }

    /// Register `derived` as `base` with ion dependencies renamed.
    /// Conflicting re-registrations and renames of ions the base does not
    /// use are rejected.
    pub fn derive(
        &mut self,
        base: &str,
        derived: &str,
        ion_remap: &[(String, String)],
    ) -> Result<(), MechanismError> {
        let (info, builder) = self
            .entries
            .get(base)
            .ok_or_else(|| MechanismError::NoSuchMechanism(base.to_string()))?;
        let mut info = info.clone();
        let builder = *builder;

        for (from, to) in ion_remap {
            let dep = info
                .ions
                .iter_mut()
                .find(|dep| &dep.name == from)
                .ok_or_else(|| MechanismError::InvalidIonRemap {
                    name: base.to_string(),
                    ion: from.clone(),
                })?;
            dep.name = to.clone();
        }

        if let Some(previous) = self.remaps.get(derived) {
            if previous != ion_remap {
                return Err(MechanismError::InvalidIonRemap {
                    name: derived.to_string(),
                    ion: ion_remap
                        .first()
                        .map(|(from, _)| from.clone())
                        .unwrap_or_default(),
                });
            }
        }

        info.name = derived.to_string();
        self.remaps.insert(derived.to_string(), ion_remap.to_vec());
        self.entries.insert(derived.to_string(), (info, builder));
        Ok(())
    }
}

impl Default for Catalogue {
    fn default() -> Self {
        Self::builtin()
    }
}

/// `x / (exp(x/y) − 1)`, stable near the removable singularity.
pub(crate) fn vtrap(x: f64, y: f64) -> f64 {
    let r = x / y;
    if r.abs() < 1e-6 {
        y * (1.0 - r / 2.0)
    } else {
        x / (r.exp() - 1.0)
    }
}

/// Exponential Euler-backward gate update:
/// `x + (1 − exp(−dt/τ))·(x∞ − x)`.
pub(crate) fn gate_step(x: f64, x_inf: f64, tau: f64, dt: f64) -> f64 {
    x + (1.0 - (-dt / tau).exp()) * (x_inf - x)
}
