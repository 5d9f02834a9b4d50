//! Single-exponential synapse. Events add their weight to the conductance,
//! which then decays with time constant tau.

use crate::{Mechanism, MechanismError, MechanismInfo, MechanismKind, ParamSpec};
use cable_state::SharedState;

#[derive(Debug, Clone)]
pub struct ExpSyn {
    info: MechanismInfo,
    cv_index: Vec<u32>,
    weight: Vec<f64>,
    /// Decay time constant [ms].
    tau: Vec<f64>,
    /// Reversal potential [mV].
    e: Vec<f64>,
    /// Conductance [µS].
    g: Vec<f64>,
    tau_default: f64,
    e_default: f64,
}

impl ExpSyn {
    pub fn mechanism_info() -> MechanismInfo {
        MechanismInfo {
            name: "expsyn".to_string(),
            kind: MechanismKind::Point,
            params: vec![
                ParamSpec::new("tau", 2.0, 1e-9, f64::INFINITY),
                ParamSpec::new("e", 0.0, f64::NEG_INFINITY, f64::INFINITY),
            ],
            state_vars: vec!["g".to_string()],
            ions: Vec::new(),
        }
    }

    pub fn conductances(&self) -> &[f64] {
        &self.g
    }
}

impl Default for ExpSyn {
    fn default() -> Self {
        Self {
            info: Self::mechanism_info(),
            cv_index: Vec::new(),
            weight: Vec::new(),
            tau: Vec::new(),
            e: Vec::new(),
            g: Vec::new(),
            tau_default: 2.0,
            e_default: 0.0,
        }
    }
}

impl Mechanism for ExpSyn {
    fn info(&self) -> &MechanismInfo {
        &self.info
    }

    fn replace_info(&mut self, info: MechanismInfo) {
        self.info = info;
    }

    fn bind(&mut self, cv_index: Vec<u32>, weights: Vec<f64>) {
        assert_eq!(cv_index.len(), weights.len(), "weight arity mismatch");
        let n = cv_index.len();
        self.tau = vec![self.tau_default; n];
        self.e = vec![self.e_default; n];
        self.g = vec![0.0; n];
        self.cv_index = cv_index;
        self.weight = weights;
    }

    fn cv_index(&self) -> &[u32] {
        &self.cv_index
    }

    fn set_param(&mut self, param: &str, value: f64) -> Result<(), MechanismError> {
        let spec = self.info.param(param).ok_or_else(|| {
            MechanismError::NoSuchParameter {
                name: self.info.name.clone(),
                param: param.to_string(),
            }
        })?;
        if !spec.contains(value) {
            return Err(MechanismError::InvalidParameterValue {
                name: self.info.name.clone(),
                param: param.to_string(),
                value,
            });
        }
        match param {
            "tau" => {
                self.tau_default = value;
                self.tau.iter_mut().for_each(|x| *x = value);
            }
            "e" => {
                self.e_default = value;
                self.e.iter_mut().for_each(|x| *x = value);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn set_ion_index(&mut self, _dep: usize, _index: Vec<u32>) {}

    fn init(&mut self, _state: &mut SharedState) {
        self.g.iter_mut().for_each(|x| *x = 0.0);
    }

    fn compute_currents(&mut self, state: &mut SharedState) {
        // Instances sharing a CV accumulate in index order; the scalar
        // loop is the serialising reduction.
        for (k, &cv) in self.cv_index.iter().enumerate() {
            let v = state.voltage[cv as usize];
            // g·(v − e) is in nA; the bound weight folds in 100/area.
            let i = self.g[k] * (v - self.e[k]);
            state.current_density[cv as usize] += self.weight[k] * i;
        }
    }

    fn advance_state(&mut self, state: &mut SharedState) {
        for (k, &cv) in self.cv_index.iter().enumerate() {
            let dt = state.dt_cv[cv as usize];
            self.g[k] *= (-dt / self.tau[k]).exp();
        }
    }

    fn net_receive(&mut self, index: usize, weight: f64) -> Result<(), MechanismError> {
        self.g[index] += weight;
        Ok(())
    }

    fn hash_state(&self, hasher: &mut blake3::Hasher) {
        for &g in &self.g {
            hasher.update(&g.to_le_bytes());
        }
    }
}
