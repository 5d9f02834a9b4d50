//! Passive leak conductance.

use crate::{Mechanism, MechanismError, MechanismInfo, MechanismKind, ParamSpec};
use cable_state::SharedState;

#[derive(Debug, Clone)]
pub struct Pas {
    info: MechanismInfo,
    cv_index: Vec<u32>,
    weight: Vec<f64>,
    /// Conductance density [S/cm²].
    g: Vec<f64>,
    /// Reversal potential [mV].
    e: Vec<f64>,
    g_default: f64,
    e_default: f64,
}

impl Pas {
    pub fn mechanism_info() -> MechanismInfo {
        MechanismInfo {
            name: "pas".to_string(),
            kind: MechanismKind::Density,
            params: vec![
                ParamSpec::new("g", 0.001, 0.0, f64::INFINITY),
                ParamSpec::new("e", -70.0, f64::NEG_INFINITY, f64::INFINITY),
            ],
            state_vars: Vec::new(),
            ions: Vec::new(),
        }
    }
}

impl Default for Pas {
    fn default() -> Self {
        Self {
            info: Self::mechanism_info(),
            cv_index: Vec::new(),
            weight: Vec::new(),
            g: Vec::new(),
            e: Vec::new(),
            g_default: 0.001,
            e_default: -70.0,
        }
    }
}

impl Mechanism for Pas {
    fn info(&self) -> &MechanismInfo {
        &self.info
    }

    fn replace_info(&mut self, info: MechanismInfo) {
        self.info = info;
    }

    fn bind(&mut self, cv_index: Vec<u32>, weights: Vec<f64>) {
        assert_eq!(cv_index.len(), weights.len(), "weight arity mismatch");
        let n = cv_index.len();
        self.g = vec![self.g_default; n];
        self.e = vec![self.e_default; n];
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
            "g" => {
                self.g_default = value;
                self.g.iter_mut().for_each(|x| *x = value);
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

    fn init(&mut self, _state: &mut SharedState) {}

    fn compute_currents(&mut self, state: &mut SharedState) {
        for (k, &cv) in self.cv_index.iter().enumerate() {
            let v = state.voltage[cv as usize];
            // g·(v − e) is in S/cm²·mV = mA/cm².
            let i = self.g[k] * (v - self.e[k]);
            state.current_density[cv as usize] += self.weight[k] * i;
        }
    }

    fn advance_state(&mut self, _state: &mut SharedState) {}
}
