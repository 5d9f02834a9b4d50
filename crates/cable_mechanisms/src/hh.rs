//! Hodgkin–Huxley sodium and potassium channels with leak.
//!
//! Gate kinetics use the classic squid-axon rate functions; rate constants
//! scale with q10 = 3^((T − 6.3 °C)/10). Gates advance by the exact
//! exponential Euler-backward step, with all voltage-dependent
//! coefficients sampled at the start of the sub-step.

use crate::{gate_step, vtrap, IonDep, Mechanism, MechanismError, MechanismInfo, MechanismKind,
            ParamSpec};
use cable_state::SharedState;

const T_REF_K: f64 = 273.15 + 6.3;

#[derive(Debug, Clone)]
pub struct Hh {
    info: MechanismInfo,
    cv_index: Vec<u32>,
    weight: Vec<f64>,
    /// Position of each instance entry in the `na` / `k` ion arrays.
    na_index: Vec<u32>,
    k_index: Vec<u32>,
    gnabar: Vec<f64>,
    gkbar: Vec<f64>,
    gl: Vec<f64>,
    el: Vec<f64>,
    m: Vec<f64>,
    h: Vec<f64>,
    n: Vec<f64>,
    defaults: [f64; 4],
}

#[derive(Debug, Clone, Copy)]
struct Rates {
    m_inf: f64,
    tau_m: f64,
    h_inf: f64,
    tau_h: f64,
    n_inf: f64,
    tau_n: f64,
}

fn rates(v: f64, tadj: f64) -> Rates {
    let a_m = 0.1 * vtrap(-(v + 40.0), 10.0);
    let b_m = 4.0 * (-(v + 65.0) / 18.0).exp();
    let a_h = 0.07 * (-(v + 65.0) / 20.0).exp();
    let b_h = 1.0 / (1.0 + (-(v + 35.0) / 10.0).exp());
    let a_n = 0.01 * vtrap(-(v + 55.0), 10.0);
    let b_n = 0.125 * (-(v + 65.0) / 80.0).exp();

    let sum_m = a_m + b_m;
    let sum_h = a_h + b_h;
    let sum_n = a_n + b_n;
    Rates {
        m_inf: a_m / sum_m,
        tau_m: 1.0 / (tadj * sum_m),
        h_inf: a_h / sum_h,
        tau_h: 1.0 / (tadj * sum_h),
        n_inf: a_n / sum_n,
        tau_n: 1.0 / (tadj * sum_n),
    }
}

fn tadj(temperature_k: f64) -> f64 {
    3f64.powf((temperature_k - T_REF_K) / 10.0)
}

impl Hh {
    pub fn mechanism_info() -> MechanismInfo {
        MechanismInfo {
            name: "hh".to_string(),
            kind: MechanismKind::Density,
            params: vec![
                ParamSpec::new("gnabar", 0.12, 0.0, f64::INFINITY),
                ParamSpec::new("gkbar", 0.036, 0.0, f64::INFINITY),
                ParamSpec::new("gl", 0.0003, 0.0, f64::INFINITY),
                ParamSpec::new("el", -54.3, f64::NEG_INFINITY, f64::INFINITY),
            ],
            state_vars: vec!["m".to_string(), "h".to_string(), "n".to_string()],
            ions: vec![
                IonDep {
                    name: "na".to_string(),
                    writes_current: true,
                },
                IonDep {
                    name: "k".to_string(),
                    writes_current: true,
                },
            ],
        }
    }
}

impl Default for Hh {
    fn default() -> Self {
        Self {
            info: Self::mechanism_info(),
            cv_index: Vec::new(),
            weight: Vec::new(),
            na_index: Vec::new(),
            k_index: Vec::new(),
            gnabar: Vec::new(),
            gkbar: Vec::new(),
            gl: Vec::new(),
            el: Vec::new(),
            m: Vec::new(),
            h: Vec::new(),
            n: Vec::new(),
            defaults: [0.12, 0.036, 0.0003, -54.3],
        }
    }
}

impl Mechanism for Hh {
    fn info(&self) -> &MechanismInfo {
        &self.info
    }

    fn replace_info(&mut self, info: MechanismInfo) {
        self.info = info;
    }

    fn bind(&mut self, cv_index: Vec<u32>, weights: Vec<f64>) {
        assert_eq!(cv_index.len(), weights.len(), "weight arity mismatch");
        let n = cv_index.len();
        self.gnabar = vec![self.defaults[0]; n];
        self.gkbar = vec![self.defaults[1]; n];
        self.gl = vec![self.defaults[2]; n];
        self.el = vec![self.defaults[3]; n];
        self.m = vec![0.0; n];
        self.h = vec![0.0; n];
        self.n = vec![0.0; n];
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
        let (slot, array) = match param {
            "gnabar" => (0, &mut self.gnabar),
            "gkbar" => (1, &mut self.gkbar),
            "gl" => (2, &mut self.gl),
            "el" => (3, &mut self.el),
            _ => unreachable!(),
        };
        self.defaults[slot] = value;
        array.iter_mut().for_each(|x| *x = value);
        Ok(())
    }

    fn set_ion_index(&mut self, dep: usize, index: Vec<u32>) {
        assert_eq!(index.len(), self.cv_index.len(), "ion index arity mismatch");
        match dep {
            0 => self.na_index = index,
            1 => self.k_index = index,
            _ => panic!("hh has two ion dependencies"),
        }
    }

    fn init(&mut self, state: &mut SharedState) {
        let tadj = tadj(state.temperature_k);
        for (k, &cv) in self.cv_index.iter().enumerate() {
            let r = rates(state.voltage[cv as usize], tadj);
            self.m[k] = r.m_inf;
            self.h[k] = r.h_inf;
            self.n[k] = r.n_inf;
        }
    }

    fn compute_currents(&mut self, state: &mut SharedState) {
        // Sodium, then potassium: one ion borrow at a time. Dependency
        // names come from the installed info so derived renames hold.
        {
            let na = state
                .ion_data
                .get_mut(&self.info.ions[0].name)
                .expect("sodium ion bound before hh currents");
            for (k, &cv) in self.cv_index.iter().enumerate() {
                let v = state.voltage[cv as usize];
                let m = self.m[k];
                let ena = na.ex[self.na_index[k] as usize];
                let i_na = self.gnabar[k] * m * m * m * self.h[k] * (v - ena);
                na.ix[self.na_index[k] as usize] += i_na;
                state.current_density[cv as usize] += self.weight[k] * i_na;
            }
        }
        {
            let kion = state
                .ion_data
                .get_mut(&self.info.ions[1].name)
                .expect("potassium ion bound before hh currents");
            for (k, &cv) in self.cv_index.iter().enumerate() {
                let v = state.voltage[cv as usize];
                let ng = self.n[k];
                let ek = kion.ex[self.k_index[k] as usize];
                let i_k = self.gkbar[k] * ng * ng * ng * ng * (v - ek);
                kion.ix[self.k_index[k] as usize] += i_k;
                state.current_density[cv as usize] += self.weight[k] * i_k;
            }
        }
        for (k, &cv) in self.cv_index.iter().enumerate() {
            let v = state.voltage[cv as usize];
            let i_l = self.gl[k] * (v - self.el[k]);
            state.current_density[cv as usize] += self.weight[k] * i_l;
        }
    }

    fn hash_state(&self, hasher: &mut blake3::Hasher) {
        for array in [&self.m, &self.h, &self.n] {
            for &x in array {
                hasher.update(&x.to_le_bytes());
            }
        }
    }

    fn advance_state(&mut self, state: &mut SharedState) {
        let tadj = tadj(state.temperature_k);
        for (k, &cv) in self.cv_index.iter().enumerate() {
            let v = state.voltage[cv as usize];
            let dt = state.dt_cv[cv as usize];
            let r = rates(v, tadj);
            self.m[k] = gate_step(self.m[k], r.m_inf, r.tau_m, dt);
            self.h[k] = gate_step(self.h[k], r.h_inf, r.tau_h, dt);
            self.n[k] = gate_step(self.n[k], r.n_inf, r.tau_n, dt);
        }
    }
}
