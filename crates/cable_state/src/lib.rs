#![forbid(unsafe_code)]

//! Mutable per-CV state shared by the solver and every mechanism of one
//! cell group, plus per-ion state and the threshold watcher.
//!
//! Ion state fields follow the conventional naming, where X stands for the
//! ion: `iX` current density, `eX` reversal potential, `Xi`/`Xo` internal
//! and external concentrations.

use std::collections::BTreeMap;
use std::marker::PhantomData;

/// Ideal gas constant [J/(K·mol)].
const GAS_CONSTANT: f64 = 8.31446261815324;
/// Faraday constant [C/mol].
const FARADAY: f64 = 96485.33212331001;

/// Storage contract for state arrays: padded allocation so vectorised
/// kernels may run whole lanes past the logical length, plus bulk
/// fill/copy. One implementation per execution backend.
pub trait Backend {
    /// Pad unit in f64 lanes.
    const WIDTH: usize;

    fn padded(n: usize) -> usize {
        n.div_ceil(Self::WIDTH) * Self::WIDTH
    }

    /// Allocate a padded array of logical length `n`.
    fn alloc(n: usize, value: f64) -> Vec<f64> {
        vec![value; Self::padded(n)]
    }

    fn fill(array: &mut [f64], value: f64) {
        array.iter_mut().for_each(|x| *x = value);
    }

    fn copy_in(array: &mut [f64], values: &[f64]) {
        array[..values.len()].copy_from_slice(values);
    }

    fn copy_out(array: &[f64], out: &mut [f64]) {
        out.copy_from_slice(&array[..out.len()]);
    }
}

/// CPU backend; lanes match a 256-bit SIMD register of f64.
#[derive(Debug, Clone, Copy, Default)]
pub struct Multicore;

impl Backend for Multicore {
    const WIDTH: usize = 4;
}

/// Static description of an ionic species.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IonInfo {
    pub charge: i32,
    /// Default internal concentration [mM].
    pub default_int_concentration: f64,
    /// Default external concentration [mM].
    pub default_ext_concentration: f64,
}

/// Per-ion state over the CVs touched by any mechanism using the ion.
#[derive(Debug, Clone)]
pub struct IonState {
    pub info: IonInfo,
    /// Instance-to-CV map, ascending.
    pub node_index: Vec<u32>,
    /// Ion current density [mA/cm²].
    pub ix: Vec<f64>,
    /// Reversal potential [mV].
    pub ex: Vec<f64>,
    /// Internal concentration [mM].
    pub xi: Vec<f64>,
    /// External concentration [mM].
    pub xo: Vec<f64>,
    weight_xi: Vec<f64>,
    weight_xo: Vec<f64>,
}

impl IonState {
    pub fn new<B: Backend>(
        info: IonInfo,
        node_index: Vec<u32>,
        iconc_norm_area: Vec<f64>,
        econc_norm_area: Vec<f64>,
    ) -> Self {
        let n = node_index.len();
        assert_eq!(iconc_norm_area.len(), n, "ion weight length mismatch");
        assert_eq!(econc_norm_area.len(), n, "ion weight length mismatch");
        let mut weight_xi = B::alloc(n, 1.0);
        let mut weight_xo = B::alloc(n, 1.0);
        B::copy_in(&mut weight_xi, &iconc_norm_area);
        B::copy_in(&mut weight_xo, &econc_norm_area);
        Self {
            info,
            ix: B::alloc(n, 0.0),
            ex: B::alloc(n, 0.0),
            xi: B::alloc(n, 0.0),
            xo: B::alloc(n, 0.0),
            weight_xi,
            weight_xo,
            node_index,
        }
    }

    pub fn len(&self) -> usize {
        self.node_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_index.is_empty()
    }

    pub fn zero_current(&mut self) {
        self.ix.iter_mut().for_each(|x| *x = 0.0);
    }

    /// Concentrations as the area-weighted proportion of the defaults.
    pub fn init_concentration(&mut self) {
        for i in 0..self.len() {
            self.xi[i] = self.info.default_int_concentration * self.weight_xi[i];
            self.xo[i] = self.info.default_ext_concentration * self.weight_xo[i];
        }
    }

    /// Reversal potential from the Nernst equation at `temperature_k` [mV].
    pub fn nernst(&mut self, temperature_k: f64) {
        let factor = 1e3 * GAS_CONSTANT * temperature_k / (self.info.charge as f64 * FARADAY);
        for i in 0..self.len() {
            self.ex[i] = factor * (self.xo[i] / self.xi[i]).ln();
        }
    }

    pub fn reset(&mut self, temperature_k: f64) {
        self.zero_current();
        self.init_concentration();
        self.nernst(temperature_k);
    }
}

/// Shared mutable arrays of one cell group, sized by total CV and cell
/// counts. Exclusively owned by the group's integration task during
/// `advance`.
#[derive(Debug, Clone)]
pub struct SharedState<B: Backend = Multicore> {
    pub n_cell: usize,
    pub n_cv: usize,

    /// CV index to cell index.
    pub cv_to_cell: Vec<u32>,
    /// Cell index to integration start time [ms].
    pub time: Vec<f64>,
    /// Cell index to integration stop time [ms].
    pub time_to: Vec<f64>,
    /// Cell index to (stop − start) [ms].
    pub dt_cell: Vec<f64>,
    /// CV index to dt [ms].
    pub dt_cv: Vec<f64>,
    /// Membrane voltage [mV].
    pub voltage: Vec<f64>,
    /// Membrane current density [mA/cm²].
    pub current_density: Vec<f64>,

    pub ion_data: BTreeMap<String, IonState>,

    /// Temperature used for Nernst reversal and kinetic q10 factors [K].
    pub temperature_k: f64,

    backend: PhantomData<B>,
}

impl<B: Backend> SharedState<B> {
    pub fn new(n_cell: usize, cv_to_cell: Vec<u32>) -> Self {
        let n_cv = cv_to_cell.len();
        assert!(
            cv_to_cell.iter().all(|&c| (c as usize) < n_cell),
            "cv_to_cell out of range"
        );
        Self {
            n_cell,
            n_cv,
            cv_to_cell,
            time: vec![0.0; n_cell],
            time_to: vec![0.0; n_cell],
            dt_cell: vec![0.0; n_cell],
            dt_cv: B::alloc(n_cv, 0.0),
            voltage: B::alloc(n_cv, 0.0),
            current_density: B::alloc(n_cv, 0.0),
            ion_data: BTreeMap::new(),
            temperature_k: 279.45,
            backend: PhantomData,
        }
    }

    pub fn add_ion(
        &mut self,
        name: &str,
        info: IonInfo,
        node_index: Vec<u32>,
        iconc_norm_area: Vec<f64>,
        econc_norm_area: Vec<f64>,
    ) {
        self.ion_data.insert(
            name.to_string(),
            IonState::new::<B>(info, node_index, iconc_norm_area, econc_norm_area),
        );
    }

    /// Zero the shared current density and every ion current.
    pub fn zero_currents(&mut self) {
        self.current_density.iter_mut().for_each(|x| *x = 0.0);
        for ion in self.ion_data.values_mut() {
            ion.zero_current();
        }
    }

    /// Set `time_to` to the earliest of `time + dt_step` and `tmax`.
    pub fn update_time_to(&mut self, dt_step: f64, tmax: f64) {
        for cell in 0..self.n_cell {
            self.time_to[cell] = (self.time[cell] + dt_step).min(tmax);
        }
    }

    /// Propagate per-cell dt to the per-CV array.
    pub fn set_dt(&mut self) {
        for cell in 0..self.n_cell {
            self.dt_cell[cell] = self.time_to[cell] - self.time[cell];
        }
        for cv in 0..self.n_cv {
            self.dt_cv[cv] = self.dt_cell[self.cv_to_cell[cv] as usize];
        }
    }

    /// Minimum and maximum cell time [ms].
    pub fn time_bounds(&self) -> (f64, f64) {
        bounds(&self.time[..self.n_cell])
    }

    /// Minimum and maximum membrane voltage [mV].
    pub fn voltage_bounds(&self) -> (f64, f64) {
        bounds(&self.voltage[..self.n_cv])
    }

    pub fn reset(&mut self, initial_voltage: f64, temperature_k: f64) {
        self.temperature_k = temperature_k;
        // Padding lanes take the fill too, so vector kernels read defined
        // data.
        self.voltage.iter_mut().for_each(|v| *v = initial_voltage);
        self.current_density.iter_mut().for_each(|x| *x = 0.0);
        self.time.iter_mut().for_each(|t| *t = 0.0);
        self.time_to.iter_mut().for_each(|t| *t = 0.0);
        self.dt_cell.iter_mut().for_each(|t| *t = 0.0);
        self.dt_cv.iter_mut().for_each(|t| *t = 0.0);
        for ion in self.ion_data.values_mut() {
            ion.reset(temperature_k);
        }
    }
}

fn bounds(values: &[f64]) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &v in values {
        min = min.min(v);
        max = max.max(v);
    }
    (min, max)
}

/// An upward threshold crossing of one detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossing {
    /// Detector index, in registration order across the group.
    pub index: u32,
    /// Interpolated crossing time [ms].
    pub time: f64,
}

/// Watches per-CV voltages for upward threshold crossings between
/// consecutive sub-steps. A detector disarms when it fires and re-arms on
/// the first sample back below threshold.
#[derive(Debug, Clone, Default)]
pub struct ThresholdWatcher {
    cv_index: Vec<u32>,
    threshold: Vec<f64>,
    v_prev: Vec<f64>,
    is_crossed: Vec<bool>,
    crossings: Vec<Crossing>,
}

impl ThresholdWatcher {
    pub fn new(cv_index: Vec<u32>, threshold: Vec<f64>, voltage: &[f64]) -> Self {
        assert_eq!(cv_index.len(), threshold.len(), "detector arity mismatch");
        let mut watcher = Self {
            v_prev: vec![0.0; cv_index.len()],
            is_crossed: vec![false; cv_index.len()],
            crossings: Vec::new(),
            cv_index,
            threshold,
        };
        watcher.reset(voltage);
        watcher
    }

    pub fn n_detectors(&self) -> usize {
        self.cv_index.len()
    }

    /// Re-arm against the given voltage; pending crossings are discarded.
    pub fn reset(&mut self, voltage: &[f64]) {
        for i in 0..self.cv_index.len() {
            let v = voltage[self.cv_index[i] as usize];
            self.v_prev[i] = v;
            self.is_crossed[i] = v >= self.threshold[i];
        }
        self.crossings.clear();
    }

    /// Compare against the previous sample, recording crossings with
    /// linearly interpolated times.
    pub fn test(
        &mut self,
        voltage: &[f64],
        cv_to_cell: &[u32],
        time_before: &[f64],
        time_after: &[f64],
    ) {
        for i in 0..self.cv_index.len() {
            let cv = self.cv_index[i] as usize;
            let v = voltage[cv];
            let thresh = self.threshold[i];
            if self.is_crossed[i] {
                if v < thresh {
                    self.is_crossed[i] = false;
                }
            } else if v >= thresh {
                let cell = cv_to_cell[cv] as usize;
                let t0 = time_before[cell];
                let t1 = time_after[cell];
                let v0 = self.v_prev[i];
                let time = t0 + (t1 - t0) * (thresh - v0) / (v - v0);
                self.crossings.push(Crossing {
                    index: i as u32,
                    time,
                });
                self.is_crossed[i] = true;
            }
            self.v_prev[i] = v;
        }
    }

    pub fn crossings(&self) -> &[Crossing] {
        &self.crossings
    }

    pub fn drain_crossings(&mut self) -> Vec<Crossing> {
        std::mem::take(&mut self.crossings)
    }
}
