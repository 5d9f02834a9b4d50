//! The lowered cell: all cells of one group flattened onto shared per-CV
//! arrays, with the mechanisms, matrix, event streams and threshold
//! watcher that advance them.

use std::collections::BTreeMap;

use cable_core::{
    DeliverableEvent, Epoch, ProbeHandle, ProbeKind, SampleEvent, SimConfig, TargetHandle,
    PARENT_NONE,
};
use cable_events::{DeliverableEventStream, SampleEventStream};
use cable_mechanisms::{Catalogue, Mechanism, MechanismKind};
use cable_morphology::{discretise, CableCell, CvPolicy, IClamp, Location, Segment};
use cable_solver::HinesMatrix;
use cable_state::{Crossing, IonInfo, SharedState, ThresholdWatcher};

use crate::EngineError;

/// One gap-junction coupling as seen from the local side. A junction
/// between two cells appears once per side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GjSpec {
    pub local_cell: u32,
    pub local_loc: Location,
    pub peer_cell: u32,
    pub peer_loc: Location,
    /// Coupling conductance [µS].
    pub conductance: f64,
}

#[derive(Debug, Clone, Copy)]
struct GjCoupling {
    local_cv: u32,
    peer_cv: u32,
    conductance: f64,
}

/// Binding results handed back to the cell group.
pub struct LoweredInit {
    /// Target handles flattened in (cell, synapse) declaration order.
    pub target_handles: Vec<TargetHandle>,
    /// Per-cell divisions into `target_handles`, length `n_cell + 1`.
    pub target_divisions: Vec<usize>,
    /// Per-cell probe handles in declaration order.
    pub probe_handles: Vec<Vec<ProbeHandle>>,
    pub n_detectors: usize,
}

pub struct IntegrateResult {
    pub crossings: Vec<Crossing>,
    pub sample_time: Vec<f64>,
    pub sample_value: Vec<f64>,
}

/// Default ionic species table: charge and default concentrations [mM].
fn default_ion_table() -> BTreeMap<String, IonInfo> {
    let mut table = BTreeMap::new();
    table.insert(
        "na".to_string(),
        IonInfo {
            charge: 1,
            default_int_concentration: 10.0,
            default_ext_concentration: 140.0,
        },
    );
    table.insert(
        "k".to_string(),
        IonInfo {
            charge: 1,
            default_int_concentration: 54.4,
            default_ext_concentration: 2.5,
        },
    );
    table.insert(
        "ca".to_string(),
        IonInfo {
            charge: 2,
            default_int_concentration: 5e-5,
            default_ext_concentration: 2.0,
        },
    );
    table
}

pub struct FvmLoweredCell {
    config: SimConfig,
    n_cell: usize,
    n_cv: usize,
    state: SharedState,
    matrix: HinesMatrix,
    mechanisms: Vec<Box<dyn Mechanism>>,
    /// Index of the first point mechanism in `mechanisms`.
    synapse_base: usize,
    cv_area: Vec<f64>,
    cv_capacitance: Vec<f64>,
    face_alpha: Vec<f64>,
    stimuli: Vec<(u32, IClamp)>,
    gap_junctions: Vec<GjCoupling>,
    /// Cells sharing an integration domain step together; singleton
    /// domains are omitted.
    joint_domains: Vec<Vec<u32>>,
    watcher: ThresholdWatcher,
    events: DeliverableEventStream,
    samples: SampleEventStream,
    v_before: Vec<f64>,
    i_before: Vec<f64>,
    delivered_times: Vec<f64>,
    /// Per-sub-step (min, max) voltage, kept when the config asks for it.
    voltage_bounds_log: Vec<(f64, f64)>,
}

impl FvmLoweredCell {
    pub fn initialize(
        cells: &[CableCell],
        joint_domains: Vec<Vec<u32>>,
        gap_junctions: &[GjSpec],
        policy: &CvPolicy,
        config: SimConfig,
        catalogue: &Catalogue,
    ) -> Result<(Self, LoweredInit), EngineError> {
        config.validate()?;
        let n_cell = cells.len();

        // Lower every cell and concatenate onto group-wide arrays.
        let mut discs = Vec::with_capacity(n_cell);
        let mut cell_cv_offset = Vec::with_capacity(n_cell + 1);
        let mut n_cv = 0usize;
        for cell in cells {
            let disc = discretise(cell, policy)?;
            cell_cv_offset.push(n_cv);
            n_cv += disc.n_cv;
            discs.push(disc);
        }
        cell_cv_offset.push(n_cv);

        let mut parent_index = vec![PARENT_NONE; n_cv];
        let mut cv_area = vec![0.0; n_cv];
        let mut cv_capacitance = vec![0.0; n_cv];
        let mut face_alpha = vec![0.0; n_cv];
        let mut cv_to_cell = vec![0u32; n_cv];
        for (cell_i, disc) in discs.iter().enumerate() {
            let offset = cell_cv_offset[cell_i];
            for cv in 0..disc.n_cv {
                let p = disc.parent_index[cv];
                parent_index[offset + cv] = if p == PARENT_NONE {
                    PARENT_NONE
                } else {
                    p + offset as u32
                };
                cv_area[offset + cv] = disc.cv_area[cv];
                cv_capacitance[offset + cv] = disc.cv_capacitance[cv];
                face_alpha[offset + cv] = disc.face_alpha[cv];
                cv_to_cell[offset + cv] = cell_i as u32;
            }
        }

        let mut state = SharedState::new(n_cell, cv_to_cell);

        // Density mechanism map: name → (CVs, merged parameter overrides).
        type Overrides = Vec<(String, f64)>;
        let mut density_map: BTreeMap<String, (Vec<u32>, Overrides)> = BTreeMap::new();
        for (cell_i, cell) in cells.iter().enumerate() {
            let offset = cell_cv_offset[cell_i] as u32;
            for (seg_i, segment) in cell.segments.iter().enumerate() {
                let mechs = match segment {
                    Segment::Soma(soma) => &soma.mechanisms,
                    Segment::Cable(cable) => &cable.mechanisms,
                };
                let seg_cvs: Vec<u32> = discs[cell_i]
                    .segment_cv_range(seg_i)
                    .into_iter()
                    .map(|cv| offset + cv)
                    .collect();
                for mech in mechs {
                    if !catalogue.has(&mech.name) {
                        return Err(EngineError::Mechanism(
                            cable_mechanisms::MechanismError::NoSuchMechanism(mech.name.clone()),
                        ));
                    }
                    let entry = density_map.entry(mech.name.clone()).or_default();
                    entry.0.extend(seg_cvs.iter().copied());
                    entry.1.extend(mech.params.iter().cloned());
                }
            }
        }

        // Point mechanism map: name → ((cv, global target index), overrides).
        let mut point_map: BTreeMap<String, (Vec<(u32, usize)>, Overrides)> = BTreeMap::new();
        let mut target_divisions = vec![0usize; n_cell + 1];
        let mut n_targets = 0usize;
        for (cell_i, cell) in cells.iter().enumerate() {
            target_divisions[cell_i] = n_targets;
            let offset = cell_cv_offset[cell_i] as u32;
            for syn in &cell.synapses {
                if !catalogue.has(&syn.mech.name) {
                    return Err(EngineError::Mechanism(
                        cable_mechanisms::MechanismError::NoSuchMechanism(syn.mech.name.clone()),
                    ));
                }
                let cv = offset + discs[cell_i].location_cv(syn.location)?;
                let entry = point_map.entry(syn.mech.name.clone()).or_default();
                entry.0.push((cv, n_targets));
                entry.1.extend(syn.mech.params.iter().cloned());
                n_targets += 1;
            }
        }
        target_divisions[n_cell] = n_targets;

        // Instantiate density mechanisms, then point mechanisms, each in
        // catalogue name order.
        let mut mechanisms: Vec<Box<dyn Mechanism>> = Vec::new();
        for (name, (mut cvs, overrides)) in density_map {
            let info = catalogue.info(&name)?;
            if info.kind != MechanismKind::Density {
                return Err(EngineError::Mechanism(
                    cable_mechanisms::MechanismError::InvalidOperation(name.clone()),
                ));
            }
            cvs.sort_unstable();
            cvs.dedup();
            let weights = vec![1.0; cvs.len()];
            let mut mech = catalogue.make(&name)?;
            mech.bind(cvs, weights);
            for (param, value) in &overrides {
                mech.set_param(param, *value)?;
            }
            mechanisms.push(mech);
        }

        let synapse_base = mechanisms.len();
        let mut target_handles = vec![
            TargetHandle {
                mech_id: 0,
                index: 0
            };
            n_targets
        ];
        for (name, (mut placed, overrides)) in point_map {
            let info = catalogue.info(&name)?;
            if info.kind != MechanismKind::Point {
                return Err(EngineError::Mechanism(
                    cable_mechanisms::MechanismError::InvalidOperation(name.clone()),
                ));
            }
            let mech_id = mechanisms.len() as u32;
            // Sort by CV, keeping declaration order for equal CVs so the
            // target handles stay stable.
            placed.sort_by_key(|&(cv, target)| (cv, target));
            let cvs: Vec<u32> = placed.iter().map(|&(cv, _)| cv).collect();
            let weights: Vec<f64> = cvs.iter().map(|&cv| 100.0 / cv_area[cv as usize]).collect();
            for (instance, &(_, target)) in placed.iter().enumerate() {
                target_handles[target] = TargetHandle {
                    mech_id,
                    index: instance as u32,
                };
            }
            let mut mech = catalogue.make(&name)?;
            mech.bind(cvs, weights);
            for (param, value) in &overrides {
                mech.set_param(param, *value)?;
            }
            mechanisms.push(mech);
        }

        // Ion state over the union of CVs of the mechanisms touching each
        // ion.
        let ion_table = default_ion_table();
        let mut ion_cvs: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for mech in &mechanisms {
            for dep in &mech.info().ions {
                ion_cvs
                    .entry(dep.name.clone())
                    .or_default()
                    .extend(mech.cv_index().iter().copied());
            }
        }
        for (name, mut cvs) in ion_cvs {
            cvs.sort_unstable();
            cvs.dedup();
            let info = ion_table
                .get(&name)
                .copied()
                .ok_or_else(|| EngineError::UnknownIon(name.clone()))?;
            let n = cvs.len();
            state.add_ion(&name, info, cvs, vec![1.0; n], vec![1.0; n]);
        }
        for mech in &mut mechanisms {
            let deps = mech.info().ions.clone();
            for (dep_i, dep) in deps.iter().enumerate() {
                let ion = &state.ion_data[&dep.name];
                let index: Vec<u32> = mech
                    .cv_index()
                    .iter()
                    .map(|cv| {
                        ion.node_index
                            .binary_search(cv)
                            .expect("mechanism CV present in ion index") as u32
                    })
                    .collect();
                mech.set_ion_index(dep_i, index);
            }
        }

        // Stimuli, detectors, probes, gap junctions.
        let mut stimuli = Vec::new();
        let mut detector_cvs = Vec::new();
        let mut detector_thresholds = Vec::new();
        let mut probe_handles = vec![Vec::new(); n_cell];
        for (cell_i, cell) in cells.iter().enumerate() {
            let offset = cell_cv_offset[cell_i] as u32;
            for stim in &cell.stimuli {
                let cv = offset + discs[cell_i].location_cv(stim.location)?;
                stimuli.push((cv, stim.clamp));
            }
            for det in &cell.detectors {
                let cv = offset + discs[cell_i].location_cv(det.location)?;
                detector_cvs.push(cv);
                detector_thresholds.push(det.threshold);
            }
            for probe in &cell.probes {
                let cv = offset + discs[cell_i].location_cv(probe.location)?;
                probe_handles[cell_i].push(ProbeHandle {
                    kind: probe.kind,
                    cv,
                });
            }
        }

        let mut gj_couplings = Vec::with_capacity(gap_junctions.len());
        for gj in gap_junctions {
            let local_cv = cell_cv_offset[gj.local_cell as usize] as u32
                + discs[gj.local_cell as usize].location_cv(gj.local_loc)?;
            let peer_cv = cell_cv_offset[gj.peer_cell as usize] as u32
                + discs[gj.peer_cell as usize].location_cv(gj.peer_loc)?;
            gj_couplings.push(GjCoupling {
                local_cv,
                peer_cv,
                conductance: gj.conductance,
            });
        }

        let matrix = HinesMatrix::new(parent_index)?;

        state.reset(config.v_init, config.temperature_k);
        for mech in &mut mechanisms {
            mech.init(&mut state);
        }
        let watcher = ThresholdWatcher::new(detector_cvs, detector_thresholds, &state.voltage);
        let n_detectors = watcher.n_detectors();

        let lowered = Self {
            config,
            n_cell,
            n_cv,
            matrix,
            synapse_base,
            cv_area,
            cv_capacitance,
            face_alpha,
            stimuli,
            gap_junctions: gj_couplings,
            joint_domains,
            watcher,
            events: DeliverableEventStream::new(n_cell),
            samples: SampleEventStream::new(n_cell),
            v_before: state.voltage.clone(),
            i_before: state.current_density.clone(),
            delivered_times: Vec::new(),
            voltage_bounds_log: Vec::new(),
            state,
            mechanisms,
        };
        let init = LoweredInit {
            target_handles,
            target_divisions,
            probe_handles,
            n_detectors,
        };
        Ok((lowered, init))
    }

    pub fn n_cell(&self) -> usize {
        self.n_cell
    }

    pub fn n_cv(&self) -> usize {
        self.n_cv
    }

    pub fn time(&self, cell: usize) -> f64 {
        self.state.time[cell]
    }

    /// Earliest cell time in the group [ms].
    pub fn min_time(&self) -> f64 {
        self.state.time_bounds().0
    }

    pub fn voltage(&self) -> &[f64] {
        &self.state.voltage[..self.n_cv]
    }

    pub fn probe_value(&self, handle: ProbeHandle) -> f64 {
        match handle.kind {
            ProbeKind::Voltage => self.state.voltage[handle.cv as usize],
            ProbeKind::Current => self.state.current_density[handle.cv as usize],
        }
    }

    /// Times of the events delivered by the most recent `integrate`.
    pub fn delivered_event_times(&self) -> &[f64] {
        &self.delivered_times
    }

    /// Per-sub-step voltage bounds of the most recent `integrate`; empty
    /// unless `record_voltage_bounds` is set.
    pub fn voltage_bounds_log(&self) -> &[(f64, f64)] {
        &self.voltage_bounds_log
    }

    pub fn n_mechanisms(&self) -> usize {
        self.mechanisms.len()
    }

    pub fn synapse_base(&self) -> usize {
        self.synapse_base
    }

    pub fn reset(&mut self) {
        self.state
            .reset(self.config.v_init, self.config.temperature_k);
        for mech in &mut self.mechanisms {
            mech.reset(&mut self.state);
        }
        self.watcher.reset(&self.state.voltage);
        self.events.clear();
        self.samples.clear();
        self.delivered_times.clear();
        self.voltage_bounds_log.clear();
        self.v_before.copy_from_slice(&self.state.voltage);
        self.i_before.copy_from_slice(&self.state.current_density);
    }

    /// Digest of the engine's static configuration.
    pub fn config_digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"CABLE:ENGINE:CFG");
        hasher.update(&self.config.dt_max.to_le_bytes());
        hasher.update(&self.config.v_init.to_le_bytes());
        hasher.update(&self.config.temperature_k.to_le_bytes());
        hasher.update(&(self.n_cell as u32).to_le_bytes());
        hasher.update(&(self.n_cv as u32).to_le_bytes());
        for &p in self.matrix.parent_index() {
            hasher.update(&p.to_le_bytes());
        }
        for mech in &self.mechanisms {
            hasher.update(mech.info().name.as_bytes());
            hasher.update(&mech.info().fingerprint());
            for &cv in mech.cv_index() {
                hasher.update(&cv.to_le_bytes());
            }
        }
        *hasher.finalize().as_bytes()
    }

    /// Digest of the full dynamic state: the bitwise witness used by the
    /// reset-idempotence and reordering tests.
    pub fn state_digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"CABLE:ENGINE:STATE");
        for &v in &self.state.voltage[..self.n_cv] {
            hasher.update(&v.to_le_bytes());
        }
        for &t in &self.state.time {
            hasher.update(&t.to_le_bytes());
        }
        for (name, ion) in &self.state.ion_data {
            hasher.update(name.as_bytes());
            for i in 0..ion.len() {
                hasher.update(&ion.ix[i].to_le_bytes());
                hasher.update(&ion.ex[i].to_le_bytes());
                hasher.update(&ion.xi[i].to_le_bytes());
                hasher.update(&ion.xo[i].to_le_bytes());
            }
        }
        for mech in &self.mechanisms {
            hasher.update(mech.info().name.as_bytes());
            mech.hash_state(&mut hasher);
        }
        *hasher.finalize().as_bytes()
    }

    /// Synchronise sub-step boundaries across jointly integrated cells.
    fn sync_joint_domains(time_to: &mut [f64], joint_domains: &[Vec<u32>]) {
        for members in joint_domains {
            let mut t = f64::INFINITY;
            for &cell in members {
                t = t.min(time_to[cell as usize]);
            }
            for &cell in members {
                time_to[cell as usize] = t;
            }
        }
    }

    /// Run the sub-step loop from the cells' current times to
    /// `epoch.tfinal`.
    ///
    /// `staged_events` must be sorted by (cell, time, mechanism, index);
    /// `sample_events` by (cell, time). `n_samples` sizes the output
    /// buffers addressed by the sample events' offsets.
    pub fn integrate(
        &mut self,
        epoch: Epoch,
        staged_events: &[DeliverableEvent],
        sample_events: &[SampleEvent],
        n_samples: usize,
    ) -> Result<IntegrateResult, EngineError> {
        for ev in staged_events {
            let cell_time = self.state.time[ev.cell as usize];
            if ev.time < cell_time {
                return Err(EngineError::BadEventTime {
                    event_time: ev.time,
                    cell_time,
                });
            }
        }
        self.events.init(staged_events)?;
        self.samples.init(sample_events)?;
        self.delivered_times.clear();
        self.voltage_bounds_log.clear();

        let mut sample_time = vec![0.0; n_samples];
        let mut sample_value = vec![0.0; n_samples];

        while self.state.time_bounds().0 < epoch.tfinal {
            let _step = cable_profile::region("advance:substep");

            // Choose the sub-step end: dt_max-bounded, shortened to the
            // next pending event, synchronised within joint domains.
            self.state.update_time_to(self.config.dt_max, epoch.tfinal);
            self.events.event_time_if_before(&mut self.state.time_to);
            Self::sync_joint_domains(&mut self.state.time_to, &self.joint_domains);
            self.state.set_dt();

            self.v_before[..self.n_cv].copy_from_slice(&self.state.voltage[..self.n_cv]);
            self.i_before[..self.n_cv]
                .copy_from_slice(&self.state.current_density[..self.n_cv]);

            self.state.zero_currents();

            // Deliver events due in this sub-step, in ascending
            // (time, mechanism, target) order per cell.
            self.events.mark_until_after(&self.state.time_to);
            for cell in 0..self.n_cell {
                for marked in self.events.marked_range(cell) {
                    let (handle, weight) = marked.data;
                    self.delivered_times.push(marked.time);
                    self.mechanisms[handle.mech_id as usize]
                        .net_receive(handle.index as usize, weight)?;
                }
            }

            {
                let _currents = cable_profile::region("advance:current");
                for mech in &mut self.mechanisms {
                    mech.compute_currents(&mut self.state);
                }
            }

            // Stimuli inject nA; current density is mA/cm².
            for &(cv, clamp) in &self.stimuli {
                let cell = self.state.cv_to_cell[cv as usize] as usize;
                let amplitude = clamp.amplitude_at(self.state.time[cell]);
                if amplitude != 0.0 {
                    self.state.current_density[cv as usize] -=
                        100.0 * amplitude / self.cv_area[cv as usize];
                }
            }

            // Gap junctions couple CV pairs electrically.
            for gj in &self.gap_junctions {
                let v_local = self.state.voltage[gj.local_cv as usize];
                let v_peer = self.state.voltage[gj.peer_cv as usize];
                let i_gj = gj.conductance * (v_local - v_peer);
                self.state.current_density[gj.local_cv as usize] +=
                    100.0 * i_gj / self.cv_area[gj.local_cv as usize];
            }

            {
                let _solve = cable_profile::region("advance:solve");
                self.matrix.assemble(
                    &self.state.dt_cv,
                    &self.state.voltage,
                    &self.state.current_density,
                    &self.cv_area,
                    &self.face_alpha,
                    &self.cv_capacitance,
                );
                self.matrix.solve();
            }
            self.state.voltage[..self.n_cv].copy_from_slice(self.matrix.rhs());

            let (v_min, v_max) = self.state.voltage_bounds();
            if self.config.record_voltage_bounds {
                self.voltage_bounds_log.push((v_min, v_max));
            }
            if !v_min.is_finite() || !v_max.is_finite() || v_min < -1000.0 || v_max > 1000.0 {
                return Err(EngineError::NumericalInstability {
                    min: v_min,
                    max: v_max,
                    time: self.state.time_bounds().0,
                });
            }

            {
                let _state = cable_profile::region("advance:state");
                for mech in &mut self.mechanisms {
                    mech.advance_state(&mut self.state);
                }
            }

            self.watcher.test(
                &self.state.voltage,
                &self.state.cv_to_cell,
                &self.state.time,
                &self.state.time_to,
            );

            // Samples scheduled inside this sub-step, linearly
            // interpolated between the sub-step endpoints.
            self.samples.mark_until_after(&self.state.time_to);
            for cell in 0..self.n_cell {
                let t0 = self.state.time[cell];
                let t1 = self.state.time_to[cell];
                for marked in self.samples.marked_range(cell) {
                    let (probe, offset) = marked.data;
                    let cv = probe.cv as usize;
                    let (prev, now) = match probe.kind {
                        ProbeKind::Voltage => (self.v_before[cv], self.state.voltage[cv]),
                        ProbeKind::Current => {
                            (self.i_before[cv], self.state.current_density[cv])
                        }
                    };
                    let value = if t1 > t0 {
                        prev + (now - prev) * (marked.time - t0) / (t1 - t0)
                    } else {
                        now
                    };
                    sample_time[offset as usize] = marked.time;
                    sample_value[offset as usize] = value;
                }
            }
            self.samples.drop_marked_events();

            for cell in 0..self.n_cell {
                self.state.time[cell] = self.state.time_to[cell];
            }
            self.events.drop_marked_events();
        }

        Ok(IntegrateResult {
            crossings: self.watcher.drain_crossings(),
            sample_time,
            sample_value,
        })
    }
}

