#![forbid(unsafe_code)]

//! Cell groups and the integrator driving the finite-volume lowered cell.
//!
//! A [`CableCellGroup`] owns the lowered state of a set of cells, stages
//! external events into per-cell streams, runs the sub-step loop and hands
//! back spikes and probe samples. Independent groups advance as parallel
//! tasks under [`Simulation`].

use std::collections::BTreeMap;

use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;

use cable_core::{
    CellEvent, CellGid, CellMember, DeliverableEvent, Epoch, EventBinner, ProbeHandle,
    SampleEvent, SampleRecord, SimConfig, Spike, TargetHandle,
};
use cable_mechanisms::Catalogue;
use cable_morphology::{CableCell, CvPolicy, Location};

mod lowered;
mod sampler;

pub use cable_core::ConfigError;
pub use cable_events::EventStreamError;
pub use cable_mechanisms::MechanismError;
pub use cable_morphology::MorphologyError;
pub use cable_solver::MatrixError;
pub use lowered::{FvmLoweredCell, GjSpec, IntegrateResult, LoweredInit};
pub use sampler::{SamplerAssociation, SamplerFn, SamplerHandle, SamplerMap, Schedule};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Morphology(#[from] MorphologyError),
    #[error(transparent)]
    Mechanism(#[from] MechanismError),
    #[error(transparent)]
    Events(#[from] EventStreamError),
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    #[error("unknown ion {0}")]
    UnknownIon(String),
    #[error("bad event time: event at {event_time} ms precedes cell time {cell_time} ms")]
    BadEventTime { event_time: f64, cell_time: f64 },
    #[error("numerical instability: voltage bounds ({min}, {max}) mV at t = {time} ms")]
    NumericalInstability { min: f64, max: f64, time: f64 },
    #[error("gap junction between cell {local:?} and cell {peer:?} spans cell groups")]
    GapJunctionConfig { local: CellGid, peer: CellGid },
    #[error("bad probe id {0:?}")]
    BadProbeId(CellMember),
    #[error(
        "bad connection label on cell {gid:?}: recipe declares {declared} targets, description has {found}"
    )]
    BadConnectionLabel {
        gid: CellGid,
        declared: usize,
        found: usize,
    },
    #[error(
        "bad univalent connection label on cell {gid:?}: recipe declares {declared} sources, description has {found}"
    )]
    BadUnivalentConnectionLabel {
        gid: CellGid,
        declared: usize,
        found: usize,
    },
    #[error("bad event target index {index} on cell {gid:?}")]
    BadTarget { gid: CellGid, index: u32 },
    #[error("cell {0:?} not in this simulation")]
    UnknownCell(CellGid),
}

/// One gap junction incident on a cell, as reported by the recipe. A
/// junction between cells a and b must be reported by both sides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GapJunctionConn {
    pub local: Location,
    pub peer: CellGid,
    pub peer_location: Location,
    /// Coupling conductance [µS].
    pub conductance: f64,
}

/// Model description consumed at engine construction.
pub trait Recipe: Sync {
    /// Total cell count; used by [`Simulation::single_group`] to build
    /// the default partition. Cell groups themselves never read it.
    fn num_cells(&self) -> usize;
    fn cell_description(&self, gid: CellGid) -> CableCell;
    fn num_sources(&self, gid: CellGid) -> usize;
    fn num_targets(&self, gid: CellGid) -> usize;
    fn num_probes(&self, gid: CellGid) -> usize;
    fn gap_junctions_on(&self, gid: CellGid) -> Vec<GapJunctionConn> {
        let _ = gid;
        Vec::new()
    }
}

struct SamplerCallInfo {
    handle: SamplerHandle,
    probe_id: CellMember,
    begin: usize,
    end: usize,
}

/// A group of cable cells advanced by one integration task.
pub struct CableCellGroup {
    gids: Vec<CellGid>,
    gid_index: BTreeMap<CellGid, u32>,
    lowered: FvmLoweredCell,
    binners: Vec<EventBinner>,
    target_handles: Vec<TargetHandle>,
    target_divisions: Vec<usize>,
    probe_map: BTreeMap<CellMember, ProbeHandle>,
    spike_sources: Vec<CellMember>,
    samplers: SamplerMap,
}

impl CableCellGroup {
    pub fn new<R: Recipe + ?Sized>(
        gids: Vec<CellGid>,
        recipe: &R,
        policy: &CvPolicy,
        config: SimConfig,
        catalogue: &Catalogue,
    ) -> Result<Self, EngineError> {
        let n_cell = gids.len();
        let mut gid_index = BTreeMap::new();
        for (lid, &gid) in gids.iter().enumerate() {
            gid_index.insert(gid, lid as u32);
        }

        // Resolve gap junctions and detect supercells. Cells joined by a
        // junction must live in this group and step jointly.
        let mut gj_specs = Vec::new();
        let mut adjacency: Vec<Vec<u32>> = vec![Vec::new(); n_cell];
        for (lid, &gid) in gids.iter().enumerate() {
            for conn in recipe.gap_junctions_on(gid) {
                let peer_lid = *gid_index.get(&conn.peer).ok_or(
                    EngineError::GapJunctionConfig {
                        local: gid,
                        peer: conn.peer,
                    },
                )?;
                adjacency[lid].push(peer_lid);
                gj_specs.push(GjSpec {
                    local_cell: lid as u32,
                    local_loc: conn.local,
                    peer_cell: peer_lid,
                    peer_loc: conn.peer_location,
                    conductance: conn.conductance,
                });
            }
        }
        let joint_domains = supercells(&adjacency);

        let cells: Vec<CableCell> = gids
            .iter()
            .map(|&gid| recipe.cell_description(gid))
            .collect();
        // The recipe's declared counts bind event, source and probe
        // indices; a description that disagrees would leave dangling
        // labels, so it is rejected here rather than at delivery time.
        for (lid, cell) in cells.iter().enumerate() {
            let gid = gids[lid];
            let declared = recipe.num_targets(gid);
            if cell.synapses.len() != declared {
                return Err(EngineError::BadConnectionLabel {
                    gid,
                    declared,
                    found: cell.synapses.len(),
                });
            }
            let declared = recipe.num_sources(gid);
            if cell.detectors.len() != declared {
                return Err(EngineError::BadUnivalentConnectionLabel {
                    gid,
                    declared,
                    found: cell.detectors.len(),
                });
            }
            let declared = recipe.num_probes(gid);
            if cell.probes.len() != declared {
                // The first probe id that fails to resolve.
                return Err(EngineError::BadProbeId(CellMember {
                    gid,
                    index: declared.min(cell.probes.len()) as u32,
                }));
            }
        }

        let (lowered, init) = FvmLoweredCell::initialize(
            &cells,
            joint_domains,
            &gj_specs,
            policy,
            config,
            catalogue,
        )?;

        let mut probe_map = BTreeMap::new();
        for (lid, handles) in init.probe_handles.iter().enumerate() {
            for (index, &handle) in handles.iter().enumerate() {
                probe_map.insert(
                    CellMember {
                        gid: gids[lid],
                        index: index as u32,
                    },
                    handle,
                );
            }
        }

        let mut spike_sources = Vec::new();
        for (lid, cell) in cells.iter().enumerate() {
            for index in 0..cell.detectors.len() {
                spike_sources.push(CellMember {
                    gid: gids[lid],
                    index: index as u32,
                });
            }
        }

        let binners = vec![EventBinner::new(config.binning); n_cell];

        Ok(Self {
            gids,
            gid_index,
            lowered,
            binners,
            target_handles: init.target_handles,
            target_divisions: init.target_divisions,
            probe_map,
            spike_sources,
            samplers: SamplerMap::new(),
        })
    }

    pub fn n_cell(&self) -> usize {
        self.gids.len()
    }

    pub fn gids(&self) -> &[CellGid] {
        &self.gids
    }

    pub fn lowered(&self) -> &FvmLoweredCell {
        &self.lowered
    }

    /// Resolve a probe id registered by the recipe.
    pub fn probe(&self, probe_id: CellMember) -> Result<ProbeHandle, EngineError> {
        self.probe_map
            .get(&probe_id)
            .copied()
            .ok_or(EngineError::BadProbeId(probe_id))
    }

    /// Current value at a probe.
    pub fn probe_value(&self, probe_id: CellMember) -> Result<f64, EngineError> {
        Ok(self.lowered.probe_value(self.probe(probe_id)?))
    }

    /// Register a sampler over the probes selected by `predicate`.
    /// Returns `None` when no probe matches.
    pub fn add_sampler(
        &mut self,
        predicate: impl Fn(CellMember) -> bool,
        schedule: Schedule,
        sampler: SamplerFn,
    ) -> Option<SamplerHandle> {
        let probe_ids: Vec<CellMember> = self
            .probe_map
            .keys()
            .copied()
            .filter(|pid| predicate(*pid))
            .collect();
        if probe_ids.is_empty() {
            return None;
        }
        Some(self.samplers.add(SamplerAssociation {
            schedule,
            sampler,
            probe_ids,
        }))
    }

    pub fn remove_sampler(&mut self, handle: SamplerHandle) {
        self.samplers.remove(handle);
    }

    pub fn remove_all_samplers(&mut self) {
        self.samplers.clear();
    }

    pub fn reset(&mut self) {
        self.lowered.reset();
        for binner in &mut self.binners {
            binner.reset();
        }
    }

    pub fn config_digest(&self) -> [u8; 32] {
        self.lowered.config_digest()
    }

    pub fn state_digest(&self) -> [u8; 32] {
        self.lowered.state_digest()
    }

    /// Advance every cell to `epoch.tfinal`, delivering the given event
    /// lanes (indexed by group-local cell; an empty slice means no
    /// events). Returns the spikes of this macro-step sorted by
    /// (time, source); samples go to the registered sampler callbacks.
    pub fn advance(
        &mut self,
        epoch: Epoch,
        event_lanes: &[Vec<CellEvent>],
    ) -> Result<Vec<Spike>, EngineError> {
        let _adv = cable_profile::region("advance");
        let n_cell = self.n_cell();

        // Stage events: validate, bin, resolve target handles.
        let mut staged = Vec::new();
        if !event_lanes.is_empty() {
            assert_eq!(event_lanes.len(), n_cell, "one event lane per cell");
            for (lid, lane) in event_lanes.iter().enumerate() {
                let cell_time = self.lowered.time(lid);
                let n_targets =
                    self.target_divisions[lid + 1] - self.target_divisions[lid];
                for ev in lane {
                    if ev.time >= epoch.tfinal {
                        continue;
                    }
                    if ev.time < cell_time {
                        return Err(EngineError::BadEventTime {
                            event_time: ev.time,
                            cell_time,
                        });
                    }
                    if ev.target as usize >= n_targets {
                        return Err(EngineError::BadTarget {
                            gid: self.gids[lid],
                            index: ev.target,
                        });
                    }
                    let handle =
                        self.target_handles[self.target_divisions[lid] + ev.target as usize];
                    let time = self.binners[lid].bin(ev.time, cell_time);
                    staged.push(DeliverableEvent {
                        cell: lid as u32,
                        handle,
                        time,
                        weight: ev.weight,
                    });
                }
            }
        }
        staged.sort_by(|a, b| {
            a.cell
                .cmp(&b.cell)
                .then(a.time.total_cmp(&b.time))
                .then(a.handle.mech_id.cmp(&b.handle.mech_id))
                .then(a.handle.index.cmp(&b.handle.index))
        });

        // Expand sampler schedules into per-probe sample events with
        // contiguous buffer offsets per callback invocation.
        let t_start = self.lowered.min_time();
        let mut call_info = Vec::new();
        let mut sample_events = Vec::new();
        let mut n_samples = 0usize;
        for (&handle, assoc) in self.samplers.iter_mut() {
            let times = assoc.schedule.events(t_start, epoch.tfinal);
            if times.is_empty() {
                continue;
            }
            for &probe_id in &assoc.probe_ids {
                let probe = self.probe_map[&probe_id];
                let cell = self.gid_index[&probe_id.gid];
                call_info.push(SamplerCallInfo {
                    handle,
                    probe_id,
                    begin: n_samples,
                    end: n_samples + times.len(),
                });
                for &time in &times {
                    sample_events.push(SampleEvent {
                        cell,
                        time,
                        probe,
                        offset: n_samples as u32,
                    });
                    n_samples += 1;
                }
            }
        }
        sample_events.sort_by(|a, b| a.cell.cmp(&b.cell).then(a.time.total_cmp(&b.time)));

        debug!(
            n_events = staged.len(),
            n_samples,
            tfinal = epoch.tfinal,
            "cell group advancing"
        );

        let result = self
            .lowered
            .integrate(epoch, &staged, &sample_events, n_samples)?;

        // Deliver samples, one contiguous span per (sampler, probe).
        let mut records = Vec::new();
        for ci in &call_info {
            records.clear();
            records.extend((ci.begin..ci.end).map(|i| SampleRecord {
                time: result.sample_time[i],
                value: result.sample_value[i],
            }));
            if let Some(assoc) = self.samplers.get_mut(ci.handle) {
                (assoc.sampler)(ci.probe_id, &records);
            }
        }

        // Crossings carry group-local detector indices; publish them under
        // their global source ids.
        let mut spikes: Vec<Spike> = result
            .crossings
            .iter()
            .map(|c| Spike {
                source: self.spike_sources[c.index as usize],
                time: c.time,
            })
            .collect();
        spikes.sort_by(|a, b| a.time.total_cmp(&b.time).then(a.source.cmp(&b.source)));
        Ok(spikes)
    }
}

/// Connected components of the gap-junction adjacency with two or more
/// members. BFS over an undirected graph that may contain cycles.
fn supercells(adjacency: &[Vec<u32>]) -> Vec<Vec<u32>> {
    let n = adjacency.len();
    let mut visited = vec![false; n];
    let mut components = Vec::new();
    for start in 0..n {
        if visited[start] || adjacency[start].is_empty() {
            continue;
        }
        let mut component = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        visited[start] = true;
        queue.push_back(start as u32);
        while let Some(cell) = queue.pop_front() {
            component.push(cell);
            for &peer in &adjacency[cell as usize] {
                if !visited[peer as usize] {
                    visited[peer as usize] = true;
                    queue.push_back(peer);
                }
            }
        }
        component.sort_unstable();
        components.push(component);
    }
    components
}

/// Independent cell groups advanced in parallel between epochs.
pub struct Simulation {
    groups: Vec<CableCellGroup>,
    gid_to_group: BTreeMap<CellGid, (usize, u32)>,
    time: f64,
}

impl Simulation {
    pub fn new<R: Recipe + ?Sized>(
        recipe: &R,
        group_gids: Vec<Vec<CellGid>>,
        policy: &CvPolicy,
        config: SimConfig,
        catalogue: &Catalogue,
    ) -> Result<Self, EngineError> {
        let mut groups = Vec::new();
        let mut gid_to_group = BTreeMap::new();
        for gids in group_gids {
            for (lid, &gid) in gids.iter().enumerate() {
                gid_to_group.insert(gid, (groups.len(), lid as u32));
            }
            groups.push(CableCellGroup::new(
                gids, recipe, policy, config, catalogue,
            )?);
        }
        Ok(Self {
            groups,
            gid_to_group,
            time: 0.0,
        })
    }

    /// Default partition: every cell of the recipe in one group, gids
    /// ascending. Domain decomposition beyond this is the caller's job.
    pub fn single_group<R: Recipe + ?Sized>(
        recipe: &R,
        policy: &CvPolicy,
        config: SimConfig,
        catalogue: &Catalogue,
    ) -> Result<Self, EngineError> {
        let gids = (0..recipe.num_cells() as u32).map(CellGid).collect();
        Self::new(recipe, vec![gids], policy, config, catalogue)
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn group(&self, index: usize) -> &CableCellGroup {
        &self.groups[index]
    }

    pub fn group_mut(&mut self, index: usize) -> &mut CableCellGroup {
        &mut self.groups[index]
    }

    pub fn reset(&mut self) {
        for group in &mut self.groups {
            group.reset();
        }
        self.time = 0.0;
    }

    /// Advance every group to `tfinal`, returning the merged spike batch
    /// sorted by (time, source).
    pub fn advance(
        &mut self,
        tfinal: f64,
        events: &[(CellGid, CellEvent)],
    ) -> Result<Vec<Spike>, EngineError> {
        let epoch = Epoch::new(self.time, tfinal);

        let mut lanes: Vec<Vec<Vec<CellEvent>>> = self
            .groups
            .iter()
            .map(|g| vec![Vec::new(); g.n_cell()])
            .collect();
        for &(gid, ev) in events {
            let &(group, lid) = self
                .gid_to_group
                .get(&gid)
                .ok_or(EngineError::UnknownCell(gid))?;
            lanes[group][lid as usize].push(ev);
        }

        let results: Result<Vec<Vec<Spike>>, EngineError> = self
            .groups
            .par_iter_mut()
            .zip(lanes.into_par_iter())
            .map(|(group, lane)| group.advance(epoch, &lane))
            .collect();

        let mut spikes: Vec<Spike> = results?.into_iter().flatten().collect();
        spikes.sort_by(|a, b| a.time.total_cmp(&b.time).then(a.source.cmp(&b.source)));
        debug!(
            tfinal,
            n_spikes = spikes.len(),
            "simulation epoch complete"
        );
        self.time = tfinal;
        Ok(spikes)
    }
}
