//! Shared recipes and helpers for the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use cable_core::{CellGid, CellMember, ProbeKind, SampleRecord};
use cable_morphology::{CableCell, CableSegment, IClamp, Location, MechDesc};
use cable_runtime::{GapJunctionConn, Recipe, SamplerFn};

/// Recipe serving the same cell description for every gid.
pub struct HomogeneousRecipe {
    pub n: usize,
    pub cell: CableCell,
    pub gj_pairs: Vec<(u32, u32, f64)>,
}

impl HomogeneousRecipe {
    pub fn new(n: usize, cell: CableCell) -> Self {
        Self {
            n,
            cell,
            gj_pairs: Vec::new(),
        }
    }
}

impl Recipe for HomogeneousRecipe {
    fn num_cells(&self) -> usize {
        self.n
    }

    fn cell_description(&self, _gid: CellGid) -> CableCell {
        self.cell.clone()
    }

    fn num_sources(&self, _gid: CellGid) -> usize {
        self.cell.detectors.len()
    }

    fn num_targets(&self, _gid: CellGid) -> usize {
        self.cell.synapses.len()
    }

    fn num_probes(&self, _gid: CellGid) -> usize {
        self.cell.probes.len()
    }

    fn gap_junctions_on(&self, gid: CellGid) -> Vec<GapJunctionConn> {
        let soma_mid = Location {
            segment: 0,
            pos: 0.5,
        };
        let mut conns = Vec::new();
        for &(a, b, g) in &self.gj_pairs {
            let peer = if gid.0 == a {
                b
            } else if gid.0 == b {
                a
            } else {
                continue;
            };
            conns.push(GapJunctionConn {
                local: soma_mid,
                peer: CellGid(peer),
                peer_location: soma_mid,
                conductance: g,
            });
        }
        conns
    }
}

/// Recipe with one explicit description per gid.
pub struct ListRecipe {
    pub cells: Vec<CableCell>,
    pub gj_pairs: Vec<(u32, u32, f64)>,
}

impl ListRecipe {
    pub fn new(cells: Vec<CableCell>) -> Self {
        Self {
            cells,
            gj_pairs: Vec::new(),
        }
    }
}

impl Recipe for ListRecipe {
    fn num_cells(&self) -> usize {
        self.cells.len()
    }

    fn cell_description(&self, gid: CellGid) -> CableCell {
        self.cells[gid.0 as usize].clone()
    }

    fn num_sources(&self, gid: CellGid) -> usize {
        self.cells[gid.0 as usize].detectors.len()
    }

    fn num_targets(&self, gid: CellGid) -> usize {
        self.cells[gid.0 as usize].synapses.len()
    }

    fn num_probes(&self, gid: CellGid) -> usize {
        self.cells[gid.0 as usize].probes.len()
    }

    fn gap_junctions_on(&self, gid: CellGid) -> Vec<GapJunctionConn> {
        let soma_mid = Location {
            segment: 0,
            pos: 0.5,
        };
        let mut conns = Vec::new();
        for &(a, b, g) in &self.gj_pairs {
            let peer = if gid.0 == a {
                b
            } else if gid.0 == b {
                a
            } else {
                continue;
            };
            conns.push(GapJunctionConn {
                local: soma_mid,
                peer: CellGid(peer),
                peer_location: soma_mid,
                conductance: g,
            });
        }
        conns
    }
}

pub fn soma_loc() -> Location {
    Location {
        segment: 0,
        pos: 0.5,
    }
}

/// Soma-only cell with HH channels, a stimulus, a detector and a voltage
/// probe, as in the standard single-compartment benchmark.
pub fn hh_soma_cell(stim: IClamp) -> CableCell {
    let mut cell = CableCell::new();
    cell.add_soma(6.3);
    cell.soma_mut().unwrap().mechanisms.push(MechDesc::new("hh"));
    cell.add_stimulus(soma_loc(), stim);
    cell.add_detector(soma_loc(), 0.0);
    cell.add_probe(soma_loc(), ProbeKind::Voltage);
    cell
}

/// Soma plus a 200 µm passive dendrite with an expsyn halfway along it.
pub fn soma_dendrite_cell(weighted_pas_e: f64) -> CableCell {
    let mut cell = CableCell::new();
    cell.add_soma(6.3);
    cell.soma_mut()
        .unwrap()
        .mechanisms
        .push(MechDesc::new("pas").with("e", weighted_pas_e));
    let mut dendrite = CableSegment::uniform(0, 200.0, 1.0);
    dendrite
        .mechanisms
        .push(MechDesc::new("pas").with("e", weighted_pas_e));
    let dend = cell.add_cable(dendrite);
    cell.place_synapse(
        Location {
            segment: dend,
            pos: 0.5,
        },
        MechDesc::new("expsyn"),
    );
    cell.add_probe(soma_loc(), ProbeKind::Voltage);
    cell
}

/// Sampler that appends every record to a shared vector.
pub fn recording_sampler(store: Arc<Mutex<Vec<(CellMember, SampleRecord)>>>) -> SamplerFn {
    Box::new(move |probe_id, records| {
        let mut store = store.lock().unwrap();
        for &record in records {
            store.push((probe_id, record));
        }
    })
}
