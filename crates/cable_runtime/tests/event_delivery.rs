mod common;

use cable_core::{BinningPolicy, CellEvent, CellGid, ProbeKind, SimConfig};
use cable_mechanisms::Catalogue;
use cable_morphology::{parse_cv_policy, CableCell, IClamp, MechDesc};
use cable_runtime::{EngineError, Recipe, Simulation};
use common::{hh_soma_cell, soma_loc, HomogeneousRecipe, ListRecipe};

fn syn_soma_cell() -> CableCell {
    let mut cell = CableCell::new();
    cell.add_soma(6.3);
    cell.soma_mut()
        .unwrap()
        .mechanisms
        .push(MechDesc::new("pas").with("e", -65.0));
    cell.place_synapse(soma_loc(), MechDesc::new("expsyn"));
    cell.add_probe(soma_loc(), ProbeKind::Voltage);
    cell
}

fn sim_with_config(cell: CableCell, config: SimConfig) -> Simulation {
    let recipe = HomogeneousRecipe::new(1, cell);
    let policy = parse_cv_policy("(single)").unwrap();
    let catalogue = Catalogue::builtin();
    Simulation::single_group(&recipe, &policy, config, &catalogue).unwrap()
}

/// Wrapper that mis-declares the count the closure targets.
struct MiscountRecipe {
    inner: HomogeneousRecipe,
    targets: Option<usize>,
    sources: Option<usize>,
    probes: Option<usize>,
}

impl Recipe for MiscountRecipe {
    fn num_cells(&self) -> usize {
        self.inner.num_cells()
    }

    fn cell_description(&self, gid: CellGid) -> CableCell {
        self.inner.cell_description(gid)
    }

    fn num_sources(&self, gid: CellGid) -> usize {
        self.sources.unwrap_or_else(|| self.inner.num_sources(gid))
    }

    fn num_targets(&self, gid: CellGid) -> usize {
        self.targets.unwrap_or_else(|| self.inner.num_targets(gid))
    }

    fn num_probes(&self, gid: CellGid) -> usize {
        self.probes.unwrap_or_else(|| self.inner.num_probes(gid))
    }
}

#[test]
fn recipe_counts_disagreeing_with_descriptions_fail_at_binding() {
    let policy = parse_cv_policy("(single)").unwrap();
    let catalogue = Catalogue::builtin();
    let build = |recipe: &dyn Recipe| {
        Simulation::single_group(recipe, &policy, SimConfig::default(), &catalogue)
    };
    let miscount = |targets, sources, probes| MiscountRecipe {
        inner: HomogeneousRecipe::new(1, syn_soma_cell()),
        targets,
        sources,
        probes,
    };

    // The cell has one synapse, no detectors and one probe.
    match build(&miscount(Some(3), None, None)) {
        Err(EngineError::BadConnectionLabel {
            gid,
            declared,
            found,
        }) => {
            assert_eq!(gid, CellGid(0));
            assert_eq!(declared, 3);
            assert_eq!(found, 1);
        }
        Ok(_) => panic!("expected bad connection label"),
        Err(other) => panic!("expected bad connection label, got {other:?}"),
    }

    match build(&miscount(None, Some(1), None)) {
        Err(EngineError::BadUnivalentConnectionLabel {
            gid,
            declared,
            found,
        }) => {
            assert_eq!(gid, CellGid(0));
            assert_eq!(declared, 1);
            assert_eq!(found, 0);
        }
        Ok(_) => panic!("expected bad univalent connection label"),
        Err(other) => panic!("expected bad univalent connection label, got {other:?}"),
    }

    match build(&miscount(None, None, Some(0))) {
        Err(EngineError::BadProbeId(pid)) => {
            assert_eq!(pid.gid, CellGid(0));
            assert_eq!(pid.index, 0);
        }
        Ok(_) => panic!("expected bad probe id"),
        Err(other) => panic!("expected bad probe id, got {other:?}"),
    }

    assert!(build(&miscount(None, None, None)).is_ok());
}

fn ev(target: u32, time: f64, weight: f64) -> CellEvent {
    CellEvent {
        target,
        time,
        weight,
    }
}

#[test]
fn events_are_honoured_at_their_exact_times() {
    // Delivery times must not drift onto the dt_max grid: 0.33 and 0.4123
    // are not multiples of 0.025.
    let mut sim = sim_with_config(syn_soma_cell(), SimConfig::default());
    let events = [
        (CellGid(0), ev(0, 0.33, 0.01)),
        (CellGid(0), ev(0, 0.4123, 0.01)),
        (CellGid(0), ev(0, 0.77, 0.01)),
    ];
    sim.advance(1.0, &events).unwrap();

    let delivered = sim.group(0).lowered().delivered_event_times();
    assert_eq!(delivered, &[0.33, 0.4123, 0.77]);
}

#[test]
fn simultaneous_events_are_all_delivered_once() {
    let mut sim = sim_with_config(syn_soma_cell(), SimConfig::default());
    let events = [
        (CellGid(0), ev(0, 0.5, 0.01)),
        (CellGid(0), ev(0, 0.5, 0.02)),
    ];
    sim.advance(1.0, &events).unwrap();
    assert_eq!(sim.group(0).lowered().delivered_event_times(), &[0.5, 0.5]);
}

#[test]
fn regular_binning_rounds_event_times_down() {
    let config = SimConfig {
        binning: BinningPolicy::Regular { interval: 0.5 },
        ..SimConfig::default()
    };
    let mut sim = sim_with_config(syn_soma_cell(), config);
    sim.advance(20.0, &[(CellGid(0), ev(0, 10.3, 0.01))]).unwrap();
    assert_eq!(sim.group(0).lowered().delivered_event_times(), &[10.0]);
}

#[test]
fn event_in_the_past_is_fatal() {
    let mut sim = sim_with_config(syn_soma_cell(), SimConfig::default());
    sim.advance(10.0, &[]).unwrap();

    match sim.advance(20.0, &[(CellGid(0), ev(0, 5.0, 0.01))]) {
        Err(EngineError::BadEventTime {
            event_time,
            cell_time,
        }) => {
            assert_eq!(event_time, 5.0);
            assert_eq!(cell_time, 10.0);
        }
        other => panic!("expected bad event time, got {other:?}"),
    }
}

#[test]
fn event_target_out_of_range_is_rejected() {
    let mut sim = sim_with_config(syn_soma_cell(), SimConfig::default());
    match sim.advance(10.0, &[(CellGid(0), ev(5, 1.0, 0.01))]) {
        Err(EngineError::BadTarget { gid, index }) => {
            assert_eq!(gid, CellGid(0));
            assert_eq!(index, 5);
        }
        other => panic!("expected bad target, got {other:?}"),
    }
}

#[test]
fn events_to_unknown_cells_are_rejected() {
    let mut sim = sim_with_config(syn_soma_cell(), SimConfig::default());
    match sim.advance(10.0, &[(CellGid(9), ev(0, 1.0, 0.01))]) {
        Err(EngineError::UnknownCell(gid)) => assert_eq!(gid, CellGid(9)),
        other => panic!("expected unknown cell, got {other:?}"),
    }
}

#[test]
fn reordering_cells_in_a_group_leaves_spike_times_unchanged() {
    // Two distinguishable cells; spike trains must agree bitwise no
    // matter the order the group lists them in.
    let cell_a = hh_soma_cell(IClamp {
        delay: 5.0,
        duration: 40.0,
        amplitude: 0.1,
    });
    let cell_b = hh_soma_cell(IClamp {
        delay: 12.0,
        duration: 30.0,
        amplitude: 0.15,
    });
    let recipe = ListRecipe::new(vec![cell_a, cell_b]);
    let policy = parse_cv_policy("(single)").unwrap();
    let catalogue = Catalogue::builtin();
    let config = SimConfig::default();

    let mut forward = Simulation::new(
        &recipe,
        vec![vec![CellGid(0), CellGid(1)]],
        &policy,
        config,
        &catalogue,
    )
    .unwrap();
    let mut reversed = Simulation::new(
        &recipe,
        vec![vec![CellGid(1), CellGid(0)]],
        &policy,
        config,
        &catalogue,
    )
    .unwrap();

    let spikes_fwd: Vec<(u32, f64)> = forward
        .advance(50.0, &[])
        .unwrap()
        .iter()
        .map(|s| (s.source.gid.0, s.time))
        .collect();
    let spikes_rev: Vec<(u32, f64)> = reversed
        .advance(50.0, &[])
        .unwrap()
        .iter()
        .map(|s| (s.source.gid.0, s.time))
        .collect();

    assert!(!spikes_fwd.is_empty());
    assert_eq!(spikes_fwd, spikes_rev);
}

#[test]
fn synaptic_drive_can_fire_the_cell() {
    // A large-weight synaptic volley on an HH soma produces a spike tied
    // to the event, demonstrating net_receive → current → threshold flow.
    let mut cell = hh_soma_cell(IClamp {
        delay: 0.0,
        duration: 0.0,
        amplitude: 0.0,
    });
    cell.place_synapse(soma_loc(), MechDesc::new("expsyn"));
    let mut sim = sim_with_config(cell, SimConfig::default());

    let spikes = sim
        .advance(20.0, &[(CellGid(0), ev(0, 5.0, 0.5))])
        .unwrap();
    assert_eq!(spikes.len(), 1, "spikes: {spikes:?}");
    assert!(spikes[0].time > 5.0 && spikes[0].time < 8.0);
}
