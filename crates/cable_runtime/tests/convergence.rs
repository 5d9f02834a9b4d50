mod common;

use std::sync::{Arc, Mutex};

use cable_core::{CellEvent, CellGid, SimConfig};
use cable_mechanisms::Catalogue;
use cable_morphology::CvPolicy;
use cable_runtime::{Schedule, Simulation};
use common::{recording_sampler, soma_dendrite_cell, HomogeneousRecipe};

/// Soma voltage trace for the cable-with-synapse cell at the given
/// dendritic resolution: events at 10, 20 and 40 ms, sampled every 0.5 ms
/// over 50 ms.
fn soma_trace(ncomp: u32) -> Vec<f64> {
    let recipe = HomogeneousRecipe::new(1, soma_dendrite_cell(-65.0));
    let policy = CvPolicy::FixedPerBranch(ncomp);
    let catalogue = Catalogue::builtin();
    let mut sim = Simulation::new(
        &recipe,
        vec![vec![CellGid(0)]],
        &policy,
        SimConfig::default(),
        &catalogue,
    )
    .unwrap();

    let store = Arc::new(Mutex::new(Vec::new()));
    sim.group_mut(0)
        .add_sampler(|_| true, Schedule::regular(0.5), recording_sampler(store.clone()))
        .unwrap();

    let events: Vec<(CellGid, CellEvent)> = [10.0, 20.0, 40.0]
        .iter()
        .map(|&time| {
            (
                CellGid(0),
                CellEvent {
                    target: 0,
                    time,
                    weight: 0.04,
                },
            )
        })
        .collect();
    sim.advance(50.0, &events).unwrap();

    let store = store.lock().unwrap();
    assert_eq!(store.len(), 100);
    store.iter().map(|(_, r)| r.value).collect()
}

fn max_rel_error(trace: &[f64], reference: &[f64]) -> f64 {
    let scale = reference
        .iter()
        .fold(0.0f64, |acc, &v| acc.max(v.abs()))
        .max(1e-12);
    trace
        .iter()
        .zip(reference)
        .fold(0.0f64, |acc, (&a, &b)| acc.max((a - b).abs()))
        / scale
}

#[test]
fn soma_voltage_converges_under_refinement() {
    let reference = soma_trace(64);
    let err_1 = max_rel_error(&soma_trace(1), &reference);
    let err_4 = max_rel_error(&soma_trace(4), &reference);
    let err_16 = max_rel_error(&soma_trace(16), &reference);

    assert!(
        err_1 > err_4 && err_4 > err_16,
        "errors not decreasing: {err_1} {err_4} {err_16}"
    );
    assert!(err_16 < 0.005, "error at 16 compartments: {err_16}");

    // The synapse actually perturbed the trace.
    let span = reference
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    assert!(span.1 - span.0 > 0.5, "trace is flat: {span:?}");
}

#[test]
fn identical_discretisations_give_identical_traces() {
    let a = soma_trace(16);
    let b = soma_trace(16);
    assert_eq!(a, b);
}
