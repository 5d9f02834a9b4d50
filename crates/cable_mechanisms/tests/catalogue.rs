use cable_mechanisms::{Catalogue, MechanismError, MechanismKind};
use cable_state::SharedState;

#[test]
fn builtin_catalogue_contents() {
    let cat = Catalogue::builtin();
    assert!(cat.has("pas"));
    assert!(cat.has("hh"));
    assert!(cat.has("expsyn"));
    assert!(!cat.has("nmda"));

    assert_eq!(cat.info("pas").unwrap().kind, MechanismKind::Density);
    assert_eq!(cat.info("expsyn").unwrap().kind, MechanismKind::Point);
    assert_eq!(
        cat.make("nmda").err(),
        Some(MechanismError::NoSuchMechanism("nmda".to_string()))
    );
}

#[test]
fn fingerprints_gate_instantiation() {
    let cat = Catalogue::builtin();
    let fp = cat.fingerprint("hh").unwrap();
    assert!(cat.make_checked("hh", fp).is_ok());

    let mut stale = fp;
    stale[0] ^= 0xff;
    assert_eq!(
        cat.make_checked("hh", stale).err(),
        Some(MechanismError::FingerprintMismatch {
            name: "hh".to_string()
        })
    );

    // Distinct mechanisms never share a fingerprint.
    assert_ne!(fp, cat.fingerprint("pas").unwrap());
}

#[test]
fn parameter_binding_is_validated() {
    let cat = Catalogue::builtin();
    let mut pas = cat.make("pas").unwrap();
    pas.bind(vec![0, 1], vec![1.0, 1.0]);

    assert!(pas.set_param("g", 0.002).is_ok());
    assert_eq!(
        pas.set_param("gbar", 1.0).err(),
        Some(MechanismError::NoSuchParameter {
            name: "pas".to_string(),
            param: "gbar".to_string()
        })
    );
    assert_eq!(
        pas.set_param("g", -0.5).err(),
        Some(MechanismError::InvalidParameterValue {
            name: "pas".to_string(),
            param: "g".to_string(),
            value: -0.5
        })
    );
    assert!(matches!(
        pas.set_param("g", f64::NAN),
        Err(MechanismError::InvalidParameterValue { .. })
    ));
}

#[test]
fn net_receive_on_density_mechanism_is_invalid() {
    let cat = Catalogue::builtin();
    let mut pas = cat.make("pas").unwrap();
    pas.bind(vec![0], vec![1.0]);
    assert_eq!(
        pas.net_receive(0, 0.1).err(),
        Some(MechanismError::InvalidOperation("pas".to_string()))
    );
}

#[test]
fn derived_mechanisms_rename_ions() {
    let mut cat = Catalogue::builtin();
    cat.derive("hh", "hh_nax", &[("na".to_string(), "nax".to_string())])
        .unwrap();
    let info = cat.info("hh_nax").unwrap();
    assert_eq!(info.ions[0].name, "nax");
    assert_eq!(info.ions[1].name, "k");
    let mech = cat.make("hh_nax").unwrap();
    assert_eq!(mech.info().name, "hh_nax");

    // Renaming an ion the base does not use fails.
    assert_eq!(
        cat.derive("pas", "pas_ca", &[("ca".to_string(), "cax".to_string())])
            .err(),
        Some(MechanismError::InvalidIonRemap {
            name: "pas".to_string(),
            ion: "ca".to_string()
        })
    );

    // Re-deriving the same name with a conflicting remap fails.
    assert_eq!(
        cat.derive("hh", "hh_nax", &[("na".to_string(), "nay".to_string())])
            .err(),
        Some(MechanismError::InvalidIonRemap {
            name: "hh_nax".to_string(),
            ion: "na".to_string()
        })
    );
}

#[test]
fn pas_current_matches_closed_form() {
    let cat = Catalogue::builtin();
    let mut pas = cat.make("pas").unwrap();
    pas.bind(vec![0, 1], vec![1.0, 0.5]);
    pas.set_param("e", -65.0).unwrap();

    let mut state = SharedState::new(1, vec![0, 0]);
    state.reset(-55.0, 279.45);
    pas.init(&mut state);
    pas.compute_currents(&mut state);

    // g·(v − e) = 0.001·10 = 0.01 mA/cm², half-weighted on CV 1.
    assert!((state.current_density[0] - 0.01).abs() < 1e-15);
    assert!((state.current_density[1] - 0.005).abs() < 1e-15);
}

#[test]
fn expsyn_receives_and_decays() {
    let cat = Catalogue::builtin();
    let mut syn = cat.make("expsyn").unwrap();
    // Two synapses on the same CV: accumulation must serialise.
    syn.bind(vec![3, 3], vec![0.2, 0.2]);

    let mut state = SharedState::new(1, vec![0, 0, 0, 0]);
    state.reset(-60.0, 279.45);
    syn.init(&mut state);

    syn.net_receive(0, 0.04).unwrap();
    syn.net_receive(1, 0.01).unwrap();
    syn.compute_currents(&mut state);
    // i = Σ g·(v − 0) nA · weight = (0.04 + 0.01)·(−60)·0.2.
    let expect = 0.2 * 0.05 * -60.0;
    assert!((state.current_density[3] - expect).abs() < 1e-12);

    // One tau of decay shrinks g by e⁻¹.
    state.time_to = vec![2.0];
    state.set_dt();
    syn.advance_state(&mut state);
    syn.compute_currents(&mut state);
    let expect_after = expect + expect * (-1.0f64).exp();
    assert!((state.current_density[3] - expect_after).abs() < 1e-12);
}

#[test]
fn hh_initialises_to_steady_state() {
    let cat = Catalogue::builtin();
    let mut hh = cat.make("hh").unwrap();
    hh.bind(vec![0], vec![1.0]);
    hh.set_ion_index(0, vec![0]);
    hh.set_ion_index(1, vec![0]);

    let mut state = SharedState::new(1, vec![0]);
    state.add_ion(
        "na",
        cable_state::IonInfo {
            charge: 1,
            default_int_concentration: 10.0,
            default_ext_concentration: 140.0,
        },
        vec![0],
        vec![1.0],
        vec![1.0],
    );
    state.add_ion(
        "k",
        cable_state::IonInfo {
            charge: 1,
            default_int_concentration: 54.4,
            default_ext_concentration: 2.5,
        },
        vec![0],
        vec![1.0],
        vec![1.0],
    );
    state.reset(-65.0, 279.45);
    hh.init(&mut state);

    // At steady state the gate update must be a fixed point.
    state.time_to = vec![0.025];
    state.set_dt();
    hh.compute_currents(&mut state);
    let i0 = state.current_density[0];
    hh.advance_state(&mut state);
    state.zero_currents();
    hh.compute_currents(&mut state);
    assert!((state.current_density[0] - i0).abs() < 1e-12);
}
