use cable_core::PARENT_NONE;
use cable_solver::{HinesMatrix, MatrixError};

const N: usize = 7;

// Small branched tree: 0 ← 1 ← 2, 2 ← 3, 2 ← 5, plus a chain.
fn tree_parents() -> Vec<u32> {
    vec![PARENT_NONE, 0, 1, 2, 3, 2, 5]
}

fn assemble_reference(m: &mut HinesMatrix, dt: f64) {
    let dt_cv = vec![dt; N];
    let voltage = vec![-65.0; N];
    let current = vec![0.5; N];
    let area = vec![100.0, 40.0, 30.0, 20.0, 15.0, 25.0, 10.0];
    let alpha = vec![0.0, 2.0e-3, 1.5e-3, 1.0e-3, 0.8e-3, 1.2e-3, 0.5e-3];
    let cap = vec![0.01; N];
    m.assemble(&dt_cv, &voltage, &current, &area, &alpha, &cap);
}

#[test]
fn rejects_unordered_parents() {
    let err = HinesMatrix::new(vec![PARENT_NONE, 2, 1]).unwrap_err();
    assert_eq!(
        err,
        MatrixError::BadParentOrder {
            index: 1,
            parent: 2
        }
    );
}

#[test]
fn assembly_is_symmetric() {
    let mut m = HinesMatrix::new(tree_parents()).unwrap();
    assemble_reference(&mut m, 0.025);

    // Reconstruct the dense matrix from (d, u, p) and check symmetry: the
    // single off-diagonal array must serve both (i, p[i]) and (p[i], i).
    let mut dense = vec![vec![0.0f64; N]; N];
    for i in 0..N {
        dense[i][i] = m.d()[i];
        let p = m.parent_index()[i];
        if p != PARENT_NONE {
            dense[i][p as usize] = m.u()[i];
            dense[p as usize][i] = m.u()[i];
        }
    }
    for i in 0..N {
        for j in 0..N {
            assert_eq!(dense[i][j], dense[j][i]);
        }
    }
}

#[test]
fn constant_voltage_is_a_fixed_point() {
    // With zero current the RHS is area·V and the axial terms cancel, so
    // the solve must return the input voltage exactly up to rounding.
    let mut m = HinesMatrix::new(tree_parents()).unwrap();
    let dt_cv = vec![0.025; N];
    let voltage = vec![-65.0; N];
    let current = vec![0.0; N];
    let area = vec![100.0, 40.0, 30.0, 20.0, 15.0, 25.0, 10.0];
    let alpha = vec![0.0, 2.0e-3, 1.5e-3, 1.0e-3, 0.8e-3, 1.2e-3, 0.5e-3];
    let cap = vec![0.01; N];
    m.assemble(&dt_cv, &voltage, &current, &area, &alpha, &cap);
    m.solve();
    for i in 0..N {
        assert!((m.rhs()[i] - -65.0).abs() < 1e-9, "cv {i}: {}", m.rhs()[i]);
    }
}

#[test]
fn solve_matches_dense_gaussian_elimination() {
    let mut m = HinesMatrix::new(tree_parents()).unwrap();
    assemble_reference(&mut m, 0.1);

    let mut dense = vec![vec![0.0f64; N]; N];
    for i in 0..N {
        dense[i][i] = m.d()[i];
        let p = m.parent_index()[i];
        if p != PARENT_NONE {
            dense[i][p as usize] = m.u()[i];
            dense[p as usize][i] = m.u()[i];
        }
    }
    let mut b: Vec<f64> = m.rhs().to_vec();

    // Plain dense elimination with partial pivoting skipped (diagonally
    // dominant by construction).
    for k in 0..N {
        for i in k + 1..N {
            let f = dense[i][k] / dense[k][k];
            for j in k..N {
                dense[i][j] -= f * dense[k][j];
            }
            b[i] -= f * b[k];
        }
    }
    let mut x = vec![0.0f64; N];
    for i in (0..N).rev() {
        let mut acc = b[i];
        for j in i + 1..N {
            acc -= dense[i][j] * x[j];
        }
        x[i] = acc / dense[i][i];
    }

    m.solve();
    for i in 0..N {
        assert!(
            (m.rhs()[i] - x[i]).abs() < 1e-9 * x[i].abs().max(1.0),
            "cv {i}: {} vs {}",
            m.rhs()[i],
            x[i]
        );
    }
}

#[test]
fn solver_is_linear_in_the_rhs() {
    let x: Vec<f64> = (0..N).map(|i| (i as f64 + 1.0) * 0.7).collect();
    let y: Vec<f64> = (0..N).map(|i| 3.0 - i as f64 * 0.4).collect();
    let (alpha, beta) = (2.5, -1.25);

    let solve_with = |rhs: &[f64]| -> Vec<f64> {
        let mut m = HinesMatrix::new(tree_parents()).unwrap();
        assemble_reference(&mut m, 0.05);
        m.rhs_mut().copy_from_slice(rhs);
        m.solve();
        m.rhs().to_vec()
    };

    let sx = solve_with(&x);
    let sy = solve_with(&y);
    let combined: Vec<f64> = (0..N).map(|i| alpha * x[i] + beta * y[i]).collect();
    let sc = solve_with(&combined);

    for i in 0..N {
        let expect = alpha * sx[i] + beta * sy[i];
        assert!(
            (sc[i] - expect).abs() < 1e-9 * expect.abs().max(1.0),
            "cv {i}: {} vs {expect}",
            sc[i]
        );
    }
}
