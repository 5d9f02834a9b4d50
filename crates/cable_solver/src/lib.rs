#![forbid(unsafe_code)]

//! Direct solver for the per-step linear system of branched cables.
//!
//! The matrix is symmetric with an off-diagonal sparsity graph that is a
//! forest: entry (i, p[i]) couples each CV to its parent, and parents
//! always precede children. One bottom-up elimination followed by a
//! top-down substitution solves the system in O(n).
//!
//! Memory layout, where j = p[i] is the parent of i (so j < i):
//!
//!     d[j] . . u[i]
//!      .  .     .
//!      .     .  .
//!     u[i] . . d[i]

use cable_core::PARENT_NONE;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum MatrixError {
    #[error("parent index {parent} at CV {index} is not topologically ordered")]
    BadParentOrder { index: usize, parent: u32 },
}

#[derive(Debug, Clone)]
pub struct HinesMatrix {
    parent_index: Vec<u32>,
    d: Vec<f64>,
    u: Vec<f64>,
    rhs: Vec<f64>,
}

impl HinesMatrix {
    /// Build from a group-wide parent vector; roots carry `PARENT_NONE`.
    pub fn new(parent_index: Vec<u32>) -> Result<Self, MatrixError> {
        for (index, &parent) in parent_index.iter().enumerate() {
            if parent != PARENT_NONE && parent as usize >= index {
                return Err(MatrixError::BadParentOrder { index, parent });
            }
        }
        let n = parent_index.len();
        Ok(Self {
            parent_index,
            d: vec![0.0; n],
            u: vec![0.0; n],
            rhs: vec![0.0; n],
        })
    }

    pub fn size(&self) -> usize {
        self.parent_index.len()
    }

    pub fn parent_index(&self) -> &[u32] {
        &self.parent_index
    }

    pub fn d(&self) -> &[f64] {
        &self.d
    }

    pub fn u(&self) -> &[f64] {
        &self.u
    }

    pub fn rhs(&self) -> &[f64] {
        &self.rhs
    }

    pub fn rhs_mut(&mut self) -> &mut [f64] {
        &mut self.rhs
    }

    /// Assemble the system for one sub-step.
    ///
    /// The axial conductance term at the face between CV i and its parent
    /// is `1e5·dt·face_alpha[i]`; the right-hand side is
    /// `area[i]·(V[i] − 10·dt/c_m[i]·J[i])` with J the membrane current
    /// density [mA/cm²] and the factor 10 folding the unit conversions
    /// into mV.
    pub fn assemble(
        &mut self,
        dt_cv: &[f64],
        voltage: &[f64],
        current_density: &[f64],
        cv_area: &[f64],
        face_alpha: &[f64],
        cv_capacitance: &[f64],
    ) {
        let n = self.size();
        debug_assert!(
            [
                dt_cv.len(),
                voltage.len(),
                current_density.len(),
                cv_area.len(),
                face_alpha.len(),
                cv_capacitance.len(),
            ]
            .iter()
            .all(|&len| len >= n)
        );

        self.d[..n].copy_from_slice(&cv_area[..n]);
        for i in 0..n {
            let parent = self.parent_index[i];
            if parent == PARENT_NONE {
                self.u[i] = 0.0;
                continue;
            }
            let a = 1e5 * dt_cv[i] * face_alpha[i];
            self.d[i] += a;
            self.u[i] = -a;
            self.d[parent as usize] += a;
        }

        for i in 0..n {
            let factor = 10.0 * dt_cv[i] / cv_capacitance[i];
            self.rhs[i] = cv_area[i] * (voltage[i] - factor * current_density[i]);
        }
    }

    /// Solve in place; the solution replaces `rhs`.
    pub fn solve(&mut self) {
        let n = self.size();

        // Bottom-up elimination: children are processed before parents.
        for i in (0..n).rev() {
            let parent = self.parent_index[i];
            if parent == PARENT_NONE {
                continue;
            }
            let factor = self.u[i] / self.d[i];
            self.d[parent as usize] -= factor * self.u[i];
            self.rhs[parent as usize] -= factor * self.rhs[i];
        }

        // Top-down substitution.
        for i in 0..n {
            let parent = self.parent_index[i];
            if parent == PARENT_NONE {
                self.rhs[i] /= self.d[i];
            } else {
                self.rhs[i] = (self.rhs[i] - self.u[i] * self.rhs[parent as usize]) / self.d[i];
            }
        }
    }
}
