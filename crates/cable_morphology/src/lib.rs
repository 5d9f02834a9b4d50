#![forbid(unsafe_code)]

//! Cable-cell descriptions and the finite-volume discretiser that lowers
//! them into control volumes.

use cable_core::ProbeKind;
use thiserror::Error;

pub mod policy;

pub use cable_core::PARENT_NONE;
pub use policy::{parse_cv_policy, CvPolicy, PolicyParseError};

/// Density or point mechanism attachment with parameter overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct MechDesc {
    pub name: String,
    pub params: Vec<(String, f64)>,
}

impl MechDesc {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
        }
    }

    pub fn with(mut self, param: &str, value: f64) -> Self {
        self.params.push((param.to_string(), value));
        self
    }
}

/// Spherical soma. Always segment 0 when present.
#[derive(Debug, Clone, PartialEq)]
pub struct SomaSegment {
    /// Radius [µm].
    pub radius: f64,
    /// Membrane capacitance per area [F/m²].
    pub c_m: f64,
    pub mechanisms: Vec<MechDesc>,
}

/// One sample of a cable's piecewise-linear geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CablePoint {
    /// Arc length from the proximal end [µm].
    pub arc: f64,
    /// Radius [µm].
    pub radius: f64,
}

/// Unbranched cable of truncated cones.
#[derive(Debug, Clone, PartialEq)]
pub struct CableSegment {
    /// Parent segment index; a root segment is its own parent.
    pub parent: usize,
    /// At least two samples, arc strictly increasing from 0.
    pub points: Vec<CablePoint>,
    /// Membrane capacitance per area [F/m²].
    pub c_m: f64,
    /// Axial resistivity [Ω·cm].
    pub r_l: f64,
    pub mechanisms: Vec<MechDesc>,
}

impl CableSegment {
    /// Cable with linearly tapering radius.
    pub fn frustum(parent: usize, length: f64, r_prox: f64, r_dist: f64) -> Self {
        Self {
            parent,
            points: vec![
                CablePoint {
                    arc: 0.0,
                    radius: r_prox,
                },
                CablePoint {
                    arc: length,
                    radius: r_dist,
                },
            ],
            c_m: 0.01,
            r_l: 100.0,
            mechanisms: Vec::new(),
        }
    }

    /// Cable with constant radius.
    pub fn uniform(parent: usize, length: f64, radius: f64) -> Self {
        Self::frustum(parent, length, radius, radius)
    }

    pub fn length(&self) -> f64 {
        self.points.last().map(|p| p.arc).unwrap_or(0.0)
    }

    /// Radius at arc position `x`, linearly interpolated.
    fn radius_at(&self, x: f64) -> f64 {
        let points = &self.points;
        if x <= points[0].arc {
            return points[0].radius;
        }
        for pair in points.windows(2) {
            if x <= pair[1].arc {
                let span = pair[1].arc - pair[0].arc;
                let f = (x - pair[0].arc) / span;
                return pair[0].radius + f * (pair[1].radius - pair[0].radius);
            }
        }
        points[points.len() - 1].radius
    }

    /// Exact lateral surface area of the geometry between arcs `a` and `b`,
    /// accumulated piecewise so that sub-interval areas sum to the total.
    fn area_between(&self, a: f64, b: f64) -> f64 {
        let mut total = 0.0;
        for pair in self.points.windows(2) {
            let lo = pair[0].arc.max(a);
            let hi = pair[1].arc.min(b);
            if hi > lo {
                let r_lo = self.radius_at(lo);
                let r_hi = self.radius_at(hi);
                total += area_frustum(hi - lo, r_lo, r_hi);
            }
        }
        total
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Soma(SomaSegment),
    Cable(CableSegment),
}

/// Fractional position along a segment: 0 proximal, 1 distal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub segment: usize,
    pub pos: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointMechDesc {
    pub location: Location,
    pub mech: MechDesc,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdDetector {
    pub location: Location,
    /// Crossing threshold [mV].
    pub threshold: f64,
}

/// Square current pulse [nA], active on [delay, delay+duration).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IClamp {
    pub delay: f64,
    pub duration: f64,
    pub amplitude: f64,
}

impl IClamp {
    pub fn amplitude_at(&self, t: f64) -> f64 {
        if t >= self.delay && t < self.delay + self.duration {
            self.amplitude
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StimulusDesc {
    pub location: Location,
    pub clamp: IClamp,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeDesc {
    pub location: Location,
    pub kind: ProbeKind,
}

/// Full description of one morphologically detailed cell.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CableCell {
    pub segments: Vec<Segment>,
    pub synapses: Vec<PointMechDesc>,
    pub detectors: Vec<ThresholdDetector>,
    pub stimuli: Vec<StimulusDesc>,
    pub probes: Vec<ProbeDesc>,
}

impl CableCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a spherical soma as segment 0. Returns the segment index.
    pub fn add_soma(&mut self, radius: f64) -> usize {
        self.segments.insert(
            0,
            Segment::Soma(SomaSegment {
                radius,
                c_m: 0.01,
                mechanisms: Vec::new(),
            }),
        );
        0
    }

    pub fn add_cable(&mut self, cable: CableSegment) -> usize {
        self.segments.push(Segment::Cable(cable));
        self.segments.len() - 1
    }

    pub fn soma_mut(&mut self) -> Option<&mut SomaSegment> {
        match self.segments.first_mut() {
            Some(Segment::Soma(s)) => Some(s),
            _ => None,
        }
    }

    pub fn cable_mut(&mut self, segment: usize) -> Option<&mut CableSegment> {
        match self.segments.get_mut(segment) {
            Some(Segment::Cable(c)) => Some(c),
            _ => None,
        }
    }

    pub fn place_synapse(&mut self, location: Location, mech: MechDesc) -> usize {
        self.synapses.push(PointMechDesc { location, mech });
        self.synapses.len() - 1
    }

    pub fn add_detector(&mut self, location: Location, threshold: f64) -> usize {
        self.detectors.push(ThresholdDetector {
            location,
            threshold,
        });
        self.detectors.len() - 1
    }

    pub fn add_stimulus(&mut self, location: Location, clamp: IClamp) {
        self.stimuli.push(StimulusDesc { location, clamp });
    }

    pub fn add_probe(&mut self, location: Location, kind: ProbeKind) -> usize {
        self.probes.push(ProbeDesc { location, kind });
        self.probes.len() - 1
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum MorphologyError {
    #[error("invalid morphology: cell has no segments")]
    EmptyCell,
    #[error("invalid morphology: soma must be segment 0, found at {0}")]
    SomaNotRoot(usize),
    #[error("invalid morphology: more than one soma")]
    MultipleSomas,
    #[error("invalid morphology: segment {segment} has parent {parent} out of order")]
    BadParent { segment: usize, parent: usize },
    #[error("invalid morphology: segment {segment} needs at least two samples")]
    TooFewSamples { segment: usize },
    #[error("invalid morphology: segment {segment} arc lengths must increase from 0")]
    BadArcs { segment: usize },
    #[error("invalid morphology: non-positive radius on segment {segment}")]
    BadRadius { segment: usize },
    #[error("invalid location: segment {segment} out of range")]
    BadLocationSegment { segment: usize },
    #[error("invalid location: position {pos} outside [0, 1]")]
    BadLocationPos { pos: f64 },
}

/// Result of lowering one cell onto control volumes. All indices are
/// cell-local; the runtime offsets them into the group-wide arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct Discretisation {
    pub n_cv: usize,
    /// Parent CV index; `PARENT_NONE` for the root.
    pub parent_index: Vec<u32>,
    /// Surface area [µm²].
    pub cv_area: Vec<f64>,
    /// Capacitance per area [F/m²].
    pub cv_capacitance: Vec<f64>,
    /// Face coupling to parent; the matrix axial term is `1e5·dt·face_alpha`.
    pub face_alpha: Vec<f64>,
    seg_first_cv: Vec<u32>,
    seg_ncomp: Vec<u32>,
    seg_attach_cv: Vec<u32>,
    seg_is_root_cable: Vec<bool>,
}

impl Discretisation {
    /// CVs owned by one segment, ascending. For a soma this is its single
    /// CV; for a root cable it includes the extra root CV at sample 0.
    pub fn segment_cv_range(&self, segment: usize) -> Vec<u32> {
        let first = self.seg_first_cv[segment];
        let ncomp = self.seg_ncomp[segment];
        if ncomp == 0 {
            return vec![first];
        }
        let count = if self.seg_is_root_cable[segment] {
            ncomp + 1
        } else {
            ncomp
        };
        (first..first + count).collect()
    }

    /// Map a fractional location to the CV whose centre sample is nearest.
    pub fn location_cv(&self, loc: Location) -> Result<u32, MorphologyError> {
        if loc.segment >= self.seg_first_cv.len() {
            return Err(MorphologyError::BadLocationSegment {
                segment: loc.segment,
            });
        }
        if !(0.0..=1.0).contains(&loc.pos) {
            return Err(MorphologyError::BadLocationPos { pos: loc.pos });
        }
        let ncomp = self.seg_ncomp[loc.segment];
        if ncomp == 0 {
            // Soma occupies exactly one CV.
            return Ok(self.seg_first_cv[loc.segment]);
        }
        let sample = (loc.pos * ncomp as f64).round() as u32;
        let first = self.seg_first_cv[loc.segment];
        if self.seg_is_root_cable[loc.segment] {
            Ok(first + sample)
        } else if sample == 0 {
            Ok(self.seg_attach_cv[loc.segment])
        } else {
            Ok(first + sample - 1)
        }
    }
}

/// Lateral surface area of a truncated cone of height `h` between radii
/// `r1` and `r2` [µm²].
pub fn area_frustum(h: f64, r1: f64, r2: f64) -> f64 {
    std::f64::consts::PI * (r1 + r2) * ((r1 - r2).powi(2) + h * h).sqrt()
}

/// Surface area of a sphere of radius `r` [µm²].
pub fn area_sphere(r: f64) -> f64 {
    4.0 * std::f64::consts::PI * r * r
}

/// Area of a circle of radius `r` [µm²].
pub fn area_circle(r: f64) -> f64 {
    std::f64::consts::PI * r * r
}

fn validate(cell: &CableCell) -> Result<(), MorphologyError> {
    if cell.segments.is_empty() {
        return Err(MorphologyError::EmptyCell);
    }
    let mut somas = 0usize;
    for (index, segment) in cell.segments.iter().enumerate() {
        match segment {
            Segment::Soma(soma) => {
                somas += 1;
                if index != 0 {
                    return Err(MorphologyError::SomaNotRoot(index));
                }
                if somas > 1 {
                    return Err(MorphologyError::MultipleSomas);
                }
                if !(soma.radius > 0.0) {
                    return Err(MorphologyError::BadRadius { segment: index });
                }
            }
            Segment::Cable(cable) => {
                if index > 0 && cable.parent >= index {
                    return Err(MorphologyError::BadParent {
                        segment: index,
                        parent: cable.parent,
                    });
                }
                if cable.points.len() < 2 {
                    return Err(MorphologyError::TooFewSamples { segment: index });
                }
                if cable.points[0].arc != 0.0 {
                    return Err(MorphologyError::BadArcs { segment: index });
                }
                for pair in cable.points.windows(2) {
                    if !(pair[1].arc > pair[0].arc) {
                        return Err(MorphologyError::BadArcs { segment: index });
                    }
                }
                if cable.points.iter().any(|p| !(p.radius > 0.0)) {
                    return Err(MorphologyError::BadRadius { segment: index });
                }
            }
        }
    }
    Ok(())
}

/// Lower one cell onto control volumes under the given policy.
///
/// Soma spheres take one CV of area 4πr². A cable with N compartments has
/// its CV centres at the N+1 equal-arc sample points; sample 0 belongs to
/// the parent CV (or becomes the root CV of a soma-less cell). Each face
/// between adjacent centres sits at the compartment midpoint and splits the
/// compartment's membrane between the two CVs.
pub fn discretise(cell: &CableCell, policy: &CvPolicy) -> Result<Discretisation, MorphologyError> {
    validate(cell)?;

    let nseg = cell.segments.len();
    let mut seg_first_cv = vec![0u32; nseg];
    let mut seg_ncomp = vec![0u32; nseg];
    let mut seg_attach_cv = vec![0u32; nseg];
    let mut seg_is_root_cable = vec![false; nseg];
    let mut seg_last_cv = vec![0u32; nseg];

    // First pass: assign CV index ranges.
    let mut next_cv = 0u32;
    for (index, segment) in cell.segments.iter().enumerate() {
        match segment {
            Segment::Soma(_) => {
                seg_first_cv[index] = next_cv;
                seg_last_cv[index] = next_cv;
                next_cv += 1;
            }
            Segment::Cable(cable) => {
                // A zero count requests one CV per piecewise-linear
                // geometry interval.
                let ncomp = match policy.compartments(cable) {
                    0 => (cable.points.len() - 1) as u32,
                    n => n,
                };
                seg_ncomp[index] = ncomp;
                seg_first_cv[index] = next_cv;
                let root = index == 0;
                seg_is_root_cable[index] = root;
                if root {
                    // Sample 0 has no parent CV and becomes the root CV.
                    next_cv += ncomp + 1;
                } else {
                    seg_attach_cv[index] = seg_last_cv[cable.parent];
                    next_cv += ncomp;
                }
                seg_last_cv[index] = next_cv - 1;
            }
        }
    }

    let n_cv = next_cv as usize;
    let mut parent_index = vec![PARENT_NONE; n_cv];
    let mut cv_area = vec![0.0f64; n_cv];
    let mut cv_capacitance = vec![0.0f64; n_cv];
    let mut face_alpha = vec![0.0f64; n_cv];

    // Second pass: geometry.
    for (index, segment) in cell.segments.iter().enumerate() {
        match segment {
            Segment::Soma(soma) => {
                let cv = seg_first_cv[index] as usize;
                let area = area_sphere(soma.radius);
                cv_area[cv] += area;
                cv_capacitance[cv] += area * soma.c_m;
            }
            Segment::Cable(cable) => {
                let ncomp = seg_ncomp[index];
                let length = cable.length();
                let dx = length / ncomp as f64;
                let first = seg_first_cv[index];
                let root = seg_is_root_cable[index];

                for k in 0..ncomp {
                    // Compartment k spans samples k..k+1; its face sits at
                    // the arc midpoint between the two CV centres.
                    let x_left = k as f64 * dx;
                    let x_right = (k + 1) as f64 * dx;
                    let x_mid = 0.5 * (x_left + x_right);

                    let cv_left = if root {
                        first + k
                    } else if k == 0 {
                        seg_attach_cv[index]
                    } else {
                        first + k - 1
                    };
                    let cv_right = if root { first + k + 1 } else { first + k };

                    parent_index[cv_right as usize] = cv_left;

                    let r_face = cable.radius_at(x_mid);
                    face_alpha[cv_right as usize] =
                        area_circle(r_face) / (cable.c_m * cable.r_l * dx);

                    let area_left = cable.area_between(x_left, x_mid);
                    let area_right = cable.area_between(x_mid, x_right);
                    cv_area[cv_left as usize] += area_left;
                    cv_area[cv_right as usize] += area_right;
                    cv_capacitance[cv_left as usize] += area_left * cable.c_m;
                    cv_capacitance[cv_right as usize] += area_right * cable.c_m;
                }
            }
        }
    }

    // Normalise stored capacitance to capacitance per area.
    for cv in 0..n_cv {
        if cv_area[cv] > 0.0 {
            cv_capacitance[cv] /= cv_area[cv];
        }
    }

    Ok(Discretisation {
        n_cv,
        parent_index,
        cv_area,
        cv_capacitance,
        face_alpha,
        seg_first_cv,
        seg_ncomp,
        seg_attach_cv,
        seg_is_root_cable,
    })
}
