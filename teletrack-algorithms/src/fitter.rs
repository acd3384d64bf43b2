//! Broken-lines trajectory fit.
//!
//! The track is described by a global curvature parameter and a transverse
//! offset from the reference line at every node. Measurements constrain the
//! offsets directly; every interior node adds a kink constraint built from
//! the jacobians of its two neighbouring steps, weighted by the scattering
//! weight of the node. The normal equations are a bordered band matrix
//! (border = curvature, band = offsets) of bandwidth 5.
//!
//! In a field-free setup the curvature decouples from all constraints and is
//! resolved to zero by the border pseudo-inverse.
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use crate::band::{BandInverse, BorderedBandMatrix};
use crate::error::FitError;
use crate::matching::StraightLine;
use crate::trajectory::{Measurement, Node, NodeKind, NodeSequence};
use nalgebra::{DMatrix, DVector, Matrix2, Matrix5, SMatrix, Vector2, Vector5};
use statrs::function::gamma::gamma_ur;
use teletrack_core::geometry::LayerId;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Bandwidth of the offset block: a kink couples three consecutive nodes.
const BANDWIDTH: usize = 5;

/// Floor for residual variances.
const MIN_VARIANCE: f64 = 1e-30;

type Matrix2x7 = SMatrix<f64, 2, 7>;
type Matrix7 = SMatrix<f64, 7, 7>;

/// Post-fit residual with its variance and pull, per coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FittedResidual {
    /// Measured minus fitted value.
    pub residual: Vector2<f64>,
    /// Variance of the residual.
    pub variance: Vector2<f64>,
    /// Residual divided by its standard deviation.
    pub pull: Vector2<f64>,
}

impl FittedResidual {
    fn new(residual: Vector2<f64>, variance: Vector2<f64>) -> Self {
        let variance = variance.map(|v| v.max(MIN_VARIANCE));
        Self {
            residual,
            variance,
            pull: residual.component_div(&variance.map(f64::sqrt)),
        }
    }
}

/// A measurement together with its post-fit residual.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FittedMeasurement {
    /// The measurement as built.
    pub input: Measurement,
    /// Post-fit residual.
    pub residual: FittedResidual,
}

/// Fit output at one node.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FittedNode {
    /// Layer or air scatterer.
    pub kind: NodeKind,
    /// Position along the beam (mm).
    pub z: f64,
    /// Fitted transverse position (mm).
    pub position: Vector2<f64>,
    /// Fitted outgoing slope (incoming at the last node).
    pub slope: Vector2<f64>,
    /// Correction to the reference, state order (q/p, x', y', x, y).
    pub correction: Vector5<f64>,
    /// Covariance of the correction.
    pub covariance: Matrix5<f64>,
    /// Measurement residual, if the node is measured.
    pub measurement: Option<FittedMeasurement>,
    /// Kink residual, if the node is an interior scatterer.
    pub kink: Option<FittedResidual>,
}

impl FittedNode {
    /// Layer id for detector nodes.
    #[must_use]
    pub fn layer(&self) -> Option<LayerId> {
        self.kind.layer()
    }
}

/// Result of one fit.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FitResult {
    /// Sum of weighted squared residuals, kinks included.
    pub chi2: f64,
    /// Degrees of freedom.
    pub ndf: i32,
    /// Upper-tail chi-square probability; 1 if `ndf <= 0`.
    pub probability: f64,
    /// Per-node output in path order.
    pub nodes: Vec<FittedNode>,
    /// Reference line of the trajectory.
    pub reference: StraightLine,
}

impl FitResult {
    /// chi2 / ndf, or infinity if `ndf <= 0`.
    #[must_use]
    pub fn chi2_ndf(&self) -> f64 {
        if self.ndf > 0 {
            self.chi2 / f64::from(self.ndf)
        } else {
            f64::INFINITY
        }
    }

    /// Nodes carrying a measurement.
    pub fn measured(&self) -> impl Iterator<Item = (&FittedNode, &FittedMeasurement)> {
        self.nodes
            .iter()
            .filter_map(|n| n.measurement.as_ref().map(|m| (n, m)))
    }
}

/// Upper-tail chi-square probability.
#[must_use]
pub fn chi2_probability(chi2: f64, ndf: i32) -> f64 {
    if ndf <= 0 {
        return 1.0;
    }
    if chi2.is_nan() {
        return 0.0;
    }
    if chi2 <= 0.0 {
        return 1.0;
    }
    if chi2.is_infinite() {
        return 0.0;
    }
    gamma_ur(f64::from(ndf) / 2.0, chi2 / 2.0)
}

/// Jacobian blocks of one step, state order (q/p, x', y', x, y).
struct Step {
    pos_pos: Matrix2<f64>,
    pos_curv: Vector2<f64>,
    slope_slope: Matrix2<f64>,
    slope_pos: Matrix2<f64>,
    slope_curv: Vector2<f64>,
    /// Inverse of d(position)/d(slope).
    w: Matrix2<f64>,
}

impl Step {
    fn new(jacobian: &Matrix5<f64>, node: usize) -> Result<Self, FitError> {
        let pos_slope: Matrix2<f64> = jacobian.fixed_view::<2, 2>(3, 1).into_owned();
        let w = pos_slope
            .try_inverse()
            .ok_or(FitError::Singular(offset_index(node)))?;
        Ok(Self {
            pos_pos: jacobian.fixed_view::<2, 2>(3, 3).into_owned(),
            pos_curv: jacobian.fixed_view::<2, 1>(3, 0).into_owned(),
            slope_slope: jacobian.fixed_view::<2, 2>(1, 1).into_owned(),
            slope_pos: jacobian.fixed_view::<2, 2>(1, 3).into_owned(),
            slope_curv: jacobian.fixed_view::<2, 1>(1, 0).into_owned(),
            w,
        })
    }
}

/// Global index of the x offset of a node.
fn offset_index(node: usize) -> usize {
    1 + 2 * node
}

/// Global indices `[curvature, a.x, a.y, b.x, b.y]` for two nodes.
fn pair_indices(a: usize, b: usize) -> [usize; 5] {
    [0, offset_index(a), offset_index(a) + 1, offset_index(b), offset_index(b) + 1]
}

/// Global indices of a kink at `node`.
fn kink_indices(node: usize) -> [usize; 7] {
    let p = offset_index(node - 1);
    [0, p, p + 1, p + 2, p + 3, p + 4, p + 5]
}

/// Derivatives of the kink at a node w.r.t. `[c, u_prev, u, u_next]`.
fn kink_derivatives(prev: &Step, next: &Step) -> Matrix2x7 {
    let mut d = Matrix2x7::zeros();
    let incoming = prev.slope_slope * prev.w;
    let dc = -next.w * next.pos_curv + incoming * prev.pos_curv - prev.slope_curv;
    let du_prev = incoming * prev.pos_pos - prev.slope_pos;
    let du = -next.w * next.pos_pos - incoming;
    d.fixed_view_mut::<2, 1>(0, 0).copy_from(&dc);
    d.fixed_view_mut::<2, 2>(0, 1).copy_from(&du_prev);
    d.fixed_view_mut::<2, 2>(0, 3).copy_from(&du);
    d.fixed_view_mut::<2, 2>(0, 5).copy_from(&next.w);
    d
}

/// Local transformation from `[c, u_a, u_b]` to the state at one end of a
/// step.
fn state_transform(step: &Step, at_end: bool) -> Matrix5<f64> {
    let mut t = Matrix5::zeros();
    t[(0, 0)] = 1.0;
    if at_end {
        let incoming = step.slope_slope * step.w;
        let dc = step.slope_curv - incoming * step.pos_curv;
        let du_a = step.slope_pos - incoming * step.pos_pos;
        t.fixed_view_mut::<2, 1>(1, 0).copy_from(&dc);
        t.fixed_view_mut::<2, 2>(1, 1).copy_from(&du_a);
        t.fixed_view_mut::<2, 2>(1, 3).copy_from(&incoming);
        t.fixed_view_mut::<2, 2>(3, 3).copy_from(&Matrix2::identity());
    } else {
        let dc = -step.w * step.pos_curv;
        let du_a = -step.w * step.pos_pos;
        t.fixed_view_mut::<2, 1>(1, 0).copy_from(&dc);
        t.fixed_view_mut::<2, 2>(1, 1).copy_from(&du_a);
        t.fixed_view_mut::<2, 2>(1, 3).copy_from(&step.w);
        t.fixed_view_mut::<2, 2>(3, 1).copy_from(&Matrix2::identity());
    }
    t
}

fn gather<const N: usize>(values: &DVector<f64>, indices: &[usize; N]) -> SMatrix<f64, N, 1> {
    SMatrix::<f64, N, 1>::from_fn(|i, _| values[indices[i]])
}

fn local_covariance(inverse: &BandInverse, indices: &[usize]) -> Matrix7 {
    let block = inverse.block(indices);
    Matrix7::from_iterator(block.iter().copied())
}

fn to_dense<const R: usize, const C: usize>(m: &SMatrix<f64, R, C>) -> DMatrix<f64> {
    DMatrix::from_iterator(R, C, m.iter().copied())
}

/// Broken-lines fitter.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fitter;

impl Fitter {
    /// Creates a fitter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Fits a node sequence.
    ///
    /// # Errors
    /// Returns [`FitError::Underdetermined`] for fewer than two measured
    /// nodes and [`FitError::Singular`] / [`FitError::NotPositiveDefinite`]
    /// if the normal equations cannot be solved.
    pub fn fit(&self, sequence: NodeSequence) -> Result<FitResult, FitError> {
        let measurements = sequence.measurement_count();
        if measurements < 2 {
            return Err(FitError::Underdetermined { measurements });
        }
        let (nodes, reference) = sequence.into_parts();
        let count = nodes.len();

        // steps[k] propagates node k - 1 to node k.
        let steps = nodes
            .iter()
            .enumerate()
            .skip(1)
            .map(|(k, node)| Step::new(&node.jacobian, k))
            .collect::<Result<Vec<_>, _>>()?;
        let step_into = |k: usize| &steps[k - 1];

        let mut matrix = BorderedBandMatrix::new(1, 2 * count, BANDWIDTH);
        let mut rhs = DVector::zeros(1 + 2 * count);
        let mut kinks = Vec::new();

        for (k, node) in nodes.iter().enumerate() {
            if let Some(m) = &node.measurement {
                let i = offset_index(k);
                matrix.add_block(&[i, i + 1], &to_dense(&m.precision));
                let b = m.precision * m.residual;
                rhs[i] += b.x;
                rhs[i + 1] += b.y;
            }
            if k > 0 && k + 1 < count && node.scattering_weight > 0.0 {
                let d = kink_derivatives(step_into(k), step_into(k + 1));
                let normal = d.transpose() * d * node.scattering_weight;
                matrix.add_block(&kink_indices(k), &to_dense(&normal));
                kinks.push((k, d));
            }
        }

        let (solution, inverse) = matrix.solve(&rhs)?;

        let mut chi2 = 0.0;
        let mut fitted: Vec<FittedNode> = nodes
            .iter()
            .enumerate()
            .map(|(k, node)| fit_node(k, node, count, &steps, &solution, &inverse, reference))
            .collect();

        for node in &fitted {
            if let Some(m) = &node.measurement {
                let e = m.residual.residual;
                chi2 += e.dot(&(m.input.precision * e));
            }
        }
        for (k, d) in kinks {
            let weight = nodes[k].scattering_weight;
            let indices = kink_indices(k);
            let beta = d * gather(&solution, &indices);
            let cov = d * local_covariance(&inverse, &indices) * d.transpose();
            let variance = Vector2::new(1.0 / weight - cov[(0, 0)], 1.0 / weight - cov[(1, 1)]);
            chi2 += weight * beta.norm_squared();
            fitted[k].kink = Some(FittedResidual::new(-beta, variance));
        }

        let constraints = 2 * measurements + 2 * fitted.iter().filter(|n| n.kink.is_some()).count();
        let ndf = constraints as i32 - (2 * count as i32 + 1);

        Ok(FitResult {
            chi2,
            ndf,
            probability: chi2_probability(chi2, ndf),
            nodes: fitted,
            reference,
        })
    }
}

fn fit_node(
    k: usize,
    node: &Node,
    count: usize,
    steps: &[Step],
    solution: &DVector<f64>,
    inverse: &BandInverse,
    reference: StraightLine,
) -> FittedNode {
    let at_end = k + 1 == count;
    let (a, b, step) = if at_end {
        (k - 1, k, &steps[k - 1])
    } else {
        (k, k + 1, &steps[k])
    };
    let indices = pair_indices(a, b);
    let local = gather(solution, &indices);
    let curvature = local[0];
    let u_a = Vector2::new(local[1], local[2]);
    let u_b = Vector2::new(local[3], local[4]);

    let (offset, slope) = if at_end {
        let incoming = step.slope_slope * step.w;
        let s = step.slope_pos * u_a
            + incoming * (u_b - step.pos_pos * u_a - step.pos_curv * curvature)
            + step.slope_curv * curvature;
        (u_b, s)
    } else {
        let s = step.w * (u_b - step.pos_pos * u_a - step.pos_curv * curvature);
        (u_a, s)
    };

    let t = state_transform(step, at_end);
    let block = inverse.block(&indices);
    let local_cov = Matrix5::from_iterator(block.iter().copied());
    let covariance = t * local_cov * t.transpose();

    let measurement = node.measurement.map(|input| {
        let i = if at_end { 3 } else { 1 };
        let cov_u = local_cov.fixed_view::<2, 2>(i, i).into_owned();
        let meas_cov = input
            .precision
            .try_inverse()
            .unwrap_or_else(Matrix2::zeros);
        let variance = Vector2::new(
            meas_cov[(0, 0)] - cov_u[(0, 0)],
            meas_cov[(1, 1)] - cov_u[(1, 1)],
        );
        FittedMeasurement {
            input,
            residual: FittedResidual::new(input.residual - offset, variance),
        }
    });

    FittedNode {
        kind: node.kind,
        z: node.z,
        position: reference.position_at(node.z) + offset,
        slope: reference.slope + slope,
        correction: Vector5::new(curvature, slope.x, slope.y, offset.x, offset.y),
        covariance,
        measurement,
        kink: None,
    }
}
