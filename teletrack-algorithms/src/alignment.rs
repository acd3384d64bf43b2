//! Alignment input from fitted tracks.
//!
//! Every measured, non-excluded layer of an accepted track yields one block
//! per axis: the post-fit residual, its measurement precision and the
//! derivatives of the residual with respect to each free rigid-body
//! parameter of the layer.

use crate::fitter::{FitResult, FittedMeasurement, FittedNode};
use nalgebra::Vector2;
use std::sync::Mutex;
use teletrack_core::alignment::{AlignmentConstants, AlignmentPolicy, Dof};
use teletrack_core::geometry::LayerId;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Measured coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Axis {
    /// Along x.
    X,
    /// Along y.
    Y,
}

/// Residual and derivatives of one measured coordinate on one layer.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MeasurementBlock {
    /// Layer the measurement belongs to.
    pub layer: LayerId,
    /// Measured coordinate.
    pub axis: Axis,
    /// Global parameter labels, one per derivative.
    pub labels: Vec<i32>,
    /// d(residual)/d(parameter).
    pub derivatives: Vec<f64>,
    /// Measured minus fitted (mm).
    pub residual: f64,
    /// Inverse variance of the measurement.
    pub precision: f64,
}

impl MeasurementBlock {
    /// Measurement sigma (mm).
    #[must_use]
    pub fn sigma(&self) -> f64 {
        1.0 / self.precision.sqrt()
    }
}

/// Alignment input of one accepted track, blocks in path order.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AlignmentRecord {
    /// Event the track belongs to.
    pub event: u64,
    /// Track chi2.
    pub chi2: f64,
    /// Track degrees of freedom.
    pub ndf: i32,
    /// Blocks in path order.
    pub blocks: Vec<MeasurementBlock>,
}

impl AlignmentRecord {
    /// Returns true if the record carries no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Receiver of alignment records.
///
/// `emit` is called once per accepted track, possibly from several threads;
/// implementations write each record as a unit.
pub trait RecordSink: Sync {
    /// Stores one record.
    ///
    /// # Errors
    /// Returns an error if the record could not be written.
    fn emit(&self, record: &AlignmentRecord) -> std::io::Result<()>;
}

impl RecordSink for Mutex<Vec<AlignmentRecord>> {
    fn emit(&self, record: &AlignmentRecord) -> std::io::Result<()> {
        self.lock()
            .map_err(|_| std::io::Error::other("record buffer poisoned"))?
            .push(record.clone());
        Ok(())
    }
}

/// d(dx), d(dy) of a rigid-body parameter at local position `(x, y)` for a
/// track with slopes `(tx, ty)`.
#[must_use]
pub fn residual_derivatives(dof: Dof, x: f64, y: f64, tx: f64, ty: f64) -> (f64, f64) {
    match dof {
        Dof::ShiftX => (1.0, 0.0),
        Dof::ShiftY => (0.0, 1.0),
        Dof::ShiftZ => (tx, ty),
        Dof::RotX => (y * tx, y * ty),
        Dof::RotY => (-x * tx, -x * ty),
        Dof::RotZ => (-y, x),
    }
}

/// Turns fit results into alignment records.
#[derive(Debug, Clone, Copy)]
pub struct AlignmentAccumulator<'a> {
    policy: &'a AlignmentPolicy,
    alignment: Option<&'a AlignmentConstants>,
}

impl<'a> AlignmentAccumulator<'a> {
    /// Creates an accumulator for a policy, with nominally placed sensors.
    #[must_use]
    pub fn new(policy: &'a AlignmentPolicy) -> Self {
        Self {
            policy,
            alignment: None,
        }
    }

    /// Uses the sensor orientations the hits were placed with.
    #[must_use]
    pub fn with_alignment(mut self, alignment: &'a AlignmentConstants) -> Self {
        self.alignment = Some(alignment);
        self
    }

    /// Builds the record of one fitted track.
    ///
    /// Excluded layers and layers without free parameters contribute no
    /// blocks. The acceptance selection happens before this call.
    #[must_use]
    pub fn accumulate(&self, event: u64, fit: &FitResult) -> AlignmentRecord {
        let mut blocks = Vec::new();
        for (node, measurement) in fit.measured() {
            let Some(layer) = node.layer() else {
                continue;
            };
            if self.policy.is_excluded(layer) {
                continue;
            }
            let dofs: Vec<Dof> = self.policy.free_dofs(layer).collect();
            if dofs.is_empty() {
                continue;
            }
            let residual = measurement.residual.residual;
            let offset = self
                .alignment
                .map_or(residual, |a| a.get(layer).global_to_local_offset(residual));
            let [x_block, y_block] = layer_blocks(layer, &dofs, node, measurement, offset);
            blocks.push(x_block);
            blocks.push(y_block);
        }
        AlignmentRecord {
            event,
            chi2: fit.chi2,
            ndf: fit.ndf,
            blocks,
        }
    }
}

fn layer_blocks(
    layer: LayerId,
    dofs: &[Dof],
    node: &FittedNode,
    measurement: &FittedMeasurement,
    local_offset: Vector2<f64>,
) -> [MeasurementBlock; 2] {
    let residual = measurement.residual.residual;
    // Fitted track position in the local frame.
    let x = measurement.input.local.x - local_offset.x;
    let y = measurement.input.local.y - local_offset.y;
    let (tx, ty) = (node.slope.x, node.slope.y);

    let labels: Vec<i32> = dofs.iter().map(|dof| dof.label(layer)).collect();
    let (dx, dy): (Vec<f64>, Vec<f64>) = dofs
        .iter()
        .map(|&dof| residual_derivatives(dof, x, y, tx, ty))
        .unzip();

    let precision = measurement.input.precision;
    [
        MeasurementBlock {
            layer,
            axis: Axis::X,
            labels: labels.clone(),
            derivatives: dx,
            residual: residual.x,
            precision: precision[(0, 0)],
        },
        MeasurementBlock {
            layer,
            axis: Axis::Y,
            labels,
            derivatives: dy,
            residual: residual.y,
            precision: precision[(1, 1)],
        },
    ]
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]
    use super::*;
    use crate::fitter::FittedResidual;
    use crate::matching::StraightLine;
    use crate::trajectory::{Measurement, NodeKind};
    use approx::assert_abs_diff_eq;
    use teletrack_core::alignment::AlignmentConstant;
    use nalgebra::{Matrix2, Matrix5, Point2, Point3, Vector5};

    fn node(kind: NodeKind, local: Point2<f64>, residual: Vector2<f64>) -> FittedNode {
        FittedNode {
            kind,
            z: 0.0,
            position: Vector2::zeros(),
            slope: Vector2::new(0.01, -0.02),
            correction: Vector5::zeros(),
            covariance: Matrix5::zeros(),
            measurement: Some(FittedMeasurement {
                input: Measurement {
                    hit: 0,
                    residual,
                    precision: Matrix2::from_diagonal(&Vector2::new(4.0, 16.0)),
                    local,
                },
                residual: FittedResidual {
                    residual,
                    variance: Vector2::new(1.0, 1.0),
                    pull: residual,
                },
            }),
            kink: None,
        }
    }

    fn fit(nodes: Vec<FittedNode>) -> FitResult {
        FitResult {
            chi2: 1.0,
            ndf: 7,
            probability: 0.5,
            nodes,
            reference: StraightLine {
                origin: Point3::origin(),
                slope: Vector2::zeros(),
            },
        }
    }

    #[test]
    fn test_derivative_table() {
        assert_eq!(residual_derivatives(Dof::ShiftX, 2.0, 3.0, 0.1, 0.2), (1.0, 0.0));
        assert_eq!(residual_derivatives(Dof::ShiftZ, 2.0, 3.0, 0.1, 0.2), (0.1, 0.2));
        assert_eq!(residual_derivatives(Dof::RotZ, 2.0, 3.0, 0.1, 0.2), (-3.0, 2.0));
        let (dx, dy) = residual_derivatives(Dof::RotY, 2.0, 3.0, 0.1, 0.2);
        assert!((dx + 0.2).abs() < 1e-15 && (dy + 0.4).abs() < 1e-15);
    }

    #[test]
    fn test_blocks_use_fitted_local_position() {
        let policy = AlignmentPolicy::new();
        let nodes = vec![node(
            NodeKind::Layer(3),
            Point2::new(1.5, -0.5),
            Vector2::new(0.5, 0.5),
        )];
        let record = AlignmentAccumulator::new(&policy).accumulate(11, &fit(nodes));

        assert_eq!(record.event, 11);
        assert_eq!(record.blocks.len(), 2);
        let x = &record.blocks[0];
        let y = &record.blocks[1];
        assert_eq!(x.axis, Axis::X);
        assert_eq!(x.labels, vec![31, 32, 36]);
        // Fitted local position is (1.0, -1.0).
        assert_eq!(x.derivatives, vec![1.0, 0.0, 1.0]);
        assert_eq!(y.derivatives, vec![0.0, 1.0, 1.0]);
        assert_eq!(x.precision, 4.0);
        assert_eq!(y.sigma(), 0.25);
    }

    #[test]
    fn test_rotated_sensor_residual_in_local_frame() {
        let policy = AlignmentPolicy::new();
        let alignment: AlignmentConstants = [(
            3,
            AlignmentConstant::default().with_rotation(0.0, 0.0, std::f64::consts::FRAC_PI_2),
        )]
        .into_iter()
        .collect();
        let nodes = vec![node(
            NodeKind::Layer(3),
            Point2::new(1.5, -0.5),
            Vector2::new(0.5, 0.0),
        )];
        let record = AlignmentAccumulator::new(&policy)
            .with_alignment(&alignment)
            .accumulate(0, &fit(nodes));

        // Global residual (0.5, 0) is (0, -0.5) on the sensor, so the fitted
        // local position is (1.5, 0).
        let x = &record.blocks[0];
        let y = &record.blocks[1];
        assert_eq!(x.residual, 0.5);
        assert_abs_diff_eq!(x.derivatives[2], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(y.derivatives[2], 1.5, epsilon = 1e-12);

        let nominal = AlignmentAccumulator::new(&policy).accumulate(0, &fit(vec![node(
            NodeKind::Layer(3),
            Point2::new(1.5, -0.5),
            Vector2::new(0.5, 0.0),
        )]));
        assert_abs_diff_eq!(nominal.blocks[0].derivatives[2], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(nominal.blocks[1].derivatives[2], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_excluded_and_fixed_layers_skipped() {
        let policy = AlignmentPolicy::new().with_excluded(1).with_reference(2);
        let nodes = vec![
            node(NodeKind::Layer(1), Point2::origin(), Vector2::zeros()),
            node(NodeKind::Layer(2), Point2::origin(), Vector2::zeros()),
            node(NodeKind::Air { gap: 2, slot: 0 }, Point2::origin(), Vector2::zeros()),
            node(NodeKind::Layer(4), Point2::origin(), Vector2::zeros()),
        ];
        let record = AlignmentAccumulator::new(&policy).accumulate(0, &fit(nodes));
        assert_eq!(record.blocks.len(), 2);
        assert!(record.blocks.iter().all(|b| b.layer == 4));
    }

    #[test]
    fn test_mutex_sink() {
        let sink = Mutex::new(Vec::new());
        let record = AlignmentRecord {
            event: 1,
            chi2: 0.0,
            ndf: 1,
            blocks: Vec::new(),
        };
        sink.emit(&record).unwrap();
        sink.emit(&record).unwrap();
        assert_eq!(sink.lock().unwrap().len(), 2);
    }
}
