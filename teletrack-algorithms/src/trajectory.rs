//! Node sequences for the broken-lines fit.
//!
//! A trajectory has one node per geometry layer plus two thin air scatterers
//! in every gap. Nodes carry the propagation jacobian from their predecessor,
//! an optional measurement and the scattering weight of the material they
//! stand for.

use crate::matching::{StraightLine, TrackCandidate};
use crate::scattering::{ScatteringModel, AIR_SCATTERER_POSITIONS};
use nalgebra::{Matrix2, Matrix5, Point2, Vector2};
use teletrack_core::alignment::AlignmentPolicy;
use teletrack_core::geometry::{Geometry, LayerId};
use teletrack_core::hit::{HitId, HitTable};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// What a node stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NodeKind {
    /// A detector layer.
    Layer(LayerId),
    /// An air scatterer.
    Air {
        /// z-order index of the layer opening the gap.
        gap: usize,
        /// 0 for the upstream point, 1 for the downstream one.
        slot: usize,
    },
}

impl NodeKind {
    /// Layer id for detector nodes.
    #[must_use]
    pub fn layer(self) -> Option<LayerId> {
        match self {
            NodeKind::Layer(id) => Some(id),
            NodeKind::Air { .. } => None,
        }
    }
}

/// A 2-D measurement attached to a node.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Measurement {
    /// Hit id within the event's hit table.
    pub hit: HitId,
    /// Hit minus reference line (mm).
    pub residual: Vector2<f64>,
    /// Inverse covariance.
    pub precision: Matrix2<f64>,
    /// Local sensor position of the hit (mm).
    pub local: Point2<f64>,
}

/// One point of the trajectory.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Node {
    /// Layer or air scatterer.
    pub kind: NodeKind,
    /// Position along the beam (mm).
    pub z: f64,
    /// Path length from the previous node (mm).
    pub step: f64,
    /// Propagation from the previous node, state order (q/p, x', y', x, y).
    pub jacobian: Matrix5<f64>,
    /// Measurement, if the layer was hit and is not excluded.
    pub measurement: Option<Measurement>,
    /// Inverse variance of the kink angle.
    pub scattering_weight: f64,
}

/// Jacobian of straight-line propagation over `step`.
#[must_use]
pub fn straight_jacobian(step: f64) -> Matrix5<f64> {
    let mut jacobian = Matrix5::identity();
    jacobian[(3, 1)] = step;
    jacobian[(4, 2)] = step;
    jacobian
}

/// Nodes of one trajectory, ordered by path length.
///
/// The fitter consumes the sequence, so each trajectory is fitted once.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeSequence {
    nodes: Vec<Node>,
    reference: StraightLine,
}

impl NodeSequence {
    /// Wraps a node list. Nodes must be ordered by z.
    #[must_use]
    pub fn new(nodes: Vec<Node>, reference: StraightLine) -> Self {
        Self { nodes, reference }
    }

    /// The nodes.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Reference line the measurements are expressed against.
    #[must_use]
    pub fn reference(&self) -> StraightLine {
        self.reference
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if there are no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of nodes with a measurement.
    #[must_use]
    pub fn measurement_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.measurement.is_some()).count()
    }

    pub(crate) fn into_parts(self) -> (Vec<Node>, StraightLine) {
        (self.nodes, self.reference)
    }
}

/// Builds node sequences from track candidates.
#[derive(Debug, Clone, Copy)]
pub struct TrajectoryBuilder<'a> {
    geometry: &'a Geometry,
    scattering: &'a ScatteringModel,
    policy: &'a AlignmentPolicy,
}

impl<'a> TrajectoryBuilder<'a> {
    /// Creates a builder over run-wide read-only state.
    #[must_use]
    pub fn new(
        geometry: &'a Geometry,
        scattering: &'a ScatteringModel,
        policy: &'a AlignmentPolicy,
    ) -> Self {
        Self {
            geometry,
            scattering,
            policy,
        }
    }

    /// Builds the node sequence of `candidate`.
    ///
    /// Every geometry layer becomes a node; it carries a measurement when the
    /// candidate has a hit there and the layer is not excluded.
    #[must_use]
    pub fn build(&self, candidate: &TrackCandidate, hits: &HitTable) -> NodeSequence {
        let reference = candidate.reference_line();
        let layers = self.geometry.layers();
        let mut nodes = Vec::with_capacity(3 * layers.len());
        let mut previous_z: Option<f64> = None;

        for (index, layer) in layers.iter().enumerate() {
            let step = previous_z.map_or(0.0, |z| layer.z - z);
            let measurement = candidate
                .hit_on(layer.id)
                .filter(|_| !self.policy.is_excluded(layer.id))
                .and_then(|id| hits.get(id).map(|hit| (id, hit)))
                .map(|(id, hit)| Measurement {
                    hit: id,
                    residual: hit.xy() - reference.position_at(hit.z()),
                    precision: Matrix2::from_diagonal(&Vector2::new(
                        1.0 / (hit.resolution.x * hit.resolution.x),
                        1.0 / (hit.resolution.y * hit.resolution.y),
                    )),
                    local: hit.local,
                });
            let weight = self
                .scattering
                .layer(layer.id)
                .map_or_else(|| self.scattering.weight(layer.radiation_length), |s| s.weight);

            nodes.push(Node {
                kind: NodeKind::Layer(layer.id),
                z: layer.z,
                step,
                jacobian: straight_jacobian(step),
                measurement,
                scattering_weight: weight,
            });
            previous_z = Some(layer.z);

            let (Some(next), Some(gap)) = (layers.get(index + 1), self.scattering.gap(index))
            else {
                continue;
            };
            for (slot, fraction) in AIR_SCATTERER_POSITIONS.iter().enumerate() {
                let z = layer.z + fraction * (next.z - layer.z);
                let step = previous_z.map_or(0.0, |p| z - p);
                nodes.push(Node {
                    kind: NodeKind::Air { gap: index, slot },
                    z,
                    step,
                    jacobian: straight_jacobian(step),
                    measurement: None,
                    scattering_weight: gap.weight,
                });
                previous_z = Some(z);
            }
        }

        NodeSequence::new(nodes, reference)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]
    use super::*;
    use crate::triplet::TripletFinder;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;
    use teletrack_core::config::LayerTriple;
    use teletrack_core::geometry::{Layer, ResolutionTable};
    use teletrack_core::hit::HitRecord;

    fn geometry() -> Geometry {
        let z = [0.0, 150.0, 300.0, 600.0, 750.0, 900.0];
        let layers = z.iter().zip(0..).map(|(&z, id)| Layer::new(id, z, 5.5e-4)).collect();
        let mut tables = BTreeMap::new();
        tables.insert(0, ResolutionTable::uniform(4e-3));
        Geometry::new(layers, tables).unwrap()
    }

    fn candidate(hits: &HitTable) -> TrackCandidate {
        let finder = TripletFinder::new(0.1, 0.01);
        let up = finder.find(hits, LayerTriple::new(0, 1, 2));
        let down = finder.find(hits, LayerTriple::new(3, 4, 5));
        TrackCandidate::new(up[0], down[0], 450.0)
    }

    fn table(geometry: &Geometry) -> HitTable {
        let records: Vec<HitRecord> = geometry
            .layers()
            .iter()
            .map(|l| HitRecord::at(l.id, 1e-3 * l.z, -5e-4 * l.z, l.z))
            .collect();
        HitTable::from_records(0, &records, geometry)
    }

    #[test]
    fn test_node_layout() {
        let geometry = geometry();
        let hits = table(&geometry);
        let scattering = ScatteringModel::new(&geometry, 5.0, 1.0);
        let policy = AlignmentPolicy::new();
        let nodes = TrajectoryBuilder::new(&geometry, &scattering, &policy).build(&candidate(&hits), &hits);

        // 6 layers + 2 air points in each of 5 gaps.
        assert_eq!(nodes.len(), 16);
        assert_eq!(nodes.measurement_count(), 6);
        assert_eq!(nodes.nodes()[0].kind, NodeKind::Layer(0));
        assert_eq!(nodes.nodes()[15].kind, NodeKind::Layer(5));
        assert_eq!(nodes.nodes()[1].kind, NodeKind::Air { gap: 0, slot: 0 });
        assert_relative_eq!(nodes.nodes()[1].z, 31.5);
        assert_relative_eq!(nodes.nodes()[2].z, 118.5);

        let z: Vec<f64> = nodes.nodes().iter().map(|n| n.z).collect();
        assert!(z.windows(2).all(|w| w[0] < w[1]));
        for node in &nodes.nodes()[1..] {
            assert!(node.step > 0.0);
            assert_eq!(node.jacobian[(3, 1)], node.step);
            assert!(node.scattering_weight > 0.0);
        }
        assert_eq!(nodes.nodes()[0].jacobian, Matrix5::identity());
    }

    #[test]
    fn test_residuals_vanish_on_reference() {
        let geometry = geometry();
        let hits = table(&geometry);
        let scattering = ScatteringModel::new(&geometry, 5.0, 1.0);
        let policy = AlignmentPolicy::new();
        let nodes = TrajectoryBuilder::new(&geometry, &scattering, &policy).build(&candidate(&hits), &hits);
        for m in nodes.nodes().iter().filter_map(|n| n.measurement) {
            assert_relative_eq!(m.residual.norm(), 0.0, epsilon = 1e-12);
            assert_relative_eq!(m.precision[(0, 0)], 1.0 / 16e-6, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_excluded_layer_keeps_scatterer() {
        let geometry = geometry();
        let hits = table(&geometry);
        let scattering = ScatteringModel::new(&geometry, 5.0, 1.0);
        let policy = AlignmentPolicy::new().with_excluded(2);
        let nodes = TrajectoryBuilder::new(&geometry, &scattering, &policy).build(&candidate(&hits), &hits);
        assert_eq!(nodes.len(), 16);
        assert_eq!(nodes.measurement_count(), 5);
        let excluded = nodes
            .nodes()
            .iter()
            .find(|n| n.kind == NodeKind::Layer(2))
            .unwrap();
        assert!(excluded.measurement.is_none());
        assert!(excluded.scattering_weight > 0.0);
    }
}
