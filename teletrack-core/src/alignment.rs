//! Alignment constants and the alignment policy.
//!
//! Constants describe the rigid-body correction of each sensor and are kept in
//! a plain map keyed by layer id. The policy decides which layers and which
//! degrees of freedom take part in the alignment.

use crate::geometry::{Geometry, LayerId};
use nalgebra::{Point2, Point3, Rotation3, Vector2, Vector3};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Rigid-body alignment degree of freedom of a planar sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Dof {
    ShiftX,
    ShiftY,
    ShiftZ,
    RotX,
    RotY,
    RotZ,
}

impl Dof {
    /// All degrees of freedom in label order.
    pub const ALL: [Dof; 6] = [
        Dof::ShiftX,
        Dof::ShiftY,
        Dof::ShiftZ,
        Dof::RotX,
        Dof::RotY,
        Dof::RotZ,
    ];

    /// Position within [`Dof::ALL`].
    #[must_use]
    pub fn index(self) -> u8 {
        match self {
            Dof::ShiftX => 0,
            Dof::ShiftY => 1,
            Dof::ShiftZ => 2,
            Dof::RotX => 3,
            Dof::RotY => 4,
            Dof::RotZ => 5,
        }
    }

    /// Global parameter label handed to the alignment solver.
    ///
    /// Labels are `layer * 10 + index + 1`, so they are always positive and
    /// unique per layer and degree of freedom for every layer id up to
    /// [`MAX_LAYER_ID`](crate::geometry::MAX_LAYER_ID), which
    /// [`Geometry::new`] enforces.
    #[must_use]
    pub fn label(self, layer: LayerId) -> i32 {
        let label = i64::from(layer) * 10 + i64::from(self.index()) + 1;
        i32::try_from(label).unwrap_or(i32::MAX)
    }
}

/// Rigid-body correction of one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AlignmentConstant {
    /// Translation (mm).
    pub shift: Vector3<f64>,
    /// Rotation angles about x, y and z (rad).
    pub rotation: Vector3<f64>,
}

impl AlignmentConstant {
    /// A pure translation.
    #[must_use]
    pub fn from_shift(x: f64, y: f64, z: f64) -> Self {
        Self {
            shift: Vector3::new(x, y, z),
            rotation: Vector3::zeros(),
        }
    }

    /// Sets the rotation angles.
    #[must_use]
    pub fn with_rotation(mut self, alpha: f64, beta: f64, gamma: f64) -> Self {
        self.rotation = Vector3::new(alpha, beta, gamma);
        self
    }

    /// Transforms a local sensor position into the global frame of a sensor
    /// nominally placed at `z`.
    #[must_use]
    pub fn local_to_global(&self, local: Point2<f64>, z: f64) -> Point3<f64> {
        let rotated = self.rotation_matrix() * Point3::new(local.x, local.y, 0.0);
        Point3::new(
            rotated.x + self.shift.x,
            rotated.y + self.shift.y,
            rotated.z + z + self.shift.z,
        )
    }

    /// Rotates a displacement in the global xy plane into the sensor frame.
    #[must_use]
    pub fn global_to_local_offset(&self, offset: Vector2<f64>) -> Vector2<f64> {
        let local = self.rotation_matrix().inverse() * Vector3::new(offset.x, offset.y, 0.0);
        Vector2::new(local.x, local.y)
    }

    fn rotation_matrix(&self) -> Rotation3<f64> {
        Rotation3::from_euler_angles(self.rotation.x, self.rotation.y, self.rotation.z)
    }
}

/// Alignment constants of all sensors; missing layers are nominal.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AlignmentConstants {
    constants: BTreeMap<LayerId, AlignmentConstant>,
}

impl AlignmentConstants {
    /// Creates an empty (nominal) set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the constant of a layer.
    pub fn insert(&mut self, layer: LayerId, constant: AlignmentConstant) {
        self.constants.insert(layer, constant);
    }

    /// Constant of a layer, nominal if none is set.
    #[must_use]
    pub fn get(&self, layer: LayerId) -> AlignmentConstant {
        self.constants.get(&layer).copied().unwrap_or_default()
    }

    /// Number of layers with an explicit constant.
    #[must_use]
    pub fn len(&self) -> usize {
        self.constants.len()
    }

    /// Returns true if every layer is nominal.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    /// Drops constants of layers unknown to the geometry.
    pub fn retain_known(&mut self, geometry: &Geometry) {
        self.constants.retain(|&layer, _| {
            let known = geometry.contains(layer);
            if !known {
                warn!(layer, "alignment constant for unknown layer ignored");
            }
            known
        });
    }

    /// Iterates over explicit constants.
    pub fn iter(&self) -> impl Iterator<Item = (LayerId, &AlignmentConstant)> {
        self.constants.iter().map(|(&layer, c)| (layer, c))
    }
}

impl FromIterator<(LayerId, AlignmentConstant)> for AlignmentConstants {
    fn from_iter<I: IntoIterator<Item = (LayerId, AlignmentConstant)>>(iter: I) -> Self {
        Self {
            constants: iter.into_iter().collect(),
        }
    }
}

/// Which layers are measured and which degrees of freedom are free.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AlignmentPolicy {
    /// Layers that contribute neither measurements nor alignment rows.
    pub excluded: BTreeSet<LayerId>,
    /// Degrees of freedom fixed per layer.
    pub fixed: BTreeMap<LayerId, BTreeSet<Dof>>,
    /// Degrees of freedom fixed on every layer.
    pub fixed_everywhere: BTreeSet<Dof>,
}

impl Default for AlignmentPolicy {
    fn default() -> Self {
        Self {
            excluded: BTreeSet::new(),
            fixed: BTreeMap::new(),
            // Out-of-plane degrees of freedom are weakly constrained by a
            // near-perpendicular beam.
            fixed_everywhere: [Dof::ShiftZ, Dof::RotX, Dof::RotY].into_iter().collect(),
        }
    }
}

impl AlignmentPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy with every degree of freedom free.
    #[must_use]
    pub fn all_free() -> Self {
        Self {
            fixed_everywhere: BTreeSet::new(),
            ..Self::default()
        }
    }

    /// Excludes a layer.
    #[must_use]
    pub fn with_excluded(mut self, layer: LayerId) -> Self {
        self.excluded.insert(layer);
        self
    }

    /// Fixes one degree of freedom of a layer.
    #[must_use]
    pub fn with_fixed(mut self, layer: LayerId, dof: Dof) -> Self {
        self.fixed.entry(layer).or_default().insert(dof);
        self
    }

    /// Fixes every degree of freedom of a layer (reference plane).
    #[must_use]
    pub fn with_reference(mut self, layer: LayerId) -> Self {
        self.fixed.insert(layer, Dof::ALL.into_iter().collect());
        self
    }

    /// Returns true if the layer is excluded.
    #[must_use]
    pub fn is_excluded(&self, layer: LayerId) -> bool {
        self.excluded.contains(&layer)
    }

    /// Returns true if the degree of freedom is fixed on the layer.
    #[must_use]
    pub fn is_fixed(&self, layer: LayerId, dof: Dof) -> bool {
        self.fixed_everywhere.contains(&dof)
            || self.fixed.get(&layer).is_some_and(|set| set.contains(&dof))
    }

    /// Free degrees of freedom of a layer, in label order.
    pub fn free_dofs(&self, layer: LayerId) -> impl Iterator<Item = Dof> + '_ {
        Dof::ALL
            .into_iter()
            .filter(move |&dof| !self.is_fixed(layer, dof))
    }

    /// Drops entries that refer to layers unknown to the geometry.
    pub fn retain_known(&mut self, geometry: &Geometry) {
        self.excluded.retain(|&layer| {
            let known = geometry.contains(layer);
            if !known {
                warn!(layer, "exclusion of unknown layer ignored");
            }
            known
        });
        self.fixed.retain(|&layer, _| {
            let known = geometry.contains(layer);
            if !known {
                warn!(layer, "fixed parameters of unknown layer ignored");
            }
            known
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Layer, ResolutionTable, MAX_LAYER_ID};
    use approx::assert_relative_eq;

    #[test]
    fn test_labels_unique() {
        let labels: BTreeSet<i32> = (0..8)
            .flat_map(|layer| Dof::ALL.into_iter().map(move |dof| dof.label(layer)))
            .collect();
        assert_eq!(labels.len(), 48);
        assert_eq!(Dof::ShiftX.label(0), 1);
        assert_eq!(Dof::RotZ.label(3), 36);
    }

    #[test]
    fn test_largest_layer_labels_fit() {
        assert_eq!(Dof::RotZ.label(MAX_LAYER_ID), 2_147_483_646);
        assert!(Dof::RotZ.label(MAX_LAYER_ID) < i32::MAX);
    }

    #[test]
    fn test_global_offset_to_local() {
        let constant = AlignmentConstant::default().with_rotation(0.0, 0.0, std::f64::consts::FRAC_PI_2);
        let local = constant.global_to_local_offset(Vector2::new(0.5, 0.0));
        assert_relative_eq!(local.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(local.y, -0.5, epsilon = 1e-12);
        let nominal = AlignmentConstant::from_shift(1.0, 2.0, 3.0);
        assert_eq!(nominal.global_to_local_offset(Vector2::new(0.5, 0.25)), Vector2::new(0.5, 0.25));
    }

    #[test]
    fn test_policy_free_dofs() {
        let policy = AlignmentPolicy::new().with_fixed(2, Dof::ShiftY).with_reference(0);
        let free: Vec<Dof> = policy.free_dofs(2).collect();
        assert_eq!(free, vec![Dof::ShiftX, Dof::RotZ]);
        assert_eq!(policy.free_dofs(0).count(), 0);
        assert_eq!(policy.free_dofs(1).count(), 3);
    }

    #[test]
    fn test_rotation_about_z() {
        let constant = AlignmentConstant::default().with_rotation(0.0, 0.0, std::f64::consts::FRAC_PI_2);
        let global = constant.local_to_global(Point2::new(1.0, 0.0), 10.0);
        assert_relative_eq!(global.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(global.y, 1.0, epsilon = 1e-12);
        assert_relative_eq!(global.z, 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_retain_known() {
        let layers = vec![Layer::new(0, 0.0, 1e-3), Layer::new(1, 10.0, 1e-3)];
        let mut tables = BTreeMap::new();
        tables.insert(0, ResolutionTable::uniform(4e-3));
        let geometry = Geometry::new(layers, tables).unwrap();

        let mut constants: AlignmentConstants = [
            (0, AlignmentConstant::from_shift(0.1, 0.0, 0.0)),
            (7, AlignmentConstant::from_shift(0.2, 0.0, 0.0)),
        ]
        .into_iter()
        .collect();
        constants.retain_known(&geometry);
        assert_eq!(constants.len(), 1);
        assert_eq!(constants.get(7), AlignmentConstant::default());

        let mut policy = AlignmentPolicy::new().with_excluded(9).with_reference(8);
        policy.retain_known(&geometry);
        assert!(policy.excluded.is_empty());
        assert!(policy.fixed.is_empty());
    }
}
