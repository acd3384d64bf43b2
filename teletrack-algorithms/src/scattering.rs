//! Multiple-scattering weights from the Highland formula.
//!
//! The weights are derived once per run from the geometry and beam energy and
//! are shared read-only by all events.

use teletrack_core::geometry::{Geometry, LayerId};

/// Radiation length of air (mm).
pub const AIR_RADIATION_LENGTH_MM: f64 = 303_900.0;

/// Fractional positions of the two thin scatterers that model the air in a
/// gap.
pub const AIR_SCATTERER_POSITIONS: [f64; 2] = [0.21, 0.79];

/// Floor for radiation-length fractions.
const MIN_RADIATION_LENGTH: f64 = 1e-12;

/// Floor for the logarithmic Highland correction.
const MIN_LOG_CORRECTION: f64 = 1e-3;

/// Scattering weights of one layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerScattering {
    /// Layer id.
    pub layer: LayerId,
    /// Layer z (mm).
    pub z: f64,
    /// RMS scattering angle of the layer (rad).
    pub theta0: f64,
    /// Inverse variance of the kink angle at the layer.
    pub weight: f64,
}

/// Scattering weights for the air between two consecutive layers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GapScattering {
    /// Gap length (mm).
    pub length: f64,
    /// RMS scattering angle of each of the two air points (rad).
    pub theta0: f64,
    /// Inverse variance of each of the two air points.
    pub weight: f64,
}

/// Highland-formula scattering model for one run.
#[derive(Debug, Clone)]
pub struct ScatteringModel {
    beam_energy: f64,
    highland_scale: f64,
    total_radiation_length: f64,
    layers: Vec<LayerScattering>,
    gaps: Vec<GapScattering>,
}

impl ScatteringModel {
    /// Derives the weights for every layer and every gap of `geometry`.
    ///
    /// `beam_energy` is in GeV; `highland_scale` multiplies the Highland
    /// angle.
    #[must_use]
    pub fn new(geometry: &Geometry, beam_energy: f64, highland_scale: f64) -> Self {
        let gap_lengths: Vec<f64> = geometry
            .layers()
            .windows(2)
            .map(|pair| pair[1].z - pair[0].z)
            .collect();

        let air_total: f64 = gap_lengths
            .iter()
            .map(|len| len / AIR_RADIATION_LENGTH_MM)
            .sum();
        let total_radiation_length =
            (geometry.total_radiation_length() + air_total).max(MIN_RADIATION_LENGTH);

        let mut model = Self {
            beam_energy,
            highland_scale,
            total_radiation_length,
            layers: Vec::with_capacity(geometry.len()),
            gaps: Vec::with_capacity(gap_lengths.len()),
        };

        for layer in geometry.layers() {
            let theta0 = model.theta0(layer.radiation_length);
            model.layers.push(LayerScattering {
                layer: layer.id,
                z: layer.z,
                theta0,
                weight: 1.0 / (theta0 * theta0),
            });
        }
        for length in gap_lengths {
            // Each air point carries half of the gap.
            let theta0 = model.theta0(0.5 * length / AIR_RADIATION_LENGTH_MM);
            model.gaps.push(GapScattering {
                length,
                theta0,
                weight: 1.0 / (theta0 * theta0),
            });
        }
        model
    }

    /// Highland RMS angle for a scatterer of `radiation_length` (x / X0).
    #[must_use]
    pub fn theta0(&self, radiation_length: f64) -> f64 {
        let x = radiation_length.max(MIN_RADIATION_LENGTH);
        let correction = (1.0 + 0.038 * self.total_radiation_length.ln()).max(MIN_LOG_CORRECTION);
        self.highland_scale * 0.0136 / self.beam_energy * x.sqrt() * correction
    }

    /// Inverse-variance weight for a scatterer of `radiation_length`.
    #[must_use]
    pub fn weight(&self, radiation_length: f64) -> f64 {
        let theta0 = self.theta0(radiation_length);
        1.0 / (theta0 * theta0)
    }

    /// Sum of all traversed radiation-length fractions, air included.
    #[must_use]
    pub fn total_radiation_length(&self) -> f64 {
        self.total_radiation_length
    }

    /// Beam energy (GeV).
    #[must_use]
    pub fn beam_energy(&self) -> f64 {
        self.beam_energy
    }

    /// Per-layer weights in z order.
    #[must_use]
    pub fn layers(&self) -> &[LayerScattering] {
        &self.layers
    }

    /// Weights of a layer by id.
    #[must_use]
    pub fn layer(&self, id: LayerId) -> Option<&LayerScattering> {
        self.layers.iter().find(|l| l.layer == id)
    }

    /// Air weights of the gap following the layer at z-order index `index`.
    #[must_use]
    pub fn gap(&self, index: usize) -> Option<&GapScattering> {
        self.gaps.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;
    use teletrack_core::geometry::{Layer, ResolutionTable};

    fn geometry(radiation_length: f64) -> Geometry {
        let layers = (0..6)
            .map(|i| Layer::new(i, f64::from(i) * 150.0, radiation_length))
            .collect();
        let mut tables = BTreeMap::new();
        tables.insert(0, ResolutionTable::uniform(4e-3));
        Geometry::new(layers, tables).unwrap()
    }

    #[test]
    fn test_highland_formula() {
        let geometry = geometry(1e-3);
        let model = ScatteringModel::new(&geometry, 4.0, 1.0);

        let total = 6.0 * 1e-3 + 750.0 / AIR_RADIATION_LENGTH_MM;
        assert_relative_eq!(model.total_radiation_length(), total, max_relative = 1e-12);

        let expected = 0.0136 / 4.0 * 1e-3_f64.sqrt() * (1.0 + 0.038 * total.ln());
        let layer = model.layer(2).unwrap();
        assert_relative_eq!(layer.theta0, expected, max_relative = 1e-12);
        assert_relative_eq!(layer.weight, 1.0 / (expected * expected), max_relative = 1e-12);
    }

    #[test]
    fn test_air_points_split_gap() {
        let geometry = geometry(1e-3);
        let model = ScatteringModel::new(&geometry, 4.0, 1.0);
        let gap = model.gap(0).unwrap();
        assert_relative_eq!(gap.length, 150.0);
        let half = 75.0 / AIR_RADIATION_LENGTH_MM;
        assert_relative_eq!(gap.theta0, model.theta0(half), max_relative = 1e-12);
        assert!(model.gap(5).is_none());
    }

    #[test]
    fn test_scale_and_energy() {
        let geometry = geometry(1e-3);
        let base = ScatteringModel::new(&geometry, 4.0, 1.0);
        let scaled = ScatteringModel::new(&geometry, 8.0, 2.0);
        assert_relative_eq!(
            base.layer(0).unwrap().theta0,
            scaled.layer(0).unwrap().theta0,
            max_relative = 1e-12
        );
    }

    #[test]
    fn test_zero_material_is_floored() {
        let geometry = geometry(0.0);
        let model = ScatteringModel::new(&geometry, 4.0, 1.0);
        for layer in model.layers() {
            assert!(layer.weight.is_finite());
            assert!(layer.weight > 0.0);
        }
    }
}
