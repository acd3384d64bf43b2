//! Tracking configuration.

use crate::error::{Error, Result};
use crate::geometry::{Geometry, LayerId};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Three layers forming a local track segment, in beam order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LayerTriple {
    /// First outer layer.
    pub first: LayerId,
    /// Middle layer.
    pub middle: LayerId,
    /// Last outer layer.
    pub last: LayerId,
}

impl LayerTriple {
    /// Creates a new triple.
    #[must_use]
    pub fn new(first: LayerId, middle: LayerId, last: LayerId) -> Self {
        Self {
            first,
            middle,
            last,
        }
    }

    /// The three layer ids.
    #[must_use]
    pub fn ids(&self) -> [LayerId; 3] {
        [self.first, self.middle, self.last]
    }

    /// Returns true if the layer belongs to this triple.
    #[must_use]
    pub fn contains(&self, layer: LayerId) -> bool {
        self.ids().contains(&layer)
    }

    /// Checks that all layers exist and the middle layer lies strictly
    /// between the outer ones.
    ///
    /// # Errors
    /// Returns an error naming the offending layer or ordering.
    pub fn validate(&self, geometry: &Geometry) -> Result<()> {
        let mut z = [0.0; 3];
        for (slot, id) in z.iter_mut().zip(self.ids()) {
            *slot = geometry.layer(id).ok_or(Error::UnknownLayer(id))?.z;
        }
        if z[0] < z[1] && z[1] < z[2] {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "layer triple ({}, {}, {}) is not ordered in z",
                self.first, self.middle, self.last
            )))
        }
    }
}

/// Configuration of the track finding, fitting and selection.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TrackingConfig {
    /// Layers of the upstream triplet.
    pub upstream: LayerTriple,
    /// Layers of the downstream triplet (driplet).
    pub downstream: LayerTriple,
    /// Maximum middle-hit residual per coordinate (mm).
    pub triplet_residual_cut: f64,
    /// Maximum segment slope per coordinate (rad).
    pub triplet_slope_cut: f64,
    /// Maximum mismatch of the two segments at the reference plane (mm).
    pub match_cut: f64,
    /// Maximum distance of an interior hit from the candidate (mm).
    pub interior_cut: f64,
    /// Matching plane; midway between the two triplets if unset.
    pub reference_z: Option<f64>,
    /// Beam energy (GeV).
    pub beam_energy: f64,
    /// Scale factor applied to the Highland scattering angle.
    pub highland_scale: f64,
    /// Minimum fit probability for a track to be accepted.
    pub min_probability: f64,
    /// Maximum chi2 / ndf for a track to be accepted.
    pub max_chi2_ndf: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            upstream: LayerTriple::new(0, 1, 2),
            downstream: LayerTriple::new(3, 4, 5),
            triplet_residual_cut: 0.1,
            triplet_slope_cut: 0.005,
            match_cut: 0.1,
            interior_cut: 0.2,
            reference_z: None,
            beam_energy: 5.0,
            highland_scale: 1.0,
            min_probability: 1e-3,
            max_chi2_ndf: 10.0,
        }
    }
}

impl TrackingConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the triplet residual and slope cuts.
    #[must_use]
    pub fn with_triplet_cuts(mut self, residual: f64, slope: f64) -> Self {
        self.triplet_residual_cut = residual;
        self.triplet_slope_cut = slope;
        self
    }

    /// Sets the matching cut.
    #[must_use]
    pub fn with_match_cut(mut self, cut: f64) -> Self {
        self.match_cut = cut;
        self
    }

    /// Sets the interior association cut.
    #[must_use]
    pub fn with_interior_cut(mut self, cut: f64) -> Self {
        self.interior_cut = cut;
        self
    }

    /// Sets the matching plane.
    #[must_use]
    pub fn with_reference_z(mut self, z: f64) -> Self {
        self.reference_z = Some(z);
        self
    }

    /// Sets the beam energy (GeV).
    #[must_use]
    pub fn with_beam_energy(mut self, energy: f64) -> Self {
        self.beam_energy = energy;
        self
    }

    /// Sets the Highland scale factor.
    #[must_use]
    pub fn with_highland_scale(mut self, scale: f64) -> Self {
        self.highland_scale = scale;
        self
    }

    /// Sets the acceptance thresholds.
    #[must_use]
    pub fn with_acceptance(mut self, min_probability: f64, max_chi2_ndf: f64) -> Self {
        self.min_probability = min_probability;
        self.max_chi2_ndf = max_chi2_ndf;
        self
    }

    /// Sets the layer triples.
    #[must_use]
    pub fn with_triples(mut self, upstream: LayerTriple, downstream: LayerTriple) -> Self {
        self.upstream = upstream;
        self.downstream = downstream;
        self
    }

    /// Layers used by either triplet.
    #[must_use]
    pub fn telescope_layers(&self) -> [LayerId; 6] {
        let [a, b, c] = self.upstream.ids();
        let [d, e, f] = self.downstream.ids();
        [a, b, c, d, e, f]
    }

    /// Returns true if the layer belongs to either triplet.
    #[must_use]
    pub fn is_telescope_layer(&self, layer: LayerId) -> bool {
        self.upstream.contains(layer) || self.downstream.contains(layer)
    }

    /// The matching plane: configured, or midway between the last upstream
    /// and the first downstream layer.
    #[must_use]
    pub fn matching_plane(&self, geometry: &Geometry) -> f64 {
        if let Some(z) = self.reference_z {
            return z;
        }
        let up = geometry.layer(self.upstream.last).map_or(0.0, |l| l.z);
        let down = geometry.layer(self.downstream.first).map_or(up, |l| l.z);
        0.5 * (up + down)
    }

    /// Validates the configuration against a geometry.
    ///
    /// # Errors
    /// Returns an error for unknown or misordered triplet layers, overlapping
    /// triples, or non-physical numeric settings.
    pub fn validate(&self, geometry: &Geometry) -> Result<()> {
        self.upstream.validate(geometry)?;
        self.downstream.validate(geometry)?;

        let layers = self.telescope_layers();
        for (i, a) in layers.iter().enumerate() {
            if layers[i + 1..].contains(a) {
                return Err(Error::Config(format!(
                    "layer {a} is used by more than one triplet slot"
                )));
            }
        }

        let cuts = [
            ("triplet_residual_cut", self.triplet_residual_cut),
            ("triplet_slope_cut", self.triplet_slope_cut),
            ("match_cut", self.match_cut),
            ("interior_cut", self.interior_cut),
        ];
        for (name, value) in cuts {
            if !(value.is_finite() && value >= 0.0) {
                return Err(Error::Config(format!("{name} must be >= 0, got {value}")));
            }
        }
        if !(self.beam_energy.is_finite() && self.beam_energy > 0.0) {
            return Err(Error::Config(format!(
                "beam energy must be positive, got {}",
                self.beam_energy
            )));
        }
        if !(self.highland_scale.is_finite() && self.highland_scale > 0.0) {
            return Err(Error::Config(format!(
                "highland scale must be positive, got {}",
                self.highland_scale
            )));
        }
        Ok(())
    }
}
