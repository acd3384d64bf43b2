//! Toy Monte Carlo of straight tracks through the telescope.
//!
//! Tracks start upstream of the first layer with a Gaussian beam profile and
//! divergence, scatter at every layer and at the two air points of every gap,
//! and leave a smeared hit on each layer they cross. Sensor misalignment is
//! applied to the measured positions, so reconstructing with nominal
//! constants shows the misalignment in the residuals.
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use crate::scattering::{ScatteringModel, AIR_SCATTERER_POSITIONS};
use nalgebra::{Point2, Point3, Rotation2, Vector2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson, StandardNormal};
use rayon::prelude::*;
use teletrack_core::alignment::AlignmentConstants;
use teletrack_core::error::{Error, Result};
use teletrack_core::geometry::{Geometry, Layer};
use teletrack_core::hit::{Footprint, HitRecord};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Toy Monte Carlo settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SimulationConfig {
    /// Number of events.
    pub events: usize,
    /// Tracks per event.
    pub tracks_per_event: usize,
    /// Beam energy (GeV).
    pub beam_energy: f64,
    /// Gaussian beam width at the first layer (mm).
    pub beam_width: f64,
    /// Gaussian beam divergence (rad).
    pub divergence: f64,
    /// Mean number of noise hits per layer and event.
    pub noise_rate: f64,
    /// Half-width of the region noise hits are spread over (mm).
    pub noise_extent: f64,
    /// Largest cluster extent per axis.
    pub max_cluster_size: u16,
    /// Whether multiple scattering is simulated.
    pub scattering: bool,
    /// Random seed.
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            events: 1000,
            tracks_per_event: 1,
            beam_energy: 5.0,
            beam_width: 2.0,
            divergence: 2e-4,
            noise_rate: 0.0,
            noise_extent: 5.0,
            max_cluster_size: 3,
            scattering: true,
            seed: 42,
        }
    }
}

impl SimulationConfig {
    /// Sets the number of events.
    #[must_use]
    pub fn with_events(mut self, events: usize) -> Self {
        self.events = events;
        self
    }

    /// Sets the number of tracks per event.
    #[must_use]
    pub fn with_tracks_per_event(mut self, tracks: usize) -> Self {
        self.tracks_per_event = tracks;
        self
    }

    /// Sets the beam energy (GeV).
    #[must_use]
    pub fn with_beam_energy(mut self, energy: f64) -> Self {
        self.beam_energy = energy;
        self
    }

    /// Sets the mean number of noise hits per layer.
    #[must_use]
    pub fn with_noise_rate(mut self, rate: f64) -> Self {
        self.noise_rate = rate;
        self
    }

    /// Enables or disables multiple scattering.
    #[must_use]
    pub fn with_scattering(mut self, scattering: bool) -> Self {
        self.scattering = scattering;
        self
    }

    /// Sets the random seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Generates events of hit records.
#[derive(Debug, Clone)]
pub struct Simulator<'a> {
    geometry: &'a Geometry,
    config: SimulationConfig,
    scattering: ScatteringModel,
    misalignment: AlignmentConstants,
    noise: Option<Poisson<f64>>,
}

impl<'a> Simulator<'a> {
    /// Creates a simulator.
    ///
    /// # Errors
    /// Returns [`Error::Config`] for a non-positive beam energy, negative
    /// widths or an invalid noise rate.
    pub fn new(geometry: &'a Geometry, config: SimulationConfig) -> Result<Self> {
        if !(config.beam_energy.is_finite() && config.beam_energy > 0.0) {
            return Err(Error::Config(format!(
                "beam energy must be positive, got {}",
                config.beam_energy
            )));
        }
        if config.beam_width < 0.0 || config.divergence < 0.0 || config.noise_extent < 0.0 {
            return Err(Error::Config("beam width, divergence and noise extent must be >= 0".to_string()));
        }
        let noise = if config.noise_rate > 0.0 {
            Some(Poisson::new(config.noise_rate).map_err(|e| Error::Config(format!("noise rate: {e}")))?)
        } else {
            None
        };
        Ok(Self {
            geometry,
            scattering: ScatteringModel::new(geometry, config.beam_energy, 1.0),
            config,
            misalignment: AlignmentConstants::new(),
            noise,
        })
    }

    /// Applies sensor misalignment to the generated measurements.
    #[must_use]
    pub fn with_misalignment(mut self, misalignment: AlignmentConstants) -> Self {
        self.misalignment = misalignment;
        self
    }

    /// All events, each seeded from the run seed and its index.
    #[must_use]
    pub fn run(&self) -> Vec<Vec<HitRecord>> {
        (0..self.config.events)
            .into_par_iter()
            .map(|index| self.event(index as u64))
            .collect()
    }

    /// Hit records of one event.
    #[must_use]
    pub fn event(&self, index: u64) -> Vec<HitRecord> {
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(index.wrapping_mul(0x9E37_79B9_7F4A_7C15)));
        let mut records = Vec::new();
        for _ in 0..self.config.tracks_per_event {
            self.track(&mut rng, &mut records);
        }
        if let Some(noise) = &self.noise {
            for layer in self.geometry.layers() {
                let count = noise.sample(&mut rng) as usize;
                for _ in 0..count {
                    let extent = self.config.noise_extent;
                    let x = rng.gen_range(-extent..=extent);
                    let y = rng.gen_range(-extent..=extent);
                    records.push(self.measure(layer, Vector2::new(x, y), Footprint::new(1, 1, 1)));
                }
            }
        }
        records
    }

    fn track(&self, rng: &mut StdRng, records: &mut Vec<HitRecord>) {
        let layers = self.geometry.layers();
        let Some(first) = layers.first() else {
            return;
        };
        let mut position = Vector2::new(gauss(rng), gauss(rng)) * self.config.beam_width;
        let mut slope = Vector2::new(gauss(rng), gauss(rng)) * self.config.divergence;
        let mut z = first.z;

        for (index, layer) in layers.iter().enumerate() {
            position += slope * (layer.z - z);
            z = layer.z;

            let footprint = self.footprint(rng);
            let table = self.geometry.resolution(layer.id);
            let sigma = table.map_or(Vector2::zeros(), |t| {
                Vector2::new(t.sigma(footprint.x), t.sigma(footprint.y))
            });
            let smeared = position + Vector2::new(gauss(rng) * sigma.x, gauss(rng) * sigma.y);
            records.push(self.measure(layer, smeared, footprint));

            if !self.config.scattering {
                continue;
            }
            if let Some(s) = self.scattering.layer(layer.id) {
                slope += Vector2::new(gauss(rng), gauss(rng)) * s.theta0;
            }
            let (Some(next), Some(gap)) = (layers.get(index + 1), self.scattering.gap(index)) else {
                continue;
            };
            for fraction in AIR_SCATTERER_POSITIONS {
                let air_z = layer.z + fraction * (next.z - layer.z);
                position += slope * (air_z - z);
                z = air_z;
                slope += Vector2::new(gauss(rng), gauss(rng)) * gap.theta0;
            }
        }
    }

    fn footprint(&self, rng: &mut StdRng) -> Footprint {
        let max = self.config.max_cluster_size.max(1);
        let x = rng.gen_range(1..=max);
        let y = rng.gen_range(1..=max);
        Footprint::new(x, y, x.saturating_mul(y))
    }

    /// Hit record as seen by a sensor carrying the misalignment of its layer.
    fn measure(&self, layer: &Layer, position: Vector2<f64>, footprint: Footprint) -> HitRecord {
        let constant = self.misalignment.get(layer.id);
        let shifted = position - constant.shift.xy();
        let local = Rotation2::new(-constant.rotation.z) * Point2::from(shifted);
        HitRecord {
            layer: layer.id,
            position: Point3::new(local.x, local.y, layer.z),
            local,
            footprint,
        }
    }
}

fn gauss(rng: &mut StdRng) -> f64 {
    rng.sample(StandardNormal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;
    use teletrack_core::alignment::AlignmentConstant;
    use teletrack_core::geometry::ResolutionTable;

    fn geometry() -> Geometry {
        let z = [0.0, 150.0, 300.0, 600.0, 750.0, 900.0];
        let layers = z.iter().zip(0..).map(|(&z, id)| Layer::new(id, z, 5.5e-4)).collect();
        let mut tables = BTreeMap::new();
        tables.insert(0, ResolutionTable::uniform(4e-3));
        Geometry::new(layers, tables).unwrap()
    }

    #[test]
    fn test_one_hit_per_layer() {
        let geometry = geometry();
        let sim = Simulator::new(&geometry, SimulationConfig::default().with_events(5)).unwrap();
        let events = sim.run();
        assert_eq!(events.len(), 5);
        for records in &events {
            assert_eq!(records.len(), 6);
            for (record, layer) in records.iter().zip(geometry.layers()) {
                assert_eq!(record.layer, layer.id);
                assert_relative_eq!(record.position.z, layer.z);
            }
        }
    }

    #[test]
    fn test_reproducible() {
        let geometry = geometry();
        let config = SimulationConfig::default().with_events(3).with_seed(7);
        let a = Simulator::new(&geometry, config.clone()).unwrap().run();
        let b = Simulator::new(&geometry, config).unwrap().run();
        assert_eq!(a, b);
    }

    #[test]
    fn test_misalignment_shifts_measurements() {
        let geometry = geometry();
        let config = SimulationConfig::default().with_events(1).with_scattering(false);
        let nominal = Simulator::new(&geometry, config.clone()).unwrap().event(0);
        let shifted: AlignmentConstants = [(2, AlignmentConstant::from_shift(0.1, -0.05, 0.0))]
            .into_iter()
            .collect();
        let moved = Simulator::new(&geometry, config)
            .unwrap()
            .with_misalignment(shifted)
            .event(0);
        assert_relative_eq!(moved[2].position.x, nominal[2].position.x - 0.1, epsilon = 1e-12);
        assert_relative_eq!(moved[2].position.y, nominal[2].position.y + 0.05, epsilon = 1e-12);
        assert_relative_eq!(moved[1].position.x, nominal[1].position.x);
    }

    #[test]
    fn test_noise_hits() {
        let geometry = geometry();
        let config = SimulationConfig::default()
            .with_events(20)
            .with_tracks_per_event(0)
            .with_noise_rate(2.0);
        let events = Simulator::new(&geometry, config).unwrap().run();
        let total: usize = events.iter().map(Vec::len).sum();
        assert!(total > 0);
    }

    #[test]
    fn test_rejects_bad_energy() {
        let geometry = geometry();
        assert!(Simulator::new(&geometry, SimulationConfig::default().with_beam_energy(0.0)).is_err());
    }
}
