//! JSON run configuration.
//!
//! A run file describes the telescope geometry, the resolution tables, the
//! tracking cuts, the alignment policy and the current alignment constants:
//!
//! ```json
//! {
//!   "layers": [{ "id": 0, "z": 0.0, "radiation_length": 5.5e-4 }],
//!   "resolutions": { "0": [0.0045, 0.0040, 0.0042, 0.0050] },
//!   "tracking": { "beam_energy": 120.0, "match_cut": 0.05 },
//!   "policy": { "excluded": [2] },
//!   "alignment": { "3": { "shift": [0.01, 0.0, 0.0], "rotation": [0.0, 0.0, 1e-4] } }
//! }
//! ```
//!
//! Older files carry the resolutions as one flat list where a negative
//! value opens the next layer's table, and the alignment constants as
//! parallel per-layer arrays. Both forms are converted here, once.
//! Inconsistent optional sections are logged and replaced by defaults; only a
//! missing geometry or a missing resolution table is fatal.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use teletrack_core::{
    AlignmentConstant, AlignmentConstants, AlignmentPolicy, Geometry, HitRecord, Layer, LayerId,
    ResolutionTable, TrackingConfig,
};
use tracing::{debug, warn};

/// Alignment constants as parallel per-layer arrays.
///
/// Every array is either empty (all zero) or as long as `layers`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentArrays {
    pub layers: Vec<LayerId>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub alpha: Vec<f64>,
    pub beta: Vec<f64>,
    pub gamma: Vec<f64>,
}

impl AlignmentArrays {
    /// Converts the arrays into constants.
    ///
    /// Returns `None` if an array length disagrees with the layer list.
    #[must_use]
    pub fn to_constants(&self) -> Option<AlignmentConstants> {
        let n = self.layers.len();
        let columns = [&self.x, &self.y, &self.z, &self.alpha, &self.beta, &self.gamma];
        if columns.iter().any(|c| !c.is_empty() && c.len() != n) {
            return None;
        }
        let at = |c: &Vec<f64>, i: usize| c.get(i).copied().unwrap_or(0.0);
        Some(
            self.layers
                .iter()
                .enumerate()
                .map(|(i, &layer)| {
                    let constant = AlignmentConstant::from_shift(
                        at(&self.x, i),
                        at(&self.y, i),
                        at(&self.z, i),
                    )
                    .with_rotation(at(&self.alpha, i), at(&self.beta, i), at(&self.gamma, i));
                    (layer, constant)
                })
                .collect(),
        )
    }
}

/// Run file as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunFile {
    /// Detector layers.
    pub layers: Vec<Layer>,
    /// Resolution tables `(average, 1, ..., N, >N)` by layer id.
    pub resolutions: BTreeMap<LayerId, Vec<f64>>,
    /// Legacy flat resolution list.
    pub resolution_list: Vec<f64>,
    /// Track finding, fitting and selection.
    pub tracking: TrackingConfig,
    /// Alignment policy.
    pub policy: AlignmentPolicy,
    /// Alignment constants by layer id.
    pub alignment: BTreeMap<LayerId, AlignmentConstant>,
    /// Legacy alignment arrays.
    pub alignment_arrays: Option<AlignmentArrays>,
}

/// Validated run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Telescope geometry.
    pub geometry: Geometry,
    /// Track finding, fitting and selection.
    pub tracking: TrackingConfig,
    /// Alignment policy, restricted to known layers.
    pub policy: AlignmentPolicy,
    /// Alignment constants, restricted to known layers.
    pub alignment: AlignmentConstants,
}

impl RunConfig {
    /// Loads and validates a JSON run file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or the geometry
    /// is unusable.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "loading run file");
        Self::from_json(&text)
    }

    /// Parses and validates a run file from a JSON string.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or the geometry is unusable.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: RunFile = serde_json::from_str(text)?;
        file.resolve()
    }

    /// Recomputes the global position of hits on layers with an explicit
    /// alignment constant from their local position.
    pub fn apply_alignment(&self, hits: &mut [HitRecord]) {
        if self.alignment.is_empty() {
            return;
        }
        for hit in hits {
            let Some(layer) = self.geometry.layer(hit.layer) else {
                continue;
            };
            if let Some((_, constant)) = self.alignment.iter().find(|(id, _)| *id == hit.layer) {
                hit.position = constant.local_to_global(hit.local, layer.z);
            }
        }
    }
}

impl RunFile {
    /// Validates the file into a [`RunConfig`].
    ///
    /// # Errors
    /// Returns an error if no layers are defined, the layers are inconsistent
    /// or no usable resolution table remains.
    pub fn resolve(self) -> Result<RunConfig> {
        if self.layers.is_empty() {
            return Err(Error::CoreError(teletrack_core::Error::Geometry(
                "run file defines no layers".to_string(),
            )));
        }

        let mut tables = if self.resolution_list.is_empty() {
            BTreeMap::new()
        } else {
            split_resolution_list(&self.resolution_list, &self.layers)
        };
        for (layer, values) in self.resolutions {
            if tables.contains_key(&layer) {
                warn!(layer, "resolution table given twice, using the per-layer entry");
            }
            match ResolutionTable::from_ordered(layer, values) {
                Ok(table) => {
                    tables.insert(layer, table);
                }
                Err(err) => {
                    warn!(layer, %err, "resolution table ignored");
                    tables.remove(&layer);
                }
            }
        }
        let geometry = Geometry::new(self.layers, tables)?;

        let mut alignment: AlignmentConstants = match &self.alignment_arrays {
            None => AlignmentConstants::new(),
            Some(arrays) => arrays.to_constants().unwrap_or_else(|| {
                warn!("alignment arrays have mismatched lengths, using nominal alignment");
                AlignmentConstants::new()
            }),
        };
        for (layer, constant) in self.alignment {
            alignment.insert(layer, constant);
        }
        alignment.retain_known(&geometry);

        let mut policy = self.policy;
        policy.retain_known(&geometry);

        Ok(RunConfig {
            geometry,
            tracking: self.tracking,
            policy,
            alignment,
        })
    }
}

/// Splits a legacy flat resolution list into per-layer tables.
///
/// A negative value opens a new table whose average is its magnitude; the
/// following positive values complete it. Tables are assigned to the layers
/// in increasing z. Malformed tables are dropped with a warning.
#[must_use]
pub fn split_resolution_list(values: &[f64], layers: &[Layer]) -> BTreeMap<LayerId, ResolutionTable> {
    let mut groups: Vec<Vec<f64>> = Vec::new();
    for &v in values {
        if v < 0.0 {
            groups.push(vec![-v]);
        } else if let Some(group) = groups.last_mut() {
            group.push(v);
        } else {
            warn!("resolution list does not start with a negative marker");
            groups.push(vec![v]);
        }
    }

    let mut ordered: Vec<&Layer> = layers.iter().collect();
    ordered.sort_by(|a, b| a.z.total_cmp(&b.z));
    if groups.len() > ordered.len() {
        warn!(
            tables = groups.len(),
            layers = ordered.len(),
            "more resolution tables than layers, extra tables ignored"
        );
    }

    let mut tables = BTreeMap::new();
    for (layer, group) in ordered.iter().zip(groups) {
        match ResolutionTable::from_ordered(layer.id, group) {
            Ok(table) => {
                tables.insert(layer.id, table);
            }
            Err(err) => warn!(layer = layer.id, %err, "resolution table ignored"),
        }
    }
    tables
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const BASE: &str = r#"{
        "layers": [
            { "id": 0, "z": 0.0, "radiation_length": 5.5e-4 },
            { "id": 1, "z": 150.0, "radiation_length": 5.5e-4 },
            { "id": 2, "z": 300.0, "radiation_length": 5.5e-4 }
        ],
        "resolutions": { "0": [0.0045, 0.0040, 0.0042] }
    }"#;

    fn layers() -> Vec<Layer> {
        vec![
            Layer::new(5, 300.0, 1e-3),
            Layer::new(3, 0.0, 1e-3),
            Layer::new(4, 150.0, 1e-3),
        ]
    }

    #[test]
    fn test_minimal_run_file() {
        let config = RunConfig::from_json(BASE).unwrap();
        assert_eq!(config.geometry.len(), 3);
        assert_eq!(config.tracking, TrackingConfig::default());
        assert_eq!(config.policy, AlignmentPolicy::default());
        assert!(config.alignment.is_empty());
        // Layers 1 and 2 fall back to the table of layer 0.
        let table = config.geometry.resolution(2).unwrap();
        assert_relative_eq!(table.sigma(1), 0.0040);
    }

    #[test]
    fn test_sections_override_defaults() {
        let text = r#"{
            "layers": [
                { "id": 0, "z": 0.0, "radiation_length": 5.5e-4 },
                { "id": 1, "z": 150.0, "radiation_length": 5.5e-4 }
            ],
            "resolutions": { "0": [0.004], "1": [0.005] },
            "tracking": { "beam_energy": 120.0, "match_cut": 0.05 },
            "policy": { "excluded": [1, 9] },
            "alignment": { "1": { "shift": [0.01, 0.0, 0.0], "rotation": [0.0, 0.0, 0.0] },
                           "7": { "shift": [1.0, 1.0, 1.0], "rotation": [0.0, 0.0, 0.0] } }
        }"#;
        let config = RunConfig::from_json(text).unwrap();
        assert_relative_eq!(config.tracking.beam_energy, 120.0);
        assert_relative_eq!(config.tracking.match_cut, 0.05);
        assert_relative_eq!(config.tracking.triplet_residual_cut, 0.1);
        assert!(config.policy.is_excluded(1));
        assert!(!config.policy.excluded.contains(&9));
        assert_eq!(config.alignment.len(), 1);
        assert_relative_eq!(config.alignment.get(1).shift.x, 0.01);
    }

    #[test]
    fn test_missing_layers_is_fatal() {
        let result = RunConfig::from_json(r#"{ "resolutions": { "0": [0.004] } }"#);
        assert!(matches!(result, Err(Error::CoreError(_))));
    }

    #[test]
    fn test_missing_resolution_is_fatal() {
        let text = r#"{ "layers": [{ "id": 0, "z": 0.0, "radiation_length": 1e-3 }] }"#;
        assert!(matches!(
            RunConfig::from_json(text),
            Err(Error::CoreError(teletrack_core::Error::MissingResolution))
        ));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(RunConfig::from_json("{ layers"), Err(Error::Json(_))));
    }

    #[test]
    fn test_split_resolution_list() {
        let list = [-0.004, 0.0035, 0.0045, -0.005, -0.006, 0.0055];
        let tables = split_resolution_list(&list, &layers());
        // Assigned in z order: 3, 4, 5.
        assert_eq!(tables[&3].values(), &[0.004, 0.0035, 0.0045]);
        assert_eq!(tables[&4].values(), &[0.005]);
        assert_eq!(tables[&5].values(), &[0.006, 0.0055]);
    }

    #[test]
    fn test_split_resolution_list_extra_tables_ignored() {
        let list = [-0.001, -0.002, -0.003, -0.004];
        let tables = split_resolution_list(&list, &layers());
        assert_eq!(tables.len(), 3);
        assert_relative_eq!(tables[&5].average(), 0.003);
    }

    #[test]
    fn test_legacy_resolution_list_in_run_file() {
        let text = r#"{
            "layers": [
                { "id": 0, "z": 0.0, "radiation_length": 5.5e-4 },
                { "id": 1, "z": 150.0, "radiation_length": 5.5e-4 }
            ],
            "resolution_list": [-0.004, 0.003, -0.006]
        }"#;
        let config = RunConfig::from_json(text).unwrap();
        assert_relative_eq!(config.geometry.resolution(0).unwrap().sigma(1), 0.003);
        assert_relative_eq!(config.geometry.resolution(1).unwrap().average(), 0.006);
    }

    #[test]
    fn test_alignment_arrays() {
        let arrays = AlignmentArrays {
            layers: vec![0, 1],
            x: vec![0.1, 0.2],
            gamma: vec![0.0, 1e-3],
            ..AlignmentArrays::default()
        };
        let constants = arrays.to_constants().unwrap();
        assert_relative_eq!(constants.get(1).shift.x, 0.2);
        assert_relative_eq!(constants.get(1).rotation.z, 1e-3);
        assert_relative_eq!(constants.get(0).shift.y, 0.0);
    }

    #[test]
    fn test_mismatched_alignment_arrays_fall_back() {
        let arrays = AlignmentArrays {
            layers: vec![0, 1],
            x: vec![0.1],
            ..AlignmentArrays::default()
        };
        assert!(arrays.to_constants().is_none());

        let mut file: RunFile = serde_json::from_str(BASE).unwrap();
        file.alignment_arrays = Some(arrays);
        let config = file.resolve().unwrap();
        assert!(config.alignment.is_empty());
    }

    #[test]
    fn test_apply_alignment() {
        let mut config = RunConfig::from_json(BASE).unwrap();
        config
            .alignment
            .insert(1, AlignmentConstant::from_shift(0.5, -0.25, 0.0));
        let mut hits = vec![
            HitRecord::at(0, 1.0, 1.0, 0.0),
            HitRecord::at(1, 1.0, 1.0, 150.0),
        ];
        config.apply_alignment(&mut hits);
        assert_relative_eq!(hits[0].position.x, 1.0);
        assert_relative_eq!(hits[1].position.x, 1.5);
        assert_relative_eq!(hits[1].position.y, 0.75);
        assert_relative_eq!(hits[1].position.z, 150.0);
    }
}
