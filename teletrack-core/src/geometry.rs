//! Detector geometry: layer positions, material budget and resolution tables.
//!
//! The geometry is supplied once per run and is read-only afterwards. Layers
//! are kept sorted by their z position, which is also the path-length order of
//! a beam particle in the field-free telescope.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tracing::warn;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Sensor (layer) identifier.
pub type LayerId = u32;

/// Largest layer id whose alignment labels fit in an `i32`.
pub const MAX_LAYER_ID: LayerId = 214_748_364;

/// Pixel matrix description of a sensor, used to convert cluster centroids
/// from pixel units into local millimetres.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SensorGeometry {
    /// Pixel pitch along x (mm).
    pub pitch_x: f64,
    /// Pixel pitch along y (mm).
    pub pitch_y: f64,
    /// Number of pixel columns.
    pub columns: u32,
    /// Number of pixel rows.
    pub rows: u32,
}

impl SensorGeometry {
    /// MIMOSA26-like sensor: 18.4 um pitch, 1152 x 576 pixels.
    #[must_use]
    pub fn mimosa26() -> Self {
        Self {
            pitch_x: 0.0184,
            pitch_y: 0.0184,
            columns: 1152,
            rows: 576,
        }
    }

    /// Converts a pixel-unit centroid into local coordinates (mm), with the
    /// origin at the sensor centre.
    #[inline]
    #[must_use]
    pub fn pixel_to_local(&self, column: f64, row: f64) -> (f64, f64) {
        let x = (column + 0.5 - f64::from(self.columns) / 2.0) * self.pitch_x;
        let y = (row + 0.5 - f64::from(self.rows) / 2.0) * self.pitch_y;
        (x, y)
    }
}

/// A single detector layer.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Layer {
    /// Sensor identifier.
    pub id: LayerId,
    /// Position along the beam axis (mm).
    pub z: f64,
    /// Thickness in units of radiation length (x / X0).
    pub radiation_length: f64,
    /// Optional pixel matrix description.
    #[cfg_attr(feature = "serde", serde(default))]
    pub sensor: Option<SensorGeometry>,
}

impl Layer {
    /// Creates a layer without pixel matrix information.
    #[must_use]
    pub fn new(id: LayerId, z: f64, radiation_length: f64) -> Self {
        Self {
            id,
            z,
            radiation_length,
            sensor: None,
        }
    }

    /// Attaches a pixel matrix description.
    #[must_use]
    pub fn with_sensor(mut self, sensor: SensorGeometry) -> Self {
        self.sensor = Some(sensor);
        self
    }
}

/// Intrinsic resolution keyed by cluster footprint.
///
/// Built from the ordered list `(average, 1, 2, ..., N, >N)`: index 0 is used
/// when the footprint is unknown (zero), indices `1..=N` for footprints of that
/// size and the last entry for everything larger than `N`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResolutionTable {
    values: Vec<f64>,
}

impl ResolutionTable {
    /// Builds a table from the ordered list `(average, 1, ..., N, >N)`.
    ///
    /// # Errors
    /// Returns an error if the list is empty or holds a non-positive value.
    pub fn from_ordered(layer: LayerId, values: Vec<f64>) -> Result<Self> {
        if values.is_empty() {
            return Err(Error::InvalidResolution {
                layer,
                reason: "empty table".to_string(),
            });
        }
        if let Some(bad) = values.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
            return Err(Error::InvalidResolution {
                layer,
                reason: format!("resolution must be positive, got {bad}"),
            });
        }
        Ok(Self { values })
    }

    /// A table holding a single average resolution for all footprints.
    #[must_use]
    pub fn uniform(sigma: f64) -> Self {
        Self {
            values: vec![sigma],
        }
    }

    /// Resolution (mm) for a footprint of the given size.
    #[must_use]
    pub fn sigma(&self, footprint: u16) -> f64 {
        let size = usize::from(footprint);
        let last = self.values.len() - 1;
        if size == 0 {
            self.values[0]
        } else if size < last {
            self.values[size]
        } else {
            self.values[last]
        }
    }

    /// Average resolution (first table entry).
    #[must_use]
    pub fn average(&self) -> f64 {
        self.values[0]
    }

    /// The raw ordered entries.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// The full telescope geometry: layers in z order plus their resolutions.
#[derive(Debug, Clone)]
pub struct Geometry {
    layers: Vec<Layer>,
    resolutions: BTreeMap<LayerId, ResolutionTable>,
}

impl Geometry {
    /// Validates and assembles a geometry.
    ///
    /// Layers are sorted by z. Layers without their own resolution table fall
    /// back to the table of the lowest layer id that has one.
    ///
    /// # Errors
    /// Returns an error if no layers are given, ids or z positions repeat, an
    /// id is above [`MAX_LAYER_ID`], or no resolution table exists at all.
    pub fn new(
        mut layers: Vec<Layer>,
        mut resolutions: BTreeMap<LayerId, ResolutionTable>,
    ) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::Geometry("no layers defined".to_string()));
        }
        if let Some(layer) = layers.iter().find(|l| !l.z.is_finite()) {
            return Err(Error::Geometry(format!(
                "layer {} has non-finite z position",
                layer.id
            )));
        }
        if let Some(layer) = layers.iter().find(|l| l.id > MAX_LAYER_ID) {
            return Err(Error::Geometry(format!(
                "layer id {} exceeds the largest labelable id {MAX_LAYER_ID}",
                layer.id
            )));
        }
        layers.sort_by(|a, b| a.z.total_cmp(&b.z));

        for pair in layers.windows(2) {
            if pair[1].z <= pair[0].z {
                return Err(Error::Geometry(format!(
                    "layers {} and {} share z = {}",
                    pair[0].id, pair[1].id, pair[0].z
                )));
            }
        }
        let mut ids: Vec<LayerId> = layers.iter().map(|l| l.id).collect();
        ids.sort_unstable();
        if let Some(pair) = ids.windows(2).find(|p| p[0] == p[1]) {
            return Err(Error::Geometry(format!("duplicate layer id {}", pair[0])));
        }

        let unknown: Vec<LayerId> = resolutions
            .keys()
            .copied()
            .filter(|id| ids.binary_search(id).is_err())
            .collect();
        for id in unknown {
            warn!(layer = id, "resolution table for unknown layer ignored");
            resolutions.remove(&id);
        }

        let fallback = resolutions
            .values()
            .next()
            .cloned()
            .ok_or(Error::MissingResolution)?;
        for layer in &layers {
            resolutions.entry(layer.id).or_insert_with(|| {
                warn!(
                    layer = layer.id,
                    "no resolution table configured, using fallback table"
                );
                fallback.clone()
            });
        }

        Ok(Self {
            layers,
            resolutions,
        })
    }

    /// Layers in increasing z.
    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns true if the geometry has no layers (never true once built).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Looks up a layer by id.
    #[must_use]
    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    /// Position of a layer in z order.
    #[must_use]
    pub fn position(&self, id: LayerId) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    /// Returns true if the layer exists.
    #[must_use]
    pub fn contains(&self, id: LayerId) -> bool {
        self.layer(id).is_some()
    }

    /// Resolution table of a layer.
    #[must_use]
    pub fn resolution(&self, id: LayerId) -> Option<&ResolutionTable> {
        self.resolutions.get(&id)
    }

    /// Total material budget of all layers (x / X0).
    #[must_use]
    pub fn total_radiation_length(&self) -> f64 {
        self.layers.iter().map(|l| l.radiation_length.max(0.0)).sum()
    }
}
