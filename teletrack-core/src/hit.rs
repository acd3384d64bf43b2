//! Hit types and the per-event hit table.

use crate::geometry::{Geometry, LayerId};
use nalgebra::{Point2, Point3, Vector2};
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::warn;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Index of a hit within its [`HitTable`].
pub type HitId = usize;

/// Cluster extent: distinct columns, distinct rows and pixel count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Footprint {
    /// Extent along x (columns).
    pub x: u16,
    /// Extent along y (rows).
    pub y: u16,
    /// Number of pixels.
    pub total: u16,
}

impl Footprint {
    /// Creates a new footprint.
    #[inline]
    #[must_use]
    pub fn new(x: u16, y: u16, total: u16) -> Self {
        Self { x, y, total }
    }
}

/// One hit as delivered by the cluster-to-hit stage.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HitRecord {
    /// Sensor the hit was found on.
    pub layer: LayerId,
    /// Global position (mm).
    pub position: Point3<f64>,
    /// Local sensor position (mm).
    pub local: Point2<f64>,
    /// Cluster footprint.
    pub footprint: Footprint,
}

impl HitRecord {
    /// Creates a record whose local position equals the global transverse
    /// position.
    #[must_use]
    pub fn at(layer: LayerId, x: f64, y: f64, z: f64) -> Self {
        Self {
            layer,
            position: Point3::new(x, y, z),
            local: Point2::new(x, y),
            footprint: Footprint::new(1, 1, 1),
        }
    }

    /// Sets the footprint.
    #[must_use]
    pub fn with_footprint(mut self, footprint: Footprint) -> Self {
        self.footprint = footprint;
        self
    }
}

/// A hit with its footprint-dependent resolution resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Hit {
    /// Sensor the hit was found on.
    pub layer: LayerId,
    /// Global position (mm).
    pub position: Point3<f64>,
    /// Local sensor position (mm).
    pub local: Point2<f64>,
    /// Cluster footprint.
    pub footprint: Footprint,
    /// Resolution (sigma, mm) along x and y.
    pub resolution: Vector2<f64>,
}

impl Hit {
    /// Global x (mm).
    #[inline]
    #[must_use]
    pub fn x(&self) -> f64 {
        self.position.x
    }

    /// Global y (mm).
    #[inline]
    #[must_use]
    pub fn y(&self) -> f64 {
        self.position.y
    }

    /// Global z (mm).
    #[inline]
    #[must_use]
    pub fn z(&self) -> f64 {
        self.position.z
    }

    /// Transverse global position.
    #[inline]
    #[must_use]
    pub fn xy(&self) -> Vector2<f64> {
        Vector2::new(self.position.x, self.position.y)
    }
}

/// All hits of one event, grouped by layer.
///
/// Hits are immutable once the table is built; other stages refer to them by
/// [`HitId`].
#[derive(Debug, Clone, Default)]
pub struct HitTable {
    event: u64,
    hits: Vec<Hit>,
    by_layer: BTreeMap<LayerId, Range<usize>>,
}

impl HitTable {
    /// Builds the table for one event.
    ///
    /// Records on layers unknown to the geometry are dropped with a warning.
    /// Each hit's resolution is looked up from its layer's table using the
    /// x and y footprint.
    #[must_use]
    pub fn from_records(event: u64, records: &[HitRecord], geometry: &Geometry) -> Self {
        let mut hits: Vec<Hit> = Vec::with_capacity(records.len());
        for record in records {
            let Some(table) = geometry.resolution(record.layer) else {
                warn!(event, layer = record.layer, "hit on unknown layer dropped");
                continue;
            };
            hits.push(Hit {
                layer: record.layer,
                position: record.position,
                local: record.local,
                footprint: record.footprint,
                resolution: Vector2::new(
                    table.sigma(record.footprint.x),
                    table.sigma(record.footprint.y),
                ),
            });
        }

        // Stable sort keeps the input order within a layer.
        hits.sort_by_key(|h| h.layer);

        let mut by_layer = BTreeMap::new();
        let mut start = 0;
        while start < hits.len() {
            let layer = hits[start].layer;
            let end = start + hits[start..].iter().take_while(|h| h.layer == layer).count();
            by_layer.insert(layer, start..end);
            start = end;
        }

        Self {
            event,
            hits,
            by_layer,
        }
    }

    /// Event number.
    #[must_use]
    pub fn event(&self) -> u64 {
        self.event
    }

    /// All hits, grouped by layer.
    #[must_use]
    pub fn hits(&self) -> &[Hit] {
        &self.hits
    }

    /// Hit by id.
    #[must_use]
    pub fn get(&self, id: HitId) -> Option<&Hit> {
        self.hits.get(id)
    }

    /// Total number of hits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Returns true if the event has no hits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Number of hits on a layer.
    #[must_use]
    pub fn count_on(&self, layer: LayerId) -> usize {
        self.by_layer.get(&layer).map_or(0, |range| range.len())
    }

    /// Hits on a layer together with their ids.
    pub fn on_layer(&self, layer: LayerId) -> impl Iterator<Item = (HitId, &Hit)> + '_ {
        let range = self.by_layer.get(&layer).cloned().unwrap_or(0..0);
        range.map(move |id| (id, &self.hits[id]))
    }

    /// Layers with at least one hit.
    pub fn layers(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.by_layer.keys().copied()
    }
}
