//! Three-hit track segments.
//!
//! A triplet is the straight line through two outer hits, checked against a
//! hit on a layer in between. The upstream and downstream arms of the
//! telescope each produce their own list (the downstream one is sometimes
//! called the driplet list).

use nalgebra::{Point3, Vector2};
use teletrack_core::config::LayerTriple;
use teletrack_core::hit::{Hit, HitId, HitTable};
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A straight segment through two outer hits, with the middle-hit residual.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Triplet {
    /// Layers the segment was formed on.
    pub layers: LayerTriple,
    /// Hit ids (first, middle, last) within the event's [`HitTable`].
    pub hits: [HitId; 3],
    /// Mean of the two outer hits.
    pub base: Point3<f64>,
    /// dx/dz and dy/dz.
    pub slope: Vector2<f64>,
    /// Middle hit minus prediction.
    pub residual: Vector2<f64>,
}

impl Triplet {
    /// Line through the outer hits `a` and `c`, evaluated against `b`.
    #[must_use]
    pub fn from_hits(layers: LayerTriple, ids: [HitId; 3], a: &Hit, b: &Hit, c: &Hit) -> Self {
        let base = Point3::new(
            0.5 * (a.x() + c.x()),
            0.5 * (a.y() + c.y()),
            0.5 * (a.z() + c.z()),
        );
        let dz = c.z() - a.z();
        let slope = Vector2::new((c.x() - a.x()) / dz, (c.y() - a.y()) / dz);
        let mut triplet = Self {
            layers,
            hits: ids,
            base,
            slope,
            residual: Vector2::zeros(),
        };
        triplet.residual = triplet.residual_at(b);
        triplet
    }

    /// Transverse position of the line at `z`.
    #[inline]
    #[must_use]
    pub fn position_at(&self, z: f64) -> Vector2<f64> {
        Vector2::new(self.base.x, self.base.y) + self.slope * (z - self.base.z)
    }

    /// Hit position minus the line position at the hit's z.
    #[inline]
    #[must_use]
    pub fn residual_at(&self, hit: &Hit) -> Vector2<f64> {
        hit.xy() - self.position_at(hit.z())
    }

    /// Id of the middle hit.
    #[must_use]
    pub fn middle(&self) -> HitId {
        self.hits[1]
    }
}

/// Forms triplets on one layer triple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripletFinder {
    /// Maximum |residual| per coordinate (mm).
    pub residual_cut: f64,
    /// Maximum |slope| per coordinate (rad).
    pub slope_cut: f64,
}

impl TripletFinder {
    /// Creates a finder with the given tolerances.
    #[must_use]
    pub fn new(residual_cut: f64, slope_cut: f64) -> Self {
        Self {
            residual_cut,
            slope_cut,
        }
    }

    /// All accepted triplets on `layers`.
    ///
    /// Every outer-hit pair is combined with every middle hit; a layer with
    /// no hits yields an empty list.
    #[must_use]
    pub fn find(&self, hits: &HitTable, layers: LayerTriple) -> Vec<Triplet> {
        let mut found = Vec::new();
        for (ia, a) in hits.on_layer(layers.first) {
            for (ic, c) in hits.on_layer(layers.last) {
                for (ib, b) in hits.on_layer(layers.middle) {
                    let triplet = Triplet::from_hits(layers, [ia, ib, ic], a, b, c);
                    if self.accepts(&triplet) {
                        found.push(triplet);
                    }
                }
            }
        }
        debug!(
            event = hits.event(),
            first = layers.first,
            candidates = found.len(),
            "triplet search done"
        );
        found
    }

    fn accepts(&self, triplet: &Triplet) -> bool {
        triplet.residual.x.abs() <= self.residual_cut
            && triplet.residual.y.abs() <= self.residual_cut
            && triplet.slope.x.abs() <= self.slope_cut
            && triplet.slope.y.abs() <= self.slope_cut
    }
}
