//! Matching of upstream and downstream segments into track candidates.

use crate::triplet::Triplet;
use nalgebra::{Point3, Vector2};
use std::collections::BTreeMap;
use teletrack_core::geometry::LayerId;
use teletrack_core::hit::{HitId, HitTable};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Floor for the squared kink in the closest-approach arithmetic.
const MIN_KINK_SQUARED: f64 = 1e-18;

/// A straight line parametrised by z.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StraightLine {
    /// A point on the line.
    pub origin: Point3<f64>,
    /// dx/dz and dy/dz.
    pub slope: Vector2<f64>,
}

impl StraightLine {
    /// Line through two points with different z.
    #[must_use]
    pub fn through(a: Point3<f64>, b: Point3<f64>) -> Self {
        let dz = b.z - a.z;
        Self {
            origin: a,
            slope: Vector2::new((b.x - a.x) / dz, (b.y - a.y) / dz),
        }
    }

    /// Transverse position at `z`.
    #[inline]
    #[must_use]
    pub fn position_at(&self, z: f64) -> Vector2<f64> {
        Vector2::new(self.origin.x, self.origin.y) + self.slope * (z - self.origin.z)
    }
}

/// A matched pair of segments.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrackCandidate {
    /// Upstream triplet.
    pub upstream: Triplet,
    /// Downstream triplet.
    pub downstream: Triplet,
    /// Downstream slope minus upstream slope.
    pub kink: Vector2<f64>,
    /// Closest approach of the two segments, within their z span.
    pub intersection: Point3<f64>,
    /// Distance of the two segments at the matching plane (mm).
    pub mismatch: f64,
    /// Hits associated on layers outside both triples.
    pub interior: BTreeMap<LayerId, HitId>,
}

impl TrackCandidate {
    /// Pairs two segments, projecting both to `reference_z`.
    #[must_use]
    pub fn new(upstream: Triplet, downstream: Triplet, reference_z: f64) -> Self {
        let up = upstream.position_at(reference_z);
        let down = downstream.position_at(reference_z);
        let delta = down - up;
        let kink = downstream.slope - upstream.slope;

        // Minimise |delta + kink * dz| over dz, staying between the segments.
        let dz = -delta.dot(&kink) / kink.norm_squared().max(MIN_KINK_SQUARED);
        let low = upstream.base.z.min(downstream.base.z).min(reference_z);
        let high = upstream.base.z.max(downstream.base.z).max(reference_z);
        let z = (reference_z + dz).clamp(low, high);
        let mid = 0.5 * (upstream.position_at(z) + downstream.position_at(z));

        Self {
            upstream,
            downstream,
            kink,
            intersection: Point3::new(mid.x, mid.y, z),
            mismatch: delta.norm(),
            interior: BTreeMap::new(),
        }
    }

    /// Straight reference through the base points of both segments.
    #[must_use]
    pub fn reference_line(&self) -> StraightLine {
        StraightLine::through(self.upstream.base, self.downstream.base)
    }

    /// Prediction at `z` from the segment on the same side of the
    /// intersection.
    #[must_use]
    pub fn predict(&self, z: f64) -> Vector2<f64> {
        if z < self.intersection.z {
            self.upstream.position_at(z)
        } else {
            self.downstream.position_at(z)
        }
    }

    /// Hit id on `layer`, from either segment or the interior association.
    #[must_use]
    pub fn hit_on(&self, layer: LayerId) -> Option<HitId> {
        let segments = [&self.upstream, &self.downstream];
        segments
            .iter()
            .find_map(|t| {
                t.layers
                    .ids()
                    .iter()
                    .position(|&l| l == layer)
                    .map(|slot| t.hits[slot])
            })
            .or_else(|| self.interior.get(&layer).copied())
    }
}

/// Matches segments at a common plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentMatcher {
    /// Matching plane (mm).
    pub reference_z: f64,
    /// Maximum Euclidean mismatch at the plane (mm).
    pub match_cut: f64,
    /// Maximum distance of an associated interior hit (mm).
    pub interior_cut: f64,
}

impl SegmentMatcher {
    /// Creates a matcher.
    #[must_use]
    pub fn new(reference_z: f64, match_cut: f64, interior_cut: f64) -> Self {
        Self {
            reference_z,
            match_cut,
            interior_cut,
        }
    }

    /// All upstream/downstream pairs within the match cut.
    ///
    /// No pair is dropped for sharing hits with another; the fit-quality
    /// selection resolves ambiguities.
    #[must_use]
    pub fn match_segments(&self, upstream: &[Triplet], downstream: &[Triplet]) -> Vec<TrackCandidate> {
        let mut candidates = Vec::new();
        for up in upstream {
            for down in downstream {
                let candidate = TrackCandidate::new(*up, *down, self.reference_z);
                if candidate.mismatch <= self.match_cut {
                    candidates.push(candidate);
                }
            }
        }
        candidates
    }

    /// Attaches, per interior layer, the closest hit within the interior cut.
    pub fn associate_interior(
        &self,
        candidate: &mut TrackCandidate,
        hits: &HitTable,
        interior: &[(LayerId, f64)],
    ) {
        for &(layer, z) in interior {
            let predicted = candidate.predict(z);
            let best = hits
                .on_layer(layer)
                .map(|(id, hit)| (id, (hit.xy() - predicted).norm()))
                .filter(|&(_, distance)| distance <= self.interior_cut)
                .min_by(|a, b| a.1.total_cmp(&b.1));
            if let Some((id, _)) = best {
                candidate.interior.insert(layer, id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use teletrack_core::config::LayerTriple;

    fn segment(layers: LayerTriple, base: Point3<f64>, slope: Vector2<f64>) -> Triplet {
        Triplet {
            layers,
            hits: [0, 1, 2],
            base,
            slope,
            residual: Vector2::zeros(),
        }
    }

    fn up(x: f64, sx: f64) -> Triplet {
        segment(
            LayerTriple::new(0, 1, 2),
            Point3::new(x, 0.0, 150.0),
            Vector2::new(sx, 0.0),
        )
    }

    fn down(x: f64, sx: f64) -> Triplet {
        segment(
            LayerTriple::new(3, 4, 5),
            Point3::new(x, 0.0, 750.0),
            Vector2::new(sx, 0.0),
        )
    }

    #[test]
    fn test_kink_and_intersection() {
        // Upstream straight along z, downstream leaves x = 0 at z = 450 with
        // slope 1e-3.
        let candidate = TrackCandidate::new(up(0.0, 0.0), down(0.3, 1e-3), 450.0);
        assert_relative_eq!(candidate.kink.x, 1e-3);
        assert_relative_eq!(candidate.mismatch, 0.0, epsilon = 1e-12);
        assert_relative_eq!(candidate.intersection.z, 450.0, epsilon = 1e-9);

        let shifted = TrackCandidate::new(up(0.0, 0.0), down(0.35, 1e-3), 450.0);
        assert_relative_eq!(shifted.mismatch, 0.05, epsilon = 1e-12);
        assert_relative_eq!(shifted.intersection.z, 400.0, epsilon = 1e-6);
    }

    #[test]
    fn test_parallel_segments_do_not_blow_up() {
        let candidate = TrackCandidate::new(up(0.0, 1e-3), down(0.65, 1e-3), 450.0);
        assert!(candidate.intersection.z.is_finite());
        assert_relative_eq!(candidate.intersection.z, 450.0);
    }

    #[test]
    fn test_nearly_parallel_intersection_stays_between_segments() {
        let behind = TrackCandidate::new(up(0.0, 0.0), down(0.31, 1e-6), 450.0);
        assert_relative_eq!(behind.intersection.z, 150.0);
        let ahead = TrackCandidate::new(up(0.0, 0.0), down(-0.31, 1e-6), 450.0);
        assert_relative_eq!(ahead.intersection.z, 750.0);
    }

    #[test]
    fn test_match_cut() {
        let ups = [up(0.0, 0.0), up(1.0, 0.0)];
        let downs = [down(0.0, 0.0), down(0.05, 0.0), down(2.0, 0.0)];
        let matcher = SegmentMatcher::new(450.0, 0.1, 0.2);
        let candidates = matcher.match_segments(&ups, &downs);
        assert_eq!(candidates.len(), 2);
        for c in &candidates {
            let delta = c.upstream.position_at(450.0) - c.downstream.position_at(450.0);
            assert!(delta.x.abs() <= 0.1 && delta.y.abs() <= 0.1);
        }
    }

    #[test]
    fn test_reference_line_through_bases() {
        let candidate = TrackCandidate::new(up(0.0, 0.0), down(0.6, 0.0), 450.0);
        let line = candidate.reference_line();
        assert_relative_eq!(line.position_at(150.0).x, 0.0);
        assert_relative_eq!(line.position_at(750.0).x, 0.6);
        assert_relative_eq!(line.slope.x, 1e-3);
    }

    #[test]
    fn test_hit_on() {
        let mut candidate = TrackCandidate::new(up(0.0, 0.0), down(0.0, 0.0), 450.0);
        candidate.interior.insert(6, 42);
        assert_eq!(candidate.hit_on(1), Some(1));
        assert_eq!(candidate.hit_on(5), Some(2));
        assert_eq!(candidate.hit_on(6), Some(42));
        assert_eq!(candidate.hit_on(7), None);
    }
}
