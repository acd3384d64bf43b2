//! Cluster shapes and their conversion into hit records.
//!
//! Clusters arrive from the decoding stage in one of three layouts. All of
//! them expose the same footprint / centroid / charge view, so the rest of
//! the pipeline never needs to know which one it got.
#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use crate::alignment::AlignmentConstant;
use crate::error::{Error, Result};
use crate::geometry::Layer;
use crate::hit::{Footprint, HitRecord};
use nalgebra::Point2;
use std::collections::BTreeSet;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A single fired pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Pixel {
    /// Column index.
    pub column: i32,
    /// Row index.
    pub row: i32,
    /// Collected charge (arbitrary units, zero for binary readout).
    pub charge: f32,
}

impl Pixel {
    /// Creates a new pixel.
    #[inline]
    #[must_use]
    pub fn new(column: i32, row: i32, charge: f32) -> Self {
        Self {
            column,
            row,
            charge,
        }
    }
}

/// A pixel with a physical position, for sensors with irregular pitch.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GeometricPixel {
    /// Column index.
    pub column: i32,
    /// Row index.
    pub row: i32,
    /// Local x of the pixel centre (mm).
    pub x: f64,
    /// Local y of the pixel centre (mm).
    pub y: f64,
    /// Collected charge.
    pub charge: f32,
}

/// Cluster layouts delivered by the decoding stage.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ClusterShape {
    /// Dense frame of charges anchored at `(column, row)`, row-major,
    /// `width * height` entries. Zero-charge cells are not part of the cluster.
    FixedFrame {
        column: i32,
        row: i32,
        width: u16,
        height: u16,
        charges: Vec<f32>,
    },
    /// Explicit list of fired pixels.
    Sparse(Vec<Pixel>),
    /// Pixels carrying their own physical position.
    Geometric(Vec<GeometricPixel>),
}

impl ClusterShape {
    /// Fired pixels as `(column, row, charge)`.
    fn pixels(&self) -> Vec<Pixel> {
        match self {
            ClusterShape::FixedFrame {
                column,
                row,
                width,
                height,
                charges,
            } => {
                let width = usize::from(*width);
                charges
                    .iter()
                    .take(width * usize::from(*height))
                    .enumerate()
                    .filter(|(_, &q)| q > 0.0)
                    .map(|(idx, &q)| {
                        Pixel::new(column + (idx % width) as i32, row + (idx / width) as i32, q)
                    })
                    .collect()
            }
            ClusterShape::Sparse(pixels) => pixels.clone(),
            ClusterShape::Geometric(pixels) => pixels
                .iter()
                .map(|p| Pixel::new(p.column, p.row, p.charge))
                .collect(),
        }
    }

    /// Number of fired pixels.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            ClusterShape::FixedFrame { .. } => self.pixels().len(),
            ClusterShape::Sparse(pixels) => pixels.len(),
            ClusterShape::Geometric(pixels) => pixels.len(),
        }
    }

    /// Distinct columns, distinct rows and pixel count.
    #[must_use]
    pub fn footprint(&self) -> Footprint {
        let pixels = self.pixels();
        let columns: BTreeSet<i32> = pixels.iter().map(|p| p.column).collect();
        let rows: BTreeSet<i32> = pixels.iter().map(|p| p.row).collect();
        let clamp = |n: usize| n.min(usize::from(u16::MAX)) as u16;
        Footprint::new(clamp(columns.len()), clamp(rows.len()), clamp(pixels.len()))
    }

    /// Sum of pixel charges.
    #[must_use]
    pub fn total_charge(&self) -> f64 {
        self.pixels().iter().map(|p| f64::from(p.charge)).sum()
    }

    /// Charge-weighted centroid in pixel units (column, row).
    ///
    /// Falls back to the arithmetic mean if all charges are zero.
    ///
    /// # Errors
    /// Returns [`Error::EmptyCluster`] for a cluster without pixels.
    pub fn centroid(&self) -> Result<Point2<f64>> {
        let pixels = self.pixels();
        weighted_mean(
            pixels
                .iter()
                .map(|p| (f64::from(p.column), f64::from(p.row), f64::from(p.charge))),
        )
    }

    /// Centroid in local sensor coordinates (mm).
    ///
    /// Geometric clusters use the stored pixel positions; the other layouts
    /// use the layer's pixel matrix, or pixel units if the layer has none.
    ///
    /// # Errors
    /// Returns [`Error::EmptyCluster`] for a cluster without pixels.
    pub fn local_position(&self, layer: &Layer) -> Result<Point2<f64>> {
        if let ClusterShape::Geometric(pixels) = self {
            return weighted_mean(pixels.iter().map(|p| (p.x, p.y, f64::from(p.charge))));
        }
        let centroid = self.centroid()?;
        Ok(match layer.sensor {
            Some(sensor) => {
                let (x, y) = sensor.pixel_to_local(centroid.x, centroid.y);
                Point2::new(x, y)
            }
            None => centroid,
        })
    }

    /// Converts the cluster into a hit record on `layer`.
    ///
    /// # Errors
    /// Returns [`Error::EmptyCluster`] for a cluster without pixels.
    pub fn to_hit_record(
        &self,
        layer: &Layer,
        alignment: &AlignmentConstant,
    ) -> Result<HitRecord> {
        let local = self.local_position(layer)?;
        Ok(HitRecord {
            layer: layer.id,
            position: alignment.local_to_global(local, layer.z),
            local,
            footprint: self.footprint(),
        })
    }
}

fn weighted_mean(values: impl Iterator<Item = (f64, f64, f64)>) -> Result<Point2<f64>> {
    let mut n = 0usize;
    let (mut sum_x, mut sum_y) = (0.0, 0.0);
    let (mut wsum_x, mut wsum_y, mut wsum) = (0.0, 0.0, 0.0);
    for (x, y, w) in values {
        n += 1;
        sum_x += x;
        sum_y += y;
        wsum_x += x * w;
        wsum_y += y * w;
        wsum += w;
    }
    if n == 0 {
        return Err(Error::EmptyCluster);
    }
    if wsum > 0.0 {
        Ok(Point2::new(wsum_x / wsum, wsum_y / wsum))
    } else {
        let n = n as f64;
        Ok(Point2::new(sum_x / n, sum_y / n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SensorGeometry;
    use approx::assert_relative_eq;

    #[test]
    fn test_sparse_weighted_centroid() {
        let cluster = ClusterShape::Sparse(vec![Pixel::new(0, 0, 30.0), Pixel::new(2, 0, 10.0)]);
        let c = cluster.centroid().unwrap();
        // (0*30 + 2*10) / 40
        assert_relative_eq!(c.x, 0.5);
        assert_relative_eq!(c.y, 0.0);
        assert_relative_eq!(cluster.total_charge(), 40.0);
        assert_eq!(cluster.footprint(), Footprint::new(2, 1, 2));
    }

    #[test]
    fn test_zero_charge_falls_back_to_mean() {
        let cluster = ClusterShape::Sparse(vec![Pixel::new(10, 20, 0.0), Pixel::new(30, 40, 0.0)]);
        let c = cluster.centroid().unwrap();
        assert_relative_eq!(c.x, 20.0);
        assert_relative_eq!(c.y, 30.0);
        assert!(!c.x.is_nan());
    }

    #[test]
    fn test_fixed_frame_skips_empty_cells() {
        // 3x2 frame at (5, 7):
        // row 7: 1 0 1
        // row 8: 0 2 0
        let cluster = ClusterShape::FixedFrame {
            column: 5,
            row: 7,
            width: 3,
            height: 2,
            charges: vec![1.0, 0.0, 1.0, 0.0, 2.0, 0.0],
        };
        assert_eq!(cluster.size(), 3);
        assert_eq!(cluster.footprint(), Footprint::new(3, 2, 3));
        let c = cluster.centroid().unwrap();
        assert_relative_eq!(c.x, 6.0);
        assert_relative_eq!(c.y, 7.5);
    }

    #[test]
    fn test_geometric_uses_pixel_positions() {
        let cluster = ClusterShape::Geometric(vec![
            GeometricPixel {
                column: 0,
                row: 0,
                x: -1.0,
                y: 0.5,
                charge: 1.0,
            },
            GeometricPixel {
                column: 1,
                row: 0,
                x: 1.0,
                y: 0.5,
                charge: 1.0,
            },
        ]);
        let layer = Layer::new(3, 100.0, 1e-3);
        let local = cluster.local_position(&layer).unwrap();
        assert_relative_eq!(local.x, 0.0);
        assert_relative_eq!(local.y, 0.5);
    }

    #[test]
    fn test_empty_cluster_errors() {
        assert!(ClusterShape::Sparse(Vec::new()).centroid().is_err());
    }

    #[test]
    fn test_to_hit_record_applies_sensor_and_alignment() {
        let sensor = SensorGeometry {
            pitch_x: 0.02,
            pitch_y: 0.02,
            columns: 100,
            rows: 100,
        };
        let layer = Layer::new(2, 300.0, 1e-3).with_sensor(sensor);
        let alignment = AlignmentConstant::from_shift(0.1, -0.2, 0.5);
        let cluster = ClusterShape::Sparse(vec![Pixel::new(50, 49, 1.0)]);

        let record = cluster.to_hit_record(&layer, &alignment).unwrap();
        assert_eq!(record.layer, 2);
        assert_relative_eq!(record.local.x, 0.01, epsilon = 1e-12);
        assert_relative_eq!(record.local.y, -0.01, epsilon = 1e-12);
        assert_relative_eq!(record.position.x, 0.11, epsilon = 1e-12);
        assert_relative_eq!(record.position.y, -0.21, epsilon = 1e-12);
        assert_relative_eq!(record.position.z, 300.5, epsilon = 1e-12);
    }
}
