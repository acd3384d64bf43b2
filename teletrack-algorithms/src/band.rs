//! Symmetric bordered band matrix.
//!
//! The normal equations of the broken-lines fit couple each node only to its
//! neighbours, apart from a few global parameters. The matrix is stored as a
//! dense border, a dense mixed block and a band:
//!
//! ```text
//! | border  mixed |
//! | mixedᵀ  band  |
//! ```
//!
//! The band is solved by a root-free Cholesky decomposition, the border by
//! its Schur complement.
#![allow(clippy::many_single_char_names, clippy::needless_range_loop)]

use crate::error::FitError;
use nalgebra::{DMatrix, DVector};

/// Relative size below which a pivot counts as vanished.
const PIVOT_SCALE: f64 = 16.0;

/// Relative threshold of the border pseudo-inverse.
const BORDER_EPSILON: f64 = 1e-12;

/// Symmetric matrix with a dense border and a band of fixed width.
#[derive(Debug, Clone, PartialEq)]
pub struct BorderedBandMatrix {
    border_size: usize,
    band_size: usize,
    bandwidth: usize,
    border: DMatrix<f64>,
    mixed: DMatrix<f64>,
    /// `band[(i - j, j)]` holds element `(i, j)` of the band block, `i >= j`.
    band: DMatrix<f64>,
}

impl BorderedBandMatrix {
    /// Zero matrix of `border_size + band_size` rows.
    #[must_use]
    pub fn new(border_size: usize, band_size: usize, bandwidth: usize) -> Self {
        Self {
            border_size,
            band_size,
            bandwidth,
            border: DMatrix::zeros(border_size, border_size),
            mixed: DMatrix::zeros(border_size, band_size),
            band: DMatrix::zeros(bandwidth + 1, band_size),
        }
    }

    /// Total number of rows.
    #[must_use]
    pub fn size(&self) -> usize {
        self.border_size + self.band_size
    }

    /// Adds a symmetric block at the given (distinct) global indices.
    ///
    /// Only the lower triangle of `block` is read. Elements falling outside
    /// the band are ignored.
    pub fn add_block(&mut self, indices: &[usize], block: &DMatrix<f64>) {
        let nb = self.border_size;
        for (a, &ia) in indices.iter().enumerate() {
            for (b, &ib) in indices.iter().enumerate() {
                if ia < ib {
                    continue;
                }
                let value = block[(a.max(b), a.min(b))];
                if ia < nb {
                    self.border[(ia, ib)] += value;
                    if ia != ib {
                        self.border[(ib, ia)] += value;
                    }
                } else if ib < nb {
                    self.mixed[(ib, ia - nb)] += value;
                } else {
                    let (i, j) = (ia - nb, ib - nb);
                    debug_assert!(
                        value == 0.0 || i - j <= self.bandwidth,
                        "non-zero element outside band"
                    );
                    if i - j <= self.bandwidth {
                        self.band[(i - j, j)] += value;
                    }
                }
            }
        }
    }

    /// Element `(i, j)` of the full matrix.
    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        let nb = self.border_size;
        let (i, j) = (i.max(j), i.min(j));
        if i < nb {
            self.border[(i, j)]
        } else if j < nb {
            self.mixed[(j, i - nb)]
        } else if i - j <= self.bandwidth {
            self.band[(i - j, j - nb)]
        } else {
            0.0
        }
    }

    /// Solves `A x = rhs` and returns the solution with access to the
    /// border, mixed and band elements of the inverse.
    ///
    /// # Errors
    /// Returns [`FitError::Singular`] or [`FitError::NotPositiveDefinite`]
    /// if the band block cannot be decomposed.
    pub fn solve(mut self, rhs: &DVector<f64>) -> Result<(DVector<f64>, BandInverse), FitError> {
        let nb = self.border_size;
        let n = self.band_size;
        self.decompose_band()?;

        let b1 = rhs.rows(0, nb).into_owned();
        let b2 = rhs.rows(nb, n).into_owned();

        // Xt = mixed * band⁻¹, row by row.
        let mut xt = DMatrix::zeros(nb, n);
        for k in 0..nb {
            let row = self.solve_band(&self.mixed.row(k).transpose());
            xt.set_row(k, &row.transpose());
        }

        let schur = &self.border - &xt * self.mixed.transpose();
        let border_inverse = if nb == 0 {
            DMatrix::zeros(0, 0)
        } else {
            let scale = schur.amax().max(1.0);
            schur
                .pseudo_inverse(BORDER_EPSILON * scale)
                .map_err(|_| FitError::Singular(0))?
        };

        let x1 = &border_inverse * (&b1 - &xt * &b2);
        let x2 = self.solve_band(&b2) - xt.transpose() * &x1;

        let mut solution = DVector::zeros(nb + n);
        solution.rows_mut(0, nb).copy_from(&x1);
        solution.rows_mut(nb, n).copy_from(&x2);

        let mut band_inverse = self.invert_band();
        let correction = xt.transpose() * &border_inverse * &xt;
        for j in 0..n {
            for d in 0..=self.bandwidth.min(n - 1 - j) {
                band_inverse[(d, j)] += correction[(j + d, j)];
            }
        }

        let mixed_inverse = -(&border_inverse * &xt);
        Ok((
            solution,
            BandInverse {
                border_size: nb,
                bandwidth: self.bandwidth,
                border: border_inverse,
                mixed: mixed_inverse,
                band: band_inverse,
            },
        ))
    }

    /// Root-free Cholesky decomposition `L D Lᵀ` of the band, in place.
    ///
    /// Afterwards `band[(0, i)]` holds `1 / D_i` and the sub-diagonals hold
    /// `L`.
    fn decompose_band(&mut self) -> Result<(), FitError> {
        let n = self.band_size;
        let bw = self.bandwidth;
        let nb = self.border_size;
        let original: Vec<f64> = (0..n).map(|i| self.band[(0, i)] * PIVOT_SCALE).collect();

        for i in 0..n {
            let pivot = self.band[(0, i)];
            if pivot + original[i] == original[i] {
                self.band[(0, i)] = 0.0;
                return Err(FitError::Singular(nb + i));
            }
            if pivot < 0.0 {
                return Err(FitError::NotPositiveDefinite(nb + i));
            }
            self.band[(0, i)] = 1.0 / pivot;
            let reach = bw.min(n - 1 - i);
            for j in 1..=reach {
                let ratio = self.band[(j, i)] * self.band[(0, i)];
                for k in 0..=reach - j {
                    self.band[(k, i + j)] -= self.band[(k + j, i)] * ratio;
                }
                self.band[(j, i)] = ratio;
            }
        }
        Ok(())
    }

    /// Solves with the decomposed band.
    fn solve_band(&self, rhs: &DVector<f64>) -> DVector<f64> {
        let n = self.band_size;
        let bw = self.bandwidth;
        let mut x = rhs.clone();
        for i in 0..n {
            for j in 1..=bw.min(n - 1 - i) {
                x[i + j] -= self.band[(j, i)] * x[i];
            }
        }
        for i in (0..n).rev() {
            let mut value = self.band[(0, i)] * x[i];
            for j in 1..=bw.min(n - 1 - i) {
                value -= self.band[(j, i)] * x[i + j];
            }
            x[i] = value;
        }
        x
    }

    /// Band part of the inverse of the decomposed band.
    fn invert_band(&self) -> DMatrix<f64> {
        let n = self.band_size;
        let bw = self.bandwidth;
        let mut inverse = DMatrix::zeros(bw + 1, n);
        for i in (0..n).rev() {
            let mut value = self.band[(0, i)];
            for j in (i.saturating_sub(bw)..=i).rev() {
                for k in j + 1..=(n - 1).min(j + bw) {
                    value -= inverse[(i.abs_diff(k), i.min(k))] * self.band[(k - j, j)];
                }
                inverse[(i - j, j)] = value;
                value = 0.0;
            }
        }
        inverse
    }
}

/// Border, mixed and band elements of the inverse of a
/// [`BorderedBandMatrix`].
#[derive(Debug, Clone, PartialEq)]
pub struct BandInverse {
    border_size: usize,
    bandwidth: usize,
    border: DMatrix<f64>,
    mixed: DMatrix<f64>,
    band: DMatrix<f64>,
}

impl BandInverse {
    /// Element `(i, j)` of the inverse, if it lies in the stored pattern.
    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> Option<f64> {
        let nb = self.border_size;
        let (i, j) = (i.max(j), i.min(j));
        if i < nb {
            Some(self.border[(i, j)])
        } else if j < nb {
            Some(self.mixed[(j, i - nb)])
        } else if i - j <= self.bandwidth {
            self.band.get((i - j, j - nb)).copied()
        } else {
            None
        }
    }

    /// Covariance sub-matrix over `indices`; elements outside the pattern
    /// are zero.
    #[must_use]
    pub fn block(&self, indices: &[usize]) -> DMatrix<f64> {
        DMatrix::from_fn(indices.len(), indices.len(), |a, b| {
            self.get(indices[a], indices[b]).unwrap_or(0.0)
        })
    }
}
