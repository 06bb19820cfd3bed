//! Linear solves for the Newton step
//!
//! A banded matrix with two dense trailing columns is eliminated without
//! pivoting. Anything that does not fit the band, or hits a tiny pivot,
//! goes through dense Gaussian elimination with partial pivoting.

use thiserror::Error;

/// Pivots smaller than this are treated as zero
pub const PIVOT_EPSILON: f64 = 1e-12;

/// Number of dense columns kept at the right edge
const TAIL: usize = 2;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BandedError {
    #[error("Singular pivot at row {row}")]
    SingularPivot { row: usize },
}

/// Square matrix with `left`/`right` half-bandwidths plus two full
/// columns at the right edge, and its right-hand side
#[derive(Debug, Clone)]
pub struct BandedMatrix {
    n: usize,
    left: usize,
    right: usize,
    band: Vec<f64>,
    tail: Vec<[f64; TAIL]>,
    rhs: Vec<f64>,
}

impl BandedMatrix {
    /// Zero matrix; needs at least three rows
    pub fn new(n: usize, left: usize, right: usize) -> Option<Self> {
        if n <= TAIL || left == 0 {
            return None;
        }
        Some(Self {
            n,
            left,
            right,
            band: vec![0.0; n * (left + right + 1)],
            tail: vec![[0.0; TAIL]; n],
            rhs: vec![0.0; n],
        })
    }

    /// Build from a dense system, `None` when a nonzero falls outside
    /// the band
    pub fn from_dense(a: &[Vec<f64>], b: &[f64], left: usize, right: usize) -> Option<Self> {
        let mut m = Self::new(b.len(), left, right)?;
        for (i, row) in a.iter().enumerate() {
            for (j, &value) in row.iter().enumerate() {
                if value != 0.0 && !m.set(i, j, value) {
                    return None;
                }
            }
        }
        m.rhs.copy_from_slice(b);
        Some(m)
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Check whether entry `(i, j)` has storage
    pub fn fits(&self, i: usize, j: usize) -> bool {
        j >= self.n - TAIL || (j + self.left >= i && j <= i + self.right)
    }

    fn band_index(&self, i: usize, j: usize) -> usize {
        i * (self.left + self.right + 1) + (j + self.left - i)
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        if j >= self.n - TAIL {
            self.tail[i][j - (self.n - TAIL)]
        } else if self.fits(i, j) {
            self.band[self.band_index(i, j)]
        } else {
            0.0
        }
    }

    /// Store a value; false when `(i, j)` is outside the band
    pub fn set(&mut self, i: usize, j: usize, value: f64) -> bool {
        if j >= self.n - TAIL {
            self.tail[i][j - (self.n - TAIL)] = value;
        } else if self.fits(i, j) {
            let k = self.band_index(i, j);
            self.band[k] = value;
        } else {
            return false;
        }
        true
    }

    pub fn set_rhs(&mut self, i: usize, value: f64) {
        self.rhs[i] = value;
    }

    /// Last column stored in the band proper for row `i`
    fn band_end(&self, i: usize) -> Option<usize> {
        let last_band_col = self.n - TAIL - 1;
        (i <= last_band_col).then(|| (i + self.right).min(last_band_col))
    }

    /// Solve in place by elimination without pivoting
    pub fn solve(mut self) -> Result<Vec<f64>, BandedError> {
        let n = self.n;
        for i in 0..n {
            let pivot = self.get(i, i);
            if pivot.abs() < PIVOT_EPSILON {
                return Err(BandedError::SingularPivot { row: i });
            }
            let end = self.band_end(i);
            for ip in (i + 1)..=(i + self.left).min(n - 1) {
                let factor = self.get(ip, i) / pivot;
                if factor == 0.0 {
                    continue;
                }
                if let Some(end) = end {
                    for j in i..=end {
                        let v = self.get(ip, j) - factor * self.get(i, j);
                        self.set(ip, j, v);
                    }
                }
                for t in 0..TAIL {
                    self.tail[ip][t] -= factor * self.tail[i][t];
                }
                self.rhs[ip] -= factor * self.rhs[i];
            }
        }

        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let mut sum = self.rhs[i];
            if let Some(end) = self.band_end(i) {
                for j in (i + 1)..=end {
                    sum -= self.get(i, j) * x[j];
                }
            }
            for t in 0..TAIL {
                let col = n - TAIL + t;
                if col > i {
                    sum -= self.tail[i][t] * x[col];
                }
            }
            x[i] = sum / self.get(i, i);
        }
        Ok(x)
    }
}

/// Gaussian elimination with partial pivoting, `None` when singular
#[allow(clippy::needless_range_loop)]
pub fn dense_solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    if n == 0 {
        return Some(vec![]);
    }

    // Forward elimination
    for i in 0..n {
        let mut max_row = i;
        let mut max_val = a[i][i].abs();
        for k in (i + 1)..n {
            if a[k][i].abs() > max_val {
                max_val = a[k][i].abs();
                max_row = k;
            }
        }

        if !(max_val >= PIVOT_EPSILON) {
            return None;
        }

        if max_row != i {
            a.swap(i, max_row);
            b.swap(i, max_row);
        }

        for k in (i + 1)..n {
            let factor = a[k][i] / a[i][i];
            if factor == 0.0 {
                continue;
            }
            for j in i..n {
                a[k][j] -= factor * a[i][j];
            }
            b[k] -= factor * b[i];
        }
    }

    // Back substitution
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        x[i] = b[i];
        for j in (i + 1)..n {
            x[i] -= a[i][j] * x[j];
        }
        x[i] /= a[i][i];
    }

    Some(x)
}

/// Solve `a x = b`, banded first and dense when that is not possible
pub fn solve_linear(a: Vec<Vec<f64>>, b: Vec<f64>, left: usize, right: usize) -> Option<Vec<f64>> {
    if let Some(banded) = BandedMatrix::from_dense(&a, &b, left, right) {
        match banded.solve() {
            Ok(x) if x.iter().all(|v| v.is_finite()) => return Some(x),
            Ok(_) => tracing::debug!("Banded solve produced non-finite values, retrying dense"),
            Err(e) => tracing::debug!("{}, retrying dense", e),
        }
    }
    dense_solve(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_banded(rng: &mut StdRng, n: usize, left: usize, right: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
        let mut a = vec![vec![0.0_f64; n]; n];
        for i in 0..n {
            for j in 0..n {
                let in_band = j >= n - 2 || (j + left >= i && j <= i + right);
                if in_band && i != j {
                    a[i][j] = rng.gen_range(-1.0..1.0);
                }
            }
            let off: f64 = a[i].iter().map(|v| v.abs()).sum();
            a[i][i] = off + rng.gen_range(1.0..2.0);
        }
        let b = (0..n).map(|_| rng.gen_range(-10.0..10.0)).collect();
        (a, b)
    }

    #[test]
    fn test_banded_matches_dense() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..32 {
            let n = rng.gen_range(3..40);
            let left = rng.gen_range(1..5);
            let right = rng.gen_range(1..5);
            let (a, b) = random_banded(&mut rng, n, left, right);

            let banded = BandedMatrix::from_dense(&a, &b, left, right).unwrap();
            let x = banded.solve().unwrap();
            let reference = dense_solve(a.clone(), b.clone()).unwrap();
            for (got, want) in x.iter().zip(&reference) {
                assert_relative_eq!(*got, *want, epsilon = 1e-9, max_relative = 1e-9);
            }

            // And the solution actually satisfies the system
            for i in 0..n {
                let lhs: f64 = (0..n).map(|j| a[i][j] * x[j]).sum();
                assert_relative_eq!(lhs, b[i], epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn test_outside_band_is_rejected() {
        let mut a = vec![vec![0.0; 6]; 6];
        for i in 0..6 {
            a[i][i] = 1.0;
        }
        a[5][0] = 0.5;
        assert!(BandedMatrix::from_dense(&a, &[1.0; 6], 2, 2).is_none());

        let x = solve_linear(a, vec![1.0; 6], 2, 2).unwrap();
        assert_relative_eq!(x[5], 0.5);
    }

    #[test]
    fn test_zero_pivot_falls_back_to_dense() {
        let a = vec![
            vec![0.0, 1.0, 0.0],
            vec![1.0, 0.0, 0.0],
            vec![0.0, 0.0, 2.0],
        ];
        let b = vec![3.0, 4.0, 8.0];
        let banded = BandedMatrix::from_dense(&a, &b, 1, 1).unwrap();
        assert_eq!(banded.solve(), Err(BandedError::SingularPivot { row: 0 }));

        let x = solve_linear(a, b, 1, 1).unwrap();
        assert_relative_eq!(x[0], 4.0);
        assert_relative_eq!(x[1], 3.0);
        assert_relative_eq!(x[2], 4.0);
    }

    #[test]
    fn test_singular_matrix_is_reported() {
        let a = vec![
            vec![1.0, 2.0, 0.0, 0.0],
            vec![2.0, 4.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0, 0.0],
            vec![0.0, 0.0, 0.0, 1.0],
        ];
        assert!(solve_linear(a, vec![1.0, 2.0, 3.0, 4.0], 1, 1).is_none());
    }
}
