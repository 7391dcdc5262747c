use ndarray::{Array2, ArrayView2, Axis};

use crate::error::KiraError;
use crate::sanitize::MatrixSanitizer;

/// Symmetric, finite ROI-by-ROI correlation matrix with a sentinel diagonal.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityMatrix(Array2<f64>);

impl ConnectivityMatrix {
    /// Wraps an externally estimated matrix after sanitizing it.
    pub fn from_estimate(
        mut matrix: Array2<f64>,
        sanitizer: &MatrixSanitizer,
    ) -> Result<Self, KiraError> {
        sanitizer.sanitize_in_place(&mut matrix)?;
        Ok(Self(matrix))
    }

    pub fn n_rois(&self) -> usize {
        self.0.nrows()
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.0.view()
    }

    pub fn into_inner(self) -> Array2<f64> {
        self.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectivityBuilder {
    sanitizer: MatrixSanitizer,
}

impl ConnectivityBuilder {
    pub fn new(sanitizer: MatrixSanitizer) -> Self {
        Self { sanitizer }
    }

    /// Pearson correlation between the rows of `segment` ([n_rois, T']).
    ///
    /// Zero-variance rows correlate as 0 with everything.
    pub fn build(&self, segment: ArrayView2<'_, f64>) -> Result<ConnectivityMatrix, KiraError> {
        let (n_rois, samples) = segment.dim();
        if n_rois == 0 {
            return Err(KiraError::InvalidMatrix("segment has no ROIs".to_string()));
        }
        if samples < 2 {
            return Err(KiraError::InvalidMatrix(format!(
                "segment has {samples} samples, need at least 2"
            )));
        }

        let means = segment
            .mean_axis(Axis(1))
            .ok_or_else(|| KiraError::InvalidMatrix("empty segment".to_string()))?;
        let mut centered = segment.to_owned();
        for (mut row, mean) in centered.axis_iter_mut(Axis(0)).zip(means.iter()) {
            row.mapv_inplace(|value| value - mean);
        }
        let norms = centered.map_axis(Axis(1), |row| row.dot(&row).sqrt());

        let mut matrix = Array2::<f64>::zeros((n_rois, n_rois));
        for i in 0..n_rois {
            for j in (i + 1)..n_rois {
                let denom = norms[i] * norms[j];
                let r = centered.row(i).dot(&centered.row(j)) / denom;
                let r = if r.is_nan() { 0.0 } else { r.clamp(-1.0, 1.0) };
                matrix[[i, j]] = r;
                matrix[[j, i]] = r;
            }
        }

        ConnectivityMatrix::from_estimate(matrix, &self.sanitizer)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn perfectly_correlated_and_anticorrelated_rows() {
        let segment = array![
            [1.0, 2.0, 3.0, 4.0],
            [2.0, 4.0, 6.0, 8.0],
            [4.0, 3.0, 2.0, 1.0]
        ];
        let matrix = ConnectivityBuilder::default().build(segment.view()).unwrap();
        let m = matrix.view();
        assert!((m[[0, 1]] - 1.0).abs() < 1e-12);
        assert!((m[[0, 2]] + 1.0).abs() < 1e-12);
        assert_eq!(m[[1, 1]], 1.0);
    }

    #[test]
    fn zero_variance_roi_maps_to_zero() {
        let segment = array![[1.0, 2.0, 3.0], [5.0, 5.0, 5.0]];
        let matrix = ConnectivityBuilder::default().build(segment.view()).unwrap();
        assert_eq!(matrix.view()[[0, 1]], 0.0);
        assert_eq!(matrix.view()[[1, 0]], 0.0);
        assert_eq!(matrix.view()[[1, 1]], 1.0);
    }

    #[test]
    fn output_is_finite_and_symmetric() {
        let segment = Array2::from_shape_fn((12, 9), |(r, t)| {
            if r == 4 {
                0.0
            } else {
                ((r * 31 + t * 7) as f64).sin() * (r as f64 + 1.0)
            }
        });
        let matrix = ConnectivityBuilder::default().build(segment.view()).unwrap();
        let m = matrix.view();
        for i in 0..12 {
            assert_eq!(m[[i, i]], 1.0);
            for j in 0..12 {
                assert!(m[[i, j]].is_finite());
                assert!((m[[i, j]] - m[[j, i]]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn single_sample_is_rejected() {
        let segment = array![[1.0], [2.0]];
        assert!(ConnectivityBuilder::default().build(segment.view()).is_err());
    }
}
