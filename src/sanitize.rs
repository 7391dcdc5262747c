//! Repair of non-finite connectivity estimates.
//!
//! Partial-correlation and precision-matrix estimators routinely produce
//! `NaN`/`±Inf` entries and arbitrary diagonals. [`MatrixSanitizer`] maps
//! every non-finite value to a fixed replacement and then overwrites the
//! diagonal with the self-correlation sentinel, so the result is finite,
//! has a deterministic diagonal, and sanitizing twice equals sanitizing once.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixSanitizer {
    pub nan: f64,
    pub pos_inf: f64,
    pub neg_inf: f64,
    pub diagonal: f64,
}

impl Default for MatrixSanitizer {
    fn default() -> Self {
        Self {
            nan: 0.0,
            pos_inf: 1.0,
            neg_inf: -1.0,
            diagonal: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SanitizeReport {
    pub nan: usize,
    pub pos_inf: usize,
    pub neg_inf: usize,
}

impl SanitizeReport {
    pub fn repaired(&self) -> usize {
        self.nan + self.pos_inf + self.neg_inf
    }
}

impl MatrixSanitizer {
    pub fn validate(&self) -> Result<(), KiraError> {
        let values = [self.nan, self.pos_inf, self.neg_inf, self.diagonal];
        if values.iter().any(|value| !value.is_finite()) {
            return Err(KiraError::ConfigInvalid(
                "sanitize replacement values must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Sanitizes `matrix` in place and reports what was replaced.
    ///
    /// Counts cover off-diagonal and diagonal entries alike; the diagonal is
    /// overwritten afterwards regardless of what it held.
    pub fn sanitize_in_place(&self, matrix: &mut Array2<f64>) -> Result<SanitizeReport, KiraError> {
        let (rows, cols) = matrix.dim();
        if rows != cols {
            return Err(KiraError::DimensionMismatch {
                expected: rows,
                found: cols,
            });
        }

        let mut report = SanitizeReport::default();
        matrix.mapv_inplace(|value| {
            if value.is_nan() {
                report.nan += 1;
                self.nan
            } else if value == f64::INFINITY {
                report.pos_inf += 1;
                self.pos_inf
            } else if value == f64::NEG_INFINITY {
                report.neg_inf += 1;
                self.neg_inf
            } else {
                value
            }
        });
        matrix.diag_mut().fill(self.diagonal);
        Ok(report)
    }

    pub fn sanitize(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, KiraError> {
        let mut out = matrix.clone();
        self.sanitize_in_place(&mut out)?;
        Ok(out)
    }
}
