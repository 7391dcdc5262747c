use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use ndarray::{Array2, ArrayView2, Axis, s};

use crate::error::KiraError;
use crate::nifti::{Atlas, Scan};
use crate::window::TrialWindow;

/// ROI-averaged signal, `[n_rois, T]`, rows ordered like `regions`.
#[derive(Debug, Clone, PartialEq)]
pub struct RoiTimeSeries {
    pub regions: Vec<i32>,
    pub values: Array2<f64>,
}

impl RoiTimeSeries {
    pub fn n_rois(&self) -> usize {
        self.values.nrows()
    }

    pub fn total_volumes(&self) -> usize {
        self.values.ncols()
    }

    pub fn segment(&self, window: &TrialWindow) -> ArrayView2<'_, f64> {
        self.values
            .slice(s![.., window.start_volume..window.end_volume])
    }
}

pub trait TimeSeriesExtractor: Send + Sync {
    fn extract(
        &self,
        scan: &Scan,
        atlas: &Atlas,
        standardize: bool,
    ) -> Result<RoiTimeSeries, KiraError>;
}

/// Plain per-region voxel mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtlasAverager;

impl TimeSeriesExtractor for AtlasAverager {
    fn extract(
        &self,
        scan: &Scan,
        atlas: &Atlas,
        standardize: bool,
    ) -> Result<RoiTimeSeries, KiraError> {
        let labels = atlas.labels();
        if labels.dim() != scan.spatial_shape() {
            return Err(KiraError::Extraction(format!(
                "atlas shape {:?} does not match scan shape {:?}",
                labels.dim(),
                scan.spatial_shape()
            )));
        }
        let regions = atlas.regions().to_vec();
        let volumes = scan.total_volumes();
        if regions.is_empty() || volumes == 0 {
            return Err(KiraError::Extraction(
                "scan has no labelled voxels or no volumes".to_string(),
            ));
        }

        let mut sums = Array2::<f64>::zeros((regions.len(), volumes));
        let mut counts = vec![0usize; regions.len()];
        for ((x, y, z), label) in labels.indexed_iter() {
            let Ok(row) = regions.binary_search(label) else {
                continue;
            };
            counts[row] += 1;
            let voxel = scan.data.slice(s![x, y, z, ..]);
            let mut acc = sums.row_mut(row);
            for (slot, value) in acc.iter_mut().zip(voxel.iter()) {
                *slot += f64::from(*value);
            }
        }
        for (mut row, count) in sums.axis_iter_mut(Axis(0)).zip(counts) {
            let count = count as f64;
            row.mapv_inplace(|value| value / count);
        }
        if standardize {
            zscore_rows(&mut sums);
        }

        Ok(RoiTimeSeries {
            regions,
            values: sums,
        })
    }
}

/// Z-scores each row in place. Constant rows become zeros.
pub fn zscore_rows(values: &mut Array2<f64>) {
    for mut row in values.axis_iter_mut(Axis(0)) {
        let n = row.len() as f64;
        let mean = row.sum() / n;
        let var = row.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / n;
        let std = var.sqrt();
        if std > 0.0 && std.is_finite() {
            row.mapv_inplace(|value| (value - mean) / std);
        } else {
            row.fill(0.0);
        }
    }
}

/// Runs `extractor` on a helper thread and gives up after `timeout`.
///
/// A timed-out extraction keeps running detached until it returns; its
/// result is dropped.
pub fn extract_with_timeout<E>(
    extractor: Arc<E>,
    scan: Arc<Scan>,
    atlas: Arc<Atlas>,
    standardize: bool,
    timeout: Duration,
    path: &Path,
) -> Result<RoiTimeSeries, KiraError>
where
    E: TimeSeriesExtractor + ?Sized + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name("kira-extract".to_string())
        .spawn(move || {
            let _ = tx.send(extractor.extract(&scan, &atlas, standardize));
        })
        .map_err(|err| KiraError::Filesystem(format!("spawn extraction thread: {err}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(KiraError::ExtractionTimeout {
            secs: timeout.as_secs(),
        }),
        Err(RecvTimeoutError::Disconnected) => {
            Err(KiraError::unreadable(path, "extraction thread panicked"))
        }
    }
}
