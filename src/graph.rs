//! Graph records: one complete weighted graph per trial.

use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::connectivity::ConnectivityMatrix;
use crate::domain::{DatasetId, Label, RecordKey, RunId, SubjectId};
use crate::error::KiraError;
use crate::task::TaskType;
use crate::window::TrialWindow;

pub const RECORD_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRecord {
    pub schema_version: u32,
    pub dataset_id: DatasetId,
    pub subject_id: SubjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub trial_id: String,
    pub task_type: TaskType,
    pub label: Label,
    pub n_rois: usize,
    pub self_loops: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<TrialWindow>,
    pub node_features: Vec<Vec<f64>>,
    /// Source row then target row, PyG style.
    pub edge_index: [Vec<u32>; 2],
    pub edge_weight: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeFeatureKind {
    /// Row `i` of the connectivity matrix.
    #[default]
    ConnectivityProfile,
    /// Mean, std, min and max of ROI `i` over the trial segment.
    SegmentStatistics,
}

impl NodeFeatureKind {
    pub fn width(self, n_rois: usize) -> usize {
        match self {
            NodeFeatureKind::ConnectivityProfile => n_rois,
            NodeFeatureKind::SegmentStatistics => 4,
        }
    }

    pub fn compute(
        self,
        matrix: &ConnectivityMatrix,
        segment: ArrayView2<'_, f64>,
    ) -> Array2<f64> {
        match self {
            NodeFeatureKind::ConnectivityProfile => matrix.view().to_owned(),
            NodeFeatureKind::SegmentStatistics => {
                let mut features = Array2::zeros((segment.nrows(), 4));
                for (row, mut out) in segment
                    .axis_iter(Axis(0))
                    .zip(features.axis_iter_mut(Axis(0)))
                {
                    let n = row.len() as f64;
                    let mean = row.sum() / n;
                    let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                    let min = row.iter().copied().fold(f64::INFINITY, f64::min);
                    let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    out[0] = mean;
                    out[1] = var.sqrt();
                    out[2] = min;
                    out[3] = max;
                }
                features
            }
        }
    }
}

/// Per-record provenance handed to [`GraphAssembler::assemble`].
#[derive(Debug, Clone)]
pub struct RecordMeta {
    pub key: RecordKey,
    pub task_type: TaskType,
    pub label: Label,
    pub window: Option<TrialWindow>,
}

#[derive(Debug, Clone, Copy)]
pub struct GraphAssembler {
    pub expected_rois: usize,
    pub self_loops: bool,
    pub features: NodeFeatureKind,
}

impl GraphAssembler {
    pub fn feature_width(&self) -> usize {
        self.features.width(self.expected_rois)
    }

    pub fn assemble(
        &self,
        matrix: &ConnectivityMatrix,
        segment: ArrayView2<'_, f64>,
        meta: RecordMeta,
    ) -> Result<GraphRecord, KiraError> {
        let n_rois = matrix.n_rois();
        if n_rois != self.expected_rois {
            return Err(KiraError::DimensionMismatch {
                expected: self.expected_rois,
                found: n_rois,
            });
        }
        if segment.nrows() != n_rois {
            return Err(KiraError::DimensionMismatch {
                expected: n_rois,
                found: segment.nrows(),
            });
        }

        let features = self.features.compute(matrix, segment);
        let width = self.feature_width();
        if features.ncols() != width {
            return Err(KiraError::DimensionMismatch {
                expected: width,
                found: features.ncols(),
            });
        }

        let weights = matrix.view();
        let edges = if self.self_loops {
            n_rois * n_rois
        } else {
            n_rois * n_rois.saturating_sub(1)
        };
        let mut sources = Vec::with_capacity(edges);
        let mut targets = Vec::with_capacity(edges);
        let mut edge_weight = Vec::with_capacity(edges);
        for i in 0..n_rois {
            for j in 0..n_rois {
                if i == j && !self.self_loops {
                    continue;
                }
                sources.push(i as u32);
                targets.push(j as u32);
                edge_weight.push(weights[[i, j]]);
            }
        }

        if meta.label.kind() != meta.task_type.label_kind() {
            return Err(KiraError::LabelUnavailable(format!(
                "{} label for {} task",
                meta.label.kind(),
                meta.task_type
            )));
        }

        Ok(GraphRecord {
            schema_version: RECORD_SCHEMA_VERSION,
            dataset_id: meta.key.dataset,
            subject_id: meta.key.subject,
            run_id: meta.key.run,
            trial_id: meta.key.trial.to_string(),
            task_type: meta.task_type,
            label: meta.label,
            n_rois,
            self_loops: self.self_loops,
            window: meta.window,
            node_features: features.rows().into_iter().map(|row| row.to_vec()).collect(),
            edge_index: [sources, targets],
            edge_weight,
        })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::connectivity::ConnectivityBuilder;
    use crate::domain::TrialId;

    fn meta(task_type: TaskType, label: Label) -> RecordMeta {
        RecordMeta {
            key: RecordKey {
                dataset: "ds1".parse().unwrap(),
                subject: "01".parse().unwrap(),
                run: None,
                trial: TrialId::Event(0),
            },
            task_type,
            label,
            window: None,
        }
    }

    fn segment() -> Array2<f64> {
        array![
            [1.0, 2.0, 3.0, 5.0],
            [2.0, 1.0, 4.0, 3.0],
            [0.0, 1.0, 0.0, 1.0]
        ]
    }

    #[test]
    fn complete_graph_without_self_loops() {
        let segment = segment();
        let matrix = ConnectivityBuilder::default().build(segment.view()).unwrap();
        let assembler = GraphAssembler {
            expected_rois: 3,
            self_loops: false,
            features: NodeFeatureKind::ConnectivityProfile,
        };
        let record = assembler
            .assemble(&matrix, segment.view(), meta(TaskType::PainLevelClassification, Label::Continuous(4.0)))
            .unwrap();

        assert_eq!(record.edge_index[0].len(), 6);
        assert_eq!(record.edge_weight.len(), 6);
        assert!(record.edge_index[0].iter().zip(&record.edge_index[1]).all(|(i, j)| i != j));
        assert_eq!(record.node_features.len(), 3);
        assert!(record.node_features.iter().all(|row| row.len() == 3));
        assert_eq!(record.task_type, TaskType::PainLevelClassification);
        // edge (1, 0) is the third edge in row-major order
        assert_eq!(record.edge_weight[2], matrix.view()[[1, 0]]);
    }

    #[test]
    fn self_loops_carry_sentinel_weight() {
        let segment = segment();
        let matrix = ConnectivityBuilder::default().build(segment.view()).unwrap();
        let assembler = GraphAssembler {
            expected_rois: 3,
            self_loops: true,
            features: NodeFeatureKind::SegmentStatistics,
        };
        let record = assembler
            .assemble(&matrix, segment.view(), meta(TaskType::Unknown, Label::Continuous(0.5)))
            .unwrap();

        assert_eq!(record.edge_weight.len(), 9);
        assert_eq!(record.edge_weight[0], 1.0);
        assert!(record.node_features.iter().all(|row| row.len() == 4));
        assert_eq!(record.task_type, TaskType::Unknown);
    }

    #[test]
    fn roi_count_mismatch_is_rejected() {
        let segment = segment();
        let matrix = ConnectivityBuilder::default().build(segment.view()).unwrap();
        let assembler = GraphAssembler {
            expected_rois: 100,
            self_loops: false,
            features: NodeFeatureKind::ConnectivityProfile,
        };
        let err = assembler
            .assemble(&matrix, segment.view(), meta(TaskType::PainLevelClassification, Label::Continuous(1.0)))
            .unwrap_err();
        assert!(matches!(
            err,
            KiraError::DimensionMismatch {
                expected: 100,
                found: 3
            }
        ));
    }

    #[test]
    fn label_is_tagged_on_disk() {
        let segment = segment();
        let matrix = ConnectivityBuilder::default().build(segment.view()).unwrap();
        let assembler = GraphAssembler {
            expected_rois: 3,
            self_loops: false,
            features: NodeFeatureKind::ConnectivityProfile,
        };
        let record = assembler
            .assemble(
                &matrix,
                segment.view(),
                meta(TaskType::AgeRegression, Label::Continuous(23.5)),
            )
            .unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["label"]["kind"], "continuous");
        assert_eq!(json["task_type"], 1);
    }

    #[test]
    fn label_kind_must_match_task() {
        let segment = segment();
        let matrix = ConnectivityBuilder::default().build(segment.view()).unwrap();
        let assembler = GraphAssembler {
            expected_rois: 3,
            self_loops: false,
            features: NodeFeatureKind::ConnectivityProfile,
        };
        let err = assembler
            .assemble(
                &matrix,
                segment.view(),
                meta(TaskType::AgeRegression, Label::Categorical(24)),
            )
            .unwrap_err();
        assert!(matches!(err, KiraError::LabelUnavailable(_)));
    }
}
