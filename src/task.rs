use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::{DatasetKind, LabelKind};

/// Learning task a record belongs to. Stored on disk as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum TaskType {
    GenderClassification,
    AgeRegression,
    PainLevelClassification,
    StimulusClass,
    Unknown,
}

impl TaskType {
    pub fn code(self) -> i32 {
        match self {
            TaskType::GenderClassification => 0,
            TaskType::AgeRegression => 1,
            TaskType::PainLevelClassification => 2,
            TaskType::StimulusClass => 3,
            TaskType::Unknown => -1,
        }
    }

    /// Every label of a task shares this encoding. Pain ratings are
    /// continuous because scales with half points are common.
    pub fn label_kind(self) -> LabelKind {
        match self {
            TaskType::GenderClassification | TaskType::StimulusClass => LabelKind::Categorical,
            TaskType::AgeRegression | TaskType::PainLevelClassification | TaskType::Unknown => {
                LabelKind::Continuous
            }
        }
    }
}

impl From<TaskType> for i32 {
    fn from(value: TaskType) -> Self {
        value.code()
    }
}

impl TryFrom<i32> for TaskType {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskType::GenderClassification),
            1 => Ok(TaskType::AgeRegression),
            2 => Ok(TaskType::PainLevelClassification),
            3 => Ok(TaskType::StimulusClass),
            -1 => Ok(TaskType::Unknown),
            other => Err(format!("unknown task type code {other}")),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::GenderClassification => write!(f, "GENDER_CLASSIFICATION"),
            TaskType::AgeRegression => write!(f, "AGE_REGRESSION"),
            TaskType::PainLevelClassification => write!(f, "PAIN_LEVEL_CLASSIFICATION"),
            TaskType::StimulusClass => write!(f, "STIMULUS_CLASS"),
            TaskType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Shape of a label column as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelShape {
    Binary,
    Other,
}

impl LabelShape {
    /// Binary iff the distinct values are exactly `{0, 1}`.
    pub fn of_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let (mut zero, mut one) = (false, false);
        for value in values {
            if value == 0.0 {
                zero = true;
            } else if value == 1.0 {
                one = true;
            } else {
                return LabelShape::Other;
            }
        }
        if zero && one {
            LabelShape::Binary
        } else {
            LabelShape::Other
        }
    }
}

/// Decides the task once per dataset, never per record.
pub struct TaskTypeResolver;

impl TaskTypeResolver {
    /// `values` is the dataset's whole label column. Only demographic
    /// datasets look at it.
    pub fn for_dataset<I>(kind: DatasetKind, values: I) -> TaskType
    where
        I: IntoIterator<Item = f64>,
    {
        let shape = match kind {
            DatasetKind::Demographic => LabelShape::of_values(values),
            _ => LabelShape::Other,
        };
        Self::resolve(kind, shape)
    }

    pub fn resolve(kind: DatasetKind, shape: LabelShape) -> TaskType {
        match (kind, shape) {
            (DatasetKind::Demographic, LabelShape::Binary) => TaskType::GenderClassification,
            (DatasetKind::Demographic, LabelShape::Other) => TaskType::AgeRegression,
            (DatasetKind::Pain, _) => TaskType::PainLevelClassification,
            (DatasetKind::Stimulus, _) => TaskType::StimulusClass,
            (DatasetKind::Other, _) => TaskType::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_table() {
        assert_eq!(
            TaskTypeResolver::for_dataset(DatasetKind::Demographic, [0.0, 1.0, 1.0]),
            TaskType::GenderClassification
        );
        assert_eq!(
            TaskTypeResolver::for_dataset(DatasetKind::Demographic, [23.5, 40.0]),
            TaskType::AgeRegression
        );
        for kind in [DatasetKind::Pain, DatasetKind::Stimulus, DatasetKind::Other] {
            // a {0, 1} column only matters for demographic datasets
            assert_eq!(
                TaskTypeResolver::for_dataset(kind, [0.0, 1.0]),
                TaskTypeResolver::resolve(kind, LabelShape::Other)
            );
        }
        assert_eq!(
            TaskTypeResolver::resolve(DatasetKind::Pain, LabelShape::Binary),
            TaskType::PainLevelClassification
        );
        assert_eq!(
            TaskTypeResolver::resolve(DatasetKind::Stimulus, LabelShape::Other),
            TaskType::StimulusClass
        );
        assert_eq!(
            TaskTypeResolver::resolve(DatasetKind::Other, LabelShape::Other),
            TaskType::Unknown
        );
    }

    #[test]
    fn ages_zero_or_one_stay_regression() {
        let ages = [1.0, 23.5, 40.0];
        assert_eq!(
            TaskTypeResolver::for_dataset(DatasetKind::Demographic, ages),
            TaskType::AgeRegression
        );
        assert_eq!(
            TaskTypeResolver::for_dataset(DatasetKind::Demographic, [0.0, 1.0, 30.0]),
            TaskType::AgeRegression
        );
    }

    #[test]
    fn label_kind_is_fixed_per_task() {
        assert_eq!(TaskType::GenderClassification.label_kind(), LabelKind::Categorical);
        assert_eq!(TaskType::StimulusClass.label_kind(), LabelKind::Categorical);
        assert_eq!(TaskType::AgeRegression.label_kind(), LabelKind::Continuous);
        assert_eq!(TaskType::PainLevelClassification.label_kind(), LabelKind::Continuous);
    }

    #[test]
    fn column_shape() {
        assert_eq!(LabelShape::of_values([0.0, 1.0, 1.0]), LabelShape::Binary);
        assert_eq!(LabelShape::of_values([1.0, 1.0]), LabelShape::Other);
        assert_eq!(LabelShape::of_values([0.0, 1.0, 2.0]), LabelShape::Other);
    }

    #[test]
    fn unknown_serializes_as_sentinel() {
        assert_eq!(serde_json::to_string(&TaskType::Unknown).unwrap(), "-1");
        let parsed: TaskType = serde_json::from_str("2").unwrap();
        assert_eq!(parsed, TaskType::PainLevelClassification);
    }
}
