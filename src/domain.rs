use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

static ID_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]+$").unwrap());

fn parse_token(value: &str, prefix: &str) -> Result<String, KiraError> {
    let trimmed = value.trim();
    let stripped = trimmed.strip_prefix(prefix).unwrap_or(trimmed);
    if !ID_TOKEN.is_match(stripped) {
        return Err(KiraError::InvalidIdentifier(value.to_string()));
    }
    Ok(stripped.to_string())
}

macro_rules! id_type {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = KiraError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                parse_token(value, $prefix).map(Self)
            }
        }

        impl TryFrom<String> for $name {
            type Error = KiraError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

id_type!(DatasetId, "");
// BIDS participant ids carry a `sub-` prefix in participants.tsv.
id_type!(SubjectId, "sub-");
id_type!(RunId, "run-");

/// Provenance class of a dataset. Drives label extraction and task resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    /// Subject-level demographic labels from a participants table.
    Demographic,
    /// Per-trial pain ratings.
    Pain,
    /// Per-trial stimulus classes.
    Stimulus,
    Other,
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetKind::Demographic => write!(f, "demographic"),
            DatasetKind::Pain => write!(f, "pain"),
            DatasetKind::Stimulus => write!(f, "stimulus"),
            DatasetKind::Other => write!(f, "other"),
        }
    }
}

impl FromStr for DatasetKind {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "demographic" => Ok(DatasetKind::Demographic),
            "pain" => Ok(DatasetKind::Pain),
            "stimulus" => Ok(DatasetKind::Stimulus),
            "other" => Ok(DatasetKind::Other),
            _ => Err(KiraError::InvalidDatasetKind(value.to_string())),
        }
    }
}

/// Encoding of a label. Fixed per task, never per value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelKind {
    Categorical,
    Continuous,
}

impl fmt::Display for LabelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelKind::Categorical => write!(f, "categorical"),
            LabelKind::Continuous => write!(f, "continuous"),
        }
    }
}

/// Target value of a graph record, tagged so mixed corpora stay unambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Label {
    Categorical(i64),
    Continuous(f64),
}

// Largest magnitude at which every integer is exactly representable as f64.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

impl Label {
    /// Encodes `value` as `kind`. Class labels must be integral.
    pub fn encode(value: f64, kind: LabelKind) -> Result<Self, KiraError> {
        if !value.is_finite() {
            return Err(KiraError::LabelUnavailable(format!("non-finite label {value}")));
        }
        match kind {
            LabelKind::Continuous => Ok(Label::Continuous(value)),
            LabelKind::Categorical if value.fract() == 0.0 && value.abs() <= MAX_EXACT_INTEGER => {
                Ok(Label::Categorical(value as i64))
            }
            LabelKind::Categorical => Err(KiraError::LabelUnavailable(format!(
                "class label {value} is not an integer"
            ))),
        }
    }

    pub fn kind(&self) -> LabelKind {
        match self {
            Label::Categorical(_) => LabelKind::Categorical,
            Label::Continuous(_) => LabelKind::Continuous,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Label::Categorical(value) => *value as f64,
            Label::Continuous(value) => *value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrialId {
    Event(usize),
    /// Whole scan, used when a dataset has no event annotations.
    Full,
}

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrialId::Event(index) => write!(f, "{index:03}"),
            TrialId::Full => write!(f, "full"),
        }
    }
}

/// Identity of one output record. The file stem is a pure function of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub dataset: DatasetId,
    pub subject: SubjectId,
    pub run: Option<RunId>,
    pub trial: TrialId,
}

impl RecordKey {
    pub fn file_stem(&self) -> String {
        match &self.run {
            Some(run) => format!(
                "{}_sub-{}_run-{}_trial-{}",
                self.dataset, self.subject, run, self.trial
            ),
            None => format!("{}_sub-{}_trial-{}", self.dataset, self.subject, self.trial),
        }
    }
}
