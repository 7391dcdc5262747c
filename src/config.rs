use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::domain::{DatasetId, DatasetKind, RunId, SubjectId};
use crate::error::KiraError;
use crate::graph::NodeFeatureKind;
use crate::sanitize::MatrixSanitizer;
use crate::window::{
    DEFAULT_FALLBACK_DURATION_SECS, DEFAULT_MIN_TRIAL_VOLUMES, TrialWindowResolver,
};

pub const CONFIG_FILE: &str = "kira-cg.json";
pub const DEFAULT_OUTPUT_DIR: &str = "kira-cg-out";
pub const DEFAULT_RATING_COLUMN: &str = "rating";
pub const DEFAULT_EXTRACTION_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub output_dir: Option<String>,
    pub atlas: String,
    #[serde(default)]
    pub expected_rois: Option<usize>,
    #[serde(default)]
    pub min_trial_volumes: Option<usize>,
    #[serde(default)]
    pub fallback_duration_secs: Option<f64>,
    #[serde(default)]
    pub standardize: Option<bool>,
    #[serde(default)]
    pub self_loops: Option<bool>,
    #[serde(default)]
    pub node_features: Option<NodeFeatureKind>,
    #[serde(default)]
    pub sanitize: Option<MatrixSanitizer>,
    #[serde(default)]
    pub extraction_timeout_secs: Option<u64>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub datasets: Vec<DatasetEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatasetEntry {
    pub id: String,
    pub kind: DatasetKind,
    #[serde(default)]
    pub tr: Option<f64>,
    #[serde(default)]
    pub participants: Option<String>,
    #[serde(default)]
    pub label_column: Option<String>,
    #[serde(default)]
    pub label_map: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub rating_column: Option<String>,
    #[serde(default)]
    pub trial_classes: Option<Vec<String>>,
    #[serde(default)]
    pub scans: Vec<ScanEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ScanEntry {
    pub subject: String,
    #[serde(default)]
    pub run: Option<String>,
    pub path: String,
    #[serde(default)]
    pub events: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScanSpec {
    pub subject: SubjectId,
    pub run: Option<RunId>,
    pub path: Utf8PathBuf,
    pub events: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ParticipantSource {
    pub path: Utf8PathBuf,
    pub label_column: String,
}

#[derive(Debug, Clone)]
pub struct DatasetSpec {
    pub id: DatasetId,
    pub kind: DatasetKind,
    /// Overrides the TR found in scan headers.
    pub tr: Option<f64>,
    pub participants: Option<ParticipantSource>,
    pub label_map: BTreeMap<String, f64>,
    pub rating_column: String,
    pub trial_classes: Vec<String>,
    pub scans: Vec<ScanSpec>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub output_dir: Utf8PathBuf,
    pub atlas: Utf8PathBuf,
    /// Taken from the atlas when not configured.
    pub expected_rois: Option<usize>,
    pub window: TrialWindowResolver,
    pub standardize: bool,
    pub self_loops: bool,
    pub node_features: NodeFeatureKind,
    pub sanitizer: MatrixSanitizer,
    pub extraction_timeout: Duration,
    pub workers: Option<usize>,
    pub datasets: Vec<DatasetSpec>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(KiraError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        let base_dir = config_path
            .parent()
            .map(|parent| parent.to_path_buf())
            .unwrap_or_default();
        let base_dir = Utf8PathBuf::from_path_buf(base_dir)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        Self::resolve_config(config, &base_dir)
    }

    pub fn resolve_config(config: Config, base_dir: &Utf8Path) -> Result<ResolvedConfig, KiraError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let at = |value: &str| resolve_path(base_dir, value);

        let min_length = config.min_trial_volumes.unwrap_or(DEFAULT_MIN_TRIAL_VOLUMES);
        if min_length < 2 {
            return Err(invalid("min_trial_volumes must be at least 2"));
        }
        let fallback = config
            .fallback_duration_secs
            .unwrap_or(DEFAULT_FALLBACK_DURATION_SECS);
        if !fallback.is_finite() || fallback <= 0.0 {
            return Err(invalid("fallback_duration_secs must be positive"));
        }
        if config.expected_rois == Some(0) {
            return Err(invalid("expected_rois must be positive"));
        }
        let sanitizer = config.sanitize.unwrap_or_default();
        sanitizer.validate()?;
        let timeout_secs = config
            .extraction_timeout_secs
            .unwrap_or(DEFAULT_EXTRACTION_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(invalid("extraction_timeout_secs must be positive"));
        }

        let mut seen = HashSet::new();
        let datasets = config
            .datasets
            .into_iter()
            .map(|entry| {
                let id: DatasetId = entry.id.parse()?;
                if !seen.insert(id.clone()) {
                    return Err(invalid(&format!("dataset {id} listed twice")));
                }
                if let Some(tr) = entry.tr {
                    if !tr.is_finite() || tr <= 0.0 {
                        return Err(invalid(&format!("dataset {id}: tr must be positive")));
                    }
                }
                let participants = match (entry.participants, entry.label_column) {
                    (Some(path), Some(label_column)) => Some(ParticipantSource {
                        path: at(&path),
                        label_column,
                    }),
                    (None, None) => None,
                    _ => {
                        return Err(invalid(&format!(
                            "dataset {id}: participants and label_column go together"
                        )));
                    }
                };
                if entry.kind == DatasetKind::Demographic && participants.is_none() {
                    return Err(invalid(&format!(
                        "dataset {id}: demographic datasets need a participants table"
                    )));
                }
                let scans = entry
                    .scans
                    .into_iter()
                    .map(|scan| {
                        Ok(ScanSpec {
                            subject: scan.subject.parse()?,
                            run: scan.run.map(|run| run.parse::<RunId>()).transpose()?,
                            path: at(&scan.path),
                            events: scan.events.as_deref().map(at),
                        })
                    })
                    .collect::<Result<Vec<_>, KiraError>>()?;

                Ok(DatasetSpec {
                    id,
                    kind: entry.kind,
                    tr: entry.tr,
                    participants,
                    label_map: entry.label_map.unwrap_or_default(),
                    rating_column: entry
                        .rating_column
                        .unwrap_or_else(|| DEFAULT_RATING_COLUMN.to_string()),
                    trial_classes: entry.trial_classes.unwrap_or_default(),
                    scans,
                })
            })
            .collect::<Result<Vec<_>, KiraError>>()?;

        Ok(ResolvedConfig {
            schema_version,
            output_dir: at(config.output_dir.as_deref().unwrap_or(DEFAULT_OUTPUT_DIR)),
            atlas: at(&config.atlas),
            expected_rois: config.expected_rois,
            window: TrialWindowResolver::new(min_length, fallback),
            standardize: config.standardize.unwrap_or(true),
            self_loops: config.self_loops.unwrap_or(false),
            node_features: config.node_features.unwrap_or_default(),
            sanitizer,
            extraction_timeout: Duration::from_secs(timeout_secs),
            workers: config.workers.filter(|workers| *workers > 0),
            datasets,
        })
    }
}

fn invalid(message: &str) -> KiraError {
    KiraError::ConfigInvalid(message.to_string())
}

fn resolve_path(base_dir: &Utf8Path, value: &str) -> Utf8PathBuf {
    let path = Utf8PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let config: Config = serde_json::from_str(
            r#"{
                "atlas": "atlas.nii.gz",
                "datasets": [
                    {"id": "ds2", "kind": "pain",
                     "scans": [{"subject": "sub-01", "path": "s1.nii", "events": "e1.tsv"}]}
                ]
            }"#,
        )
        .unwrap();

        let resolved = ConfigLoader::resolve_config(config, Utf8Path::new("/data")).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.atlas, Utf8PathBuf::from("/data/atlas.nii.gz"));
        assert_eq!(resolved.output_dir, Utf8PathBuf::from("/data/kira-cg-out"));
        assert_eq!(resolved.window, TrialWindowResolver::default());
        assert!(resolved.standardize);
        assert!(!resolved.self_loops);
        assert_eq!(resolved.datasets[0].rating_column, "rating");
        assert_eq!(resolved.datasets[0].scans[0].subject.as_str(), "01");
    }
}
