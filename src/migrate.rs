//! Versioned upgrade of persisted records.
//!
//! Schema 1 records predate task tagging: they have no `dataset_id`, no
//! `task_type` and a bare numeric label. Upgrading reads a record, decides
//! from its version and fields whether anything is missing, and writes it
//! back only when the content actually changes.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::domain::{DatasetId, DatasetKind, Label};
use crate::error::KiraError;
use crate::graph::RECORD_SCHEMA_VERSION;
use crate::store::{list_records, replace_atomic};
use crate::task::{TaskType, TaskTypeResolver};

#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    pub dataset: DatasetId,
    pub kind: DatasetKind,
    /// Re-resolve task and dataset even on records that already carry them.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeOutcome {
    Upgraded,
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpgradeSummary {
    pub upgraded: usize,
    pub unchanged: usize,
    pub failed: usize,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredLabel {
    Tagged(Label),
    Bare(f64),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    schema_version: Option<u32>,
    #[serde(default)]
    dataset_id: Option<DatasetId>,
    #[serde(default)]
    task_type: Option<TaskType>,
    label: StoredLabel,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Serialize)]
struct Upgraded {
    schema_version: u32,
    dataset_id: DatasetId,
    task_type: TaskType,
    label: Label,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl StoredLabel {
    fn value(&self) -> f64 {
        match self {
            StoredLabel::Tagged(label) => label.as_f64(),
            StoredLabel::Bare(value) => *value,
        }
    }
}

impl Envelope {
    fn in_scope(&self, options: &UpgradeOptions) -> bool {
        options.force
            || self
                .dataset_id
                .as_ref()
                .is_none_or(|existing| existing == &options.dataset)
    }
}

/// Task for every record the upgrade touches, judged on all of their labels
/// together. Unreadable records are left to [`upgrade_record`] to report.
pub fn resolve_task(records: &[Utf8PathBuf], options: &UpgradeOptions) -> TaskType {
    let values = records
        .par_iter()
        .filter_map(|path| {
            let content = fs::read(path.as_std_path()).ok()?;
            let envelope: Envelope = serde_json::from_slice(&content).ok()?;
            envelope
                .in_scope(options)
                .then(|| envelope.label.value())
        })
        .collect::<Vec<_>>();
    TaskTypeResolver::for_dataset(options.kind, values)
}

/// Upgrades one record. `task` fills a missing `task_type`; the label is
/// re-encoded to whatever the record's task requires.
pub fn upgrade_record(
    path: &Utf8Path,
    options: &UpgradeOptions,
    task: TaskType,
) -> Result<UpgradeOutcome, KiraError> {
    let invalid = |reason: String| KiraError::InvalidRecord {
        path: path.as_std_path().to_path_buf(),
        reason,
    };
    let original = fs::read(path.as_std_path())
        .map_err(|err| KiraError::unreadable(path.as_std_path(), err))?;
    let envelope: Envelope =
        serde_json::from_slice(&original).map_err(|err| invalid(err.to_string()))?;

    if !envelope.in_scope(options) {
        if let Some(existing) = &envelope.dataset_id {
            warn!(%path, record = %existing, requested = %options.dataset, "record belongs to another dataset, leaving it");
        }
        return Ok(UpgradeOutcome::Unchanged);
    }

    let current = envelope.schema_version.unwrap_or(1) >= RECORD_SCHEMA_VERSION
        && envelope.dataset_id.is_some()
        && match (&envelope.label, envelope.task_type) {
            (StoredLabel::Tagged(label), Some(task_type)) => {
                label.kind() == task_type.label_kind()
            }
            _ => false,
        };
    if current && !options.force {
        return Ok(UpgradeOutcome::Unchanged);
    }

    let task_type = match envelope.task_type {
        Some(task_type) if !options.force => task_type,
        _ => task,
    };
    let label = Label::encode(envelope.label.value(), task_type.label_kind())
        .map_err(|err| invalid(err.to_string()))?;
    let dataset_id = match envelope.dataset_id {
        Some(dataset_id) if !options.force => dataset_id,
        _ => options.dataset.clone(),
    };

    let upgraded = Upgraded {
        schema_version: RECORD_SCHEMA_VERSION,
        dataset_id,
        task_type,
        label,
        rest: envelope.rest,
    };
    let content =
        serde_json::to_vec_pretty(&upgraded).map_err(|err| invalid(err.to_string()))?;
    if content == original {
        return Ok(UpgradeOutcome::Unchanged);
    }
    replace_atomic(path, &content)?;
    debug!(%path, %task_type, "record upgraded");
    Ok(UpgradeOutcome::Upgraded)
}

/// Upgrades every record in `dir`. Per-file failures are counted, not raised.
pub fn upgrade_dir(dir: &Utf8Path, options: &UpgradeOptions) -> Result<UpgradeSummary, KiraError> {
    let records = list_records(dir)?;
    let task = resolve_task(&records, options);
    info!(%dir, records = records.len(), %task, "upgrading records");
    let upgraded = AtomicUsize::new(0);
    let unchanged = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    records
        .par_iter()
        .for_each(|path| match upgrade_record(path, options, task) {
            Ok(UpgradeOutcome::Upgraded) => {
                upgraded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(UpgradeOutcome::Unchanged) => {
                unchanged.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(%path, error = %err, "record upgrade failed");
                failed.fetch_add(1, Ordering::Relaxed);
            }
        });

    let summary = UpgradeSummary {
        upgraded: upgraded.into_inner(),
        unchanged: unchanged.into_inner(),
        failed: failed.into_inner(),
    };
    info!(%dir, upgraded = summary.upgraded, unchanged = summary.unchanged, failed = summary.failed, "upgrade finished");
    Ok(summary)
}
