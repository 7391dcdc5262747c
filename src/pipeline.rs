//! Batch orchestration: scans fan out over a rayon pool, every failure is
//! confined to the scan or trial it happened in.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{DatasetSpec, ResolvedConfig, ScanSpec};
use crate::connectivity::ConnectivityBuilder;
use crate::domain::{RecordKey, TrialId};
use crate::error::KiraError;
use crate::extract::{RoiTimeSeries, TimeSeriesExtractor, extract_with_timeout};
use crate::graph::{GraphAssembler, RecordMeta};
use crate::labels::{LabelContext, participant_value};
use crate::nifti::{Atlas, ScanLoader};
use crate::store::{Store, WriteOutcome};
use crate::table::{EventRow, Participants, read_events};
use crate::task::{TaskType, TaskTypeResolver};
use crate::window::RejectionReason;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    pub started_at: String,
    pub finished_at: String,
    pub output_dir: String,
    pub expected_rois: usize,
    pub feature_width: usize,
    pub datasets: usize,
    pub scans: usize,
    pub scans_ok: usize,
    pub scans_failed: usize,
    pub trials_written: usize,
    pub trials_existing: usize,
    pub trials_too_short: usize,
    pub trials_out_of_bounds: usize,
    pub trials_invalid_input: usize,
    pub records_failed: usize,
    pub unknown_task_records: usize,
}

#[derive(Default)]
struct Counters {
    scans_ok: AtomicUsize,
    scans_failed: AtomicUsize,
    trials_written: AtomicUsize,
    trials_existing: AtomicUsize,
    too_short: AtomicUsize,
    out_of_bounds: AtomicUsize,
    invalid_input: AtomicUsize,
    records_failed: AtomicUsize,
    unknown_task: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct ScanJob<'a> {
    dataset: &'a DatasetSpec,
    participants: Option<&'a Participants>,
    task: TaskType,
    scan: &'a ScanSpec,
}

struct BuildContext<'a> {
    atlas: Arc<Atlas>,
    builder: ConnectivityBuilder,
    assembler: GraphAssembler,
    counters: &'a Counters,
}

enum TrialOutcome {
    Written(TaskType),
    Existing,
}

pub struct Pipeline<L: ScanLoader, E: TimeSeriesExtractor> {
    config: ResolvedConfig,
    store: Store,
    loader: L,
    extractor: Arc<E>,
}

impl<L, E> Pipeline<L, E>
where
    L: ScanLoader,
    E: TimeSeriesExtractor + 'static,
{
    pub fn new(config: ResolvedConfig, loader: L, extractor: E) -> Self {
        let store = Store::new(config.output_dir.clone());
        Self {
            config,
            store,
            loader,
            extractor: Arc::new(extractor),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn run(&self, sink: &dyn ProgressSink) -> Result<BuildResult, KiraError> {
        let started_at = chrono::Utc::now().to_rfc3339();
        let started = Instant::now();

        self.store.ensure_layout()?;
        let atlas = self
            .loader
            .load_atlas(self.config.atlas.as_std_path())
            .map_err(|err| KiraError::AtlasUnavailable(err.to_string()))?;
        let atlas_rois = atlas.regions().len();
        let expected_rois = self.config.expected_rois.unwrap_or(atlas_rois);
        if expected_rois != atlas_rois {
            warn!(
                expected_rois,
                atlas_rois, "atlas region count differs from expected_rois, records will be rejected"
            );
        }

        let counters = Counters::default();
        let participants = self
            .config
            .datasets
            .iter()
            .map(load_participants)
            .collect::<Vec<_>>();

        let mut jobs = Vec::new();
        for (dataset, participants) in self.config.datasets.iter().zip(&participants) {
            let participants = match participants {
                Ok(participants) => participants.as_ref(),
                Err(err) => {
                    warn!(dataset = %dataset.id, error = %err, "participants unreadable, skipping dataset");
                    counters
                        .scans_failed
                        .fetch_add(dataset.scans.len(), Ordering::Relaxed);
                    continue;
                }
            };
            let task = dataset_task(dataset, participants);
            info!(
                dataset = %dataset.id,
                task = %task,
                participants = participants.map_or(0, Participants::len),
                "task resolved"
            );
            jobs.extend(dataset.scans.iter().map(|scan| ScanJob {
                dataset,
                participants,
                task,
                scan,
            }));
        }

        let ctx = BuildContext {
            atlas: Arc::new(atlas),
            builder: ConnectivityBuilder::new(self.config.sanitizer),
            assembler: GraphAssembler {
                expected_rois,
                self_loops: self.config.self_loops,
                features: self.config.node_features,
            },
            counters: &counters,
        };
        info!(
            scans = jobs.len(),
            expected_rois,
            output = %self.store.root(),
            "building connectivity graphs"
        );

        let work = || {
            jobs.par_iter().for_each(|job| {
                let scan_started = Instant::now();
                match self.process_scan(job, &ctx) {
                    Ok(()) => Counters::bump(&counters.scans_ok),
                    Err(err) => {
                        warn!(scan = %job.scan.path, error = %err, "skipping scan");
                        Counters::bump(&counters.scans_failed);
                    }
                }
                sink.event(ProgressEvent {
                    message: format!("phase=Build; {} sub-{} done", job.dataset.id, job.scan.subject),
                    elapsed: Some(scan_started.elapsed()),
                });
            })
        };
        match self.config.workers {
            Some(workers) => rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|index| format!("kira-worker-{index}"))
                .build()
                .map_err(|err| KiraError::Filesystem(format!("build worker pool: {err}")))?
                .install(work),
            None => work(),
        }

        let result = BuildResult {
            started_at,
            finished_at: chrono::Utc::now().to_rfc3339(),
            output_dir: self.store.root().to_string(),
            expected_rois,
            feature_width: ctx.assembler.feature_width(),
            datasets: self.config.datasets.len(),
            scans: self
                .config
                .datasets
                .iter()
                .map(|dataset| dataset.scans.len())
                .sum(),
            scans_ok: counters.scans_ok.load(Ordering::Relaxed),
            scans_failed: counters.scans_failed.load(Ordering::Relaxed),
            trials_written: counters.trials_written.load(Ordering::Relaxed),
            trials_existing: counters.trials_existing.load(Ordering::Relaxed),
            trials_too_short: counters.too_short.load(Ordering::Relaxed),
            trials_out_of_bounds: counters.out_of_bounds.load(Ordering::Relaxed),
            trials_invalid_input: counters.invalid_input.load(Ordering::Relaxed),
            records_failed: counters.records_failed.load(Ordering::Relaxed),
            unknown_task_records: counters.unknown_task.load(Ordering::Relaxed),
        };
        info!(
            written = result.trials_written,
            existing = result.trials_existing,
            failed_scans = result.scans_failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "build finished"
        );
        Ok(result)
    }

    fn process_scan(&self, job: &ScanJob<'_>, ctx: &BuildContext<'_>) -> Result<(), KiraError> {
        let events = match &job.scan.events {
            Some(path) => Some(read_events(path.as_std_path(), &job.dataset.rating_column)?),
            None => None,
        };
        let trials: Vec<(TrialId, Option<&EventRow>)> = match &events {
            Some(events) => events
                .iter()
                .map(|event| (TrialId::Event(event.index), Some(event)))
                .collect(),
            None => vec![(TrialId::Full, None)],
        };

        // Records already on disk are final; a rerun only fills the gaps.
        let mut pending = Vec::with_capacity(trials.len());
        for (trial, event) in trials {
            let key = RecordKey {
                dataset: job.dataset.id.clone(),
                subject: job.scan.subject.clone(),
                run: job.scan.run.clone(),
                trial,
            };
            if self.store.has_record(&key) {
                Counters::bump(&ctx.counters.trials_existing);
            } else {
                pending.push((key, event));
            }
        }
        if pending.is_empty() {
            debug!(scan = %job.scan.path, "all trials already built");
            return Ok(());
        }

        let path = job.scan.path.as_std_path();
        let scan = self.loader.load_scan(path)?;
        let tr = job.dataset.tr.unwrap_or(scan.tr);
        if events.is_some() && !(tr.is_finite() && tr > 0.0) {
            return Err(KiraError::unreadable(path, format!("unusable repetition time {tr}")));
        }
        let series = extract_with_timeout(
            Arc::clone(&self.extractor),
            Arc::new(scan),
            Arc::clone(&ctx.atlas),
            self.config.standardize,
            self.config.extraction_timeout,
            path,
        )?;

        let labels = LabelContext {
            dataset: job.dataset,
            participants: job.participants,
            subject: &job.scan.subject,
            task: job.task,
        };
        for (key, event) in pending {
            match self.process_trial(&key, event, tr, &series, &labels, ctx) {
                Ok(TrialOutcome::Written(task_type)) => {
                    Counters::bump(&ctx.counters.trials_written);
                    if task_type == TaskType::Unknown {
                        debug!(record = %key.file_stem(), "task type unresolved, stored as UNKNOWN");
                        Counters::bump(&ctx.counters.unknown_task);
                    }
                }
                Ok(TrialOutcome::Existing) => Counters::bump(&ctx.counters.trials_existing),
                Err(KiraError::TrialWindowInvalid(rejection)) => {
                    warn!(record = %key.file_stem(), reason = %rejection, "trial window rejected");
                    Counters::bump(match rejection.reason {
                        RejectionReason::TooShort => &ctx.counters.too_short,
                        RejectionReason::OutOfBounds => &ctx.counters.out_of_bounds,
                        RejectionReason::InvalidInput => &ctx.counters.invalid_input,
                    });
                }
                Err(err) => {
                    warn!(record = %key.file_stem(), error = %err, "skipping trial");
                    Counters::bump(&ctx.counters.records_failed);
                }
            }
        }
        Ok(())
    }

    fn process_trial(
        &self,
        key: &RecordKey,
        event: Option<&EventRow>,
        tr: f64,
        series: &RoiTimeSeries,
        labels: &LabelContext<'_>,
        ctx: &BuildContext<'_>,
    ) -> Result<TrialOutcome, KiraError> {
        let volumes = series.total_volumes();
        let window = match event {
            Some(event) => self
                .config
                .window
                .resolve(event.onset, event.duration, tr, volumes),
            None => self.config.window.full_scan(volumes),
        }
        .map_err(KiraError::TrialWindowInvalid)?;

        let label = labels.label_for(event)?;
        let segment = series.segment(&window);
        let matrix = ctx.builder.build(segment)?;
        let record = ctx.assembler.assemble(
            &matrix,
            segment,
            RecordMeta {
                key: key.clone(),
                task_type: labels.task,
                label,
                window: Some(window),
            },
        )?;

        // The record goes last: its presence marks the trial as complete.
        Store::write_matrix(&self.store.matrix_path(key), matrix.view())?;
        match Store::write_record(&self.store.record_path(key), &record)? {
            WriteOutcome::Created => Ok(TrialOutcome::Written(record.task_type)),
            WriteOutcome::AlreadyExists => Ok(TrialOutcome::Existing),
        }
    }
}

/// One task per dataset: demographic datasets are judged on their whole
/// label column, so a single subject can't flip the encoding.
fn dataset_task(dataset: &DatasetSpec, participants: Option<&Participants>) -> TaskType {
    if participants.is_some_and(Participants::is_empty) {
        warn!(dataset = %dataset.id, "participants table has no labels");
    }
    let values = participants
        .into_iter()
        .flat_map(Participants::values)
        .filter_map(|raw| participant_value(raw, &dataset.label_map).ok());
    TaskTypeResolver::for_dataset(dataset.kind, values)
}

fn load_participants(dataset: &DatasetSpec) -> Result<Option<Participants>, KiraError> {
    dataset
        .participants
        .as_ref()
        .map(|source| Participants::read(source.path.as_std_path(), &source.label_column))
        .transpose()
}
