use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::KiraError;
use crate::store::{TEMP_PREFIX, WriteOutcome, ensure_writable_dir, list_records, write_new};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub sources: usize,
    pub scanned: usize,
    pub copied: usize,
    /// Collisions of either kind. The existing corpus file always wins.
    pub skipped: usize,
    pub skipped_identical: usize,
    pub skipped_conflicting: usize,
    pub failed: usize,
    pub stale_temp_removed: usize,
    pub corpus_size: usize,
}

/// Temp files younger than this may belong to a merge still running.
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(15 * 60);

#[derive(Default)]
struct Counters {
    scanned: AtomicUsize,
    copied: AtomicUsize,
    identical: AtomicUsize,
    conflicting: AtomicUsize,
    failed: AtomicUsize,
}

/// First-writer-wins union of record directories.
///
/// Sources are visited in the order given, so on a filename collision the
/// earliest source's file is the one kept. Re-running after an interrupted
/// merge copies only what is still missing.
#[derive(Debug, Clone)]
pub struct DatasetMerger {
    corpus: Utf8PathBuf,
    stale_after: Duration,
}

impl DatasetMerger {
    pub fn new(corpus: Utf8PathBuf) -> Self {
        Self {
            corpus,
            stale_after: STALE_TEMP_AGE,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn corpus(&self) -> &Utf8Path {
        &self.corpus
    }

    pub fn merge(&self, sources: &[Utf8PathBuf]) -> Result<MergeSummary, KiraError> {
        ensure_writable_dir(&self.corpus)?;
        let stale_temp_removed = self.remove_stale_temp_files()?;

        let counters = Counters::default();
        for source in sources {
            let records = list_records(source)?;
            info!(%source, records = records.len(), "merging source");
            records
                .par_iter()
                .for_each(|path| self.merge_one(path, &counters));
        }

        let identical = counters.identical.into_inner();
        let conflicting = counters.conflicting.into_inner();
        let summary = MergeSummary {
            sources: sources.len(),
            scanned: counters.scanned.into_inner(),
            copied: counters.copied.into_inner(),
            skipped: identical + conflicting,
            skipped_identical: identical,
            skipped_conflicting: conflicting,
            failed: counters.failed.into_inner(),
            stale_temp_removed,
            corpus_size: list_records(&self.corpus)?.len(),
        };
        info!(
            copied = summary.copied,
            skipped = summary.skipped,
            conflicting = summary.skipped_conflicting,
            corpus_size = summary.corpus_size,
            "merge finished"
        );
        Ok(summary)
    }

    fn merge_one(&self, path: &Utf8Path, counters: &Counters) {
        counters.scanned.fetch_add(1, Ordering::Relaxed);
        let Some(name) = path.file_name() else {
            return;
        };
        let dest = self.corpus.join(name);

        let result = fs::read(path.as_std_path())
            .map_err(|err| KiraError::unreadable(path.as_std_path(), err))
            .and_then(|content| {
                let outcome = write_new(&dest, &content)?;
                Ok((content, outcome))
            });
        match result {
            Ok((_, WriteOutcome::Created)) => {
                counters.copied.fetch_add(1, Ordering::Relaxed);
            }
            Ok((content, WriteOutcome::AlreadyExists)) => {
                let same = fs::read(dest.as_std_path())
                    .map(|existing| existing == content)
                    .unwrap_or(false);
                if same {
                    counters.identical.fetch_add(1, Ordering::Relaxed);
                } else {
                    warn!(%path, %dest, "filename collision with different content, keeping existing record");
                    counters.conflicting.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err) => {
                warn!(%path, error = %err, "failed to merge record");
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // Leftovers of a crash mid-copy; never complete records. Recent ones are
    // left alone since another merge may still be writing them.
    fn remove_stale_temp_files(&self) -> Result<usize, KiraError> {
        let entries = fs::read_dir(self.corpus.as_std_path())
            .map_err(|err| KiraError::OutputUnwritable(format!("{}: {err}", self.corpus)))?;
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(TEMP_PREFIX));
            if !is_temp {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            match age {
                Some(age) if age >= self.stale_after => {
                    if fs::remove_file(entry.path()).is_ok() {
                        removed += 1;
                    }
                }
                _ => debug!(path = %entry.path().display(), "keeping recent temp file"),
            }
        }
        Ok(removed)
    }
}
