use std::fs;
use std::io::{self, Write};
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use ndarray::{Array2, ArrayView2};
use serde::Serialize;
use tempfile::Builder;

use crate::domain::RecordKey;
use crate::error::KiraError;

/// Prefix of in-flight temp files. Anything carrying it is never a record.
pub const TEMP_PREFIX: &str = ".kira-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Created,
    AlreadyExists,
}

/// Output layout: `graphs/<stem>.json` and `connectivity/<stem>.txt`.
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn graphs_dir(&self) -> Utf8PathBuf {
        self.root.join("graphs")
    }

    pub fn connectivity_dir(&self) -> Utf8PathBuf {
        self.root.join("connectivity")
    }

    pub fn record_path(&self, key: &RecordKey) -> Utf8PathBuf {
        self.graphs_dir().join(format!("{}.json", key.file_stem()))
    }

    pub fn matrix_path(&self, key: &RecordKey) -> Utf8PathBuf {
        self.connectivity_dir()
            .join(format!("{}.txt", key.file_stem()))
    }

    /// Creates the layout and proves it is writable. Failure here is fatal.
    pub fn ensure_layout(&self) -> Result<(), KiraError> {
        for dir in [self.graphs_dir(), self.connectivity_dir()] {
            ensure_writable_dir(&dir)?;
        }
        Ok(())
    }

    pub fn has_record(&self, key: &RecordKey) -> bool {
        self.record_path(key).as_std_path().exists()
    }

    pub fn write_record<T: Serialize>(
        path: &Utf8Path,
        record: &T,
    ) -> Result<WriteOutcome, KiraError> {
        let content = serde_json::to_vec_pretty(record)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        write_new(path, &content)
    }

    pub fn write_matrix(
        path: &Utf8Path,
        matrix: ArrayView2<'_, f64>,
    ) -> Result<WriteOutcome, KiraError> {
        write_new(path, format_matrix(matrix).as_bytes())
    }
}

pub fn ensure_writable_dir(dir: &Utf8Path) -> Result<(), KiraError> {
    fs::create_dir_all(dir.as_std_path())
        .map_err(|err| KiraError::OutputUnwritable(format!("{dir}: {err}")))?;
    Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir.as_std_path())
        .map_err(|err| KiraError::OutputUnwritable(format!("{dir}: {err}")))?;
    Ok(())
}

/// Atomic create-if-absent: the file appears complete or not at all, and an
/// existing file is never replaced.
pub fn write_new(path: &Utf8Path, content: &[u8]) -> Result<WriteOutcome, KiraError> {
    let parent = path
        .parent()
        .ok_or_else(|| KiraError::Filesystem(format!("invalid destination path {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    if path.as_std_path().exists() {
        return Ok(WriteOutcome::AlreadyExists);
    }

    let mut temp = Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    match temp.persist_noclobber(path.as_std_path()) {
        Ok(_) => Ok(WriteOutcome::Created),
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
            Ok(WriteOutcome::AlreadyExists)
        }
        Err(err) => Err(KiraError::Filesystem(format!("persist {path}: {}", err.error))),
    }
}

/// Atomically replaces `path`. Only record migration rewrites files.
pub fn replace_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), KiraError> {
    let parent = path
        .parent()
        .ok_or_else(|| KiraError::Filesystem(format!("invalid destination path {path}")))?;
    let mut temp = Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("persist {path}: {}", err.error)))?;
    Ok(())
}

/// Whitespace-delimited rows, one per line. Shortest round-trip float format.
pub fn format_matrix(matrix: ArrayView2<'_, f64>) -> String {
    let mut out = String::new();
    for row in matrix.rows() {
        let line = row
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Parses a text matrix. Accepts `nan`, `inf` and `-inf` tokens, and commas
/// as separators.
pub fn parse_matrix(content: &str) -> Result<Array2<f64>, KiraError> {
    let mut values = Vec::new();
    let mut cols = None;
    let mut rows = 0usize;
    for line in content.lines().filter(|line| !line.trim().is_empty()) {
        let before = values.len();
        for token in line
            .split(|ch: char| ch == ',' || ch.is_whitespace())
            .filter(|token| !token.is_empty())
        {
            let value = token
                .parse::<f64>()
                .map_err(|_| KiraError::InvalidMatrix(format!("bad value {token:?}")))?;
            values.push(value);
        }
        let width = values.len() - before;
        match cols {
            None => cols = Some(width),
            Some(expected) if expected != width => {
                return Err(KiraError::InvalidMatrix(format!(
                    "row {} has {width} values, expected {expected}",
                    rows + 1
                )));
            }
            Some(_) => {}
        }
        rows += 1;
    }
    let cols = cols.ok_or_else(|| KiraError::InvalidMatrix("empty matrix".to_string()))?;
    Array2::from_shape_vec((rows, cols), values)
        .map_err(|err| KiraError::InvalidMatrix(err.to_string()))
}

pub fn read_matrix(path: &Path) -> Result<Array2<f64>, KiraError> {
    let content = fs::read_to_string(path).map_err(|err| KiraError::unreadable(path, err))?;
    parse_matrix(&content)
}

/// Record files directly inside `dir`, sorted by name. Hidden and temp files
/// are skipped.
pub fn list_records(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, KiraError> {
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| KiraError::unreadable(dir.as_std_path(), err))?;
    let mut records = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        let hidden = path
            .file_name()
            .map(|name| name.starts_with('.'))
            .unwrap_or(true);
        if hidden || path.extension() != Some("json") || !path.as_std_path().is_file() {
            continue;
        }
        records.push(path);
    }
    records.sort();
    Ok(records)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::domain::TrialId;

    #[test]
    fn layout_paths() {
        let store = Store::new(Utf8PathBuf::from("/out"));
        let key = RecordKey {
            dataset: "ds3".parse().unwrap(),
            subject: "sub-12".parse().unwrap(),
            run: Some("1".parse().unwrap()),
            trial: TrialId::Event(7),
        };
        assert_eq!(
            store.record_path(&key),
            Utf8PathBuf::from("/out/graphs/ds3_sub-12_run-1_trial-007.json")
        );
        assert!(store.matrix_path(&key).ends_with("connectivity/ds3_sub-12_run-1_trial-007.txt"));
    }

    #[test]
    fn write_new_never_overwrites() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("a.json")).unwrap();
        assert_eq!(write_new(&path, b"first").unwrap(), WriteOutcome::Created);
        assert_eq!(write_new(&path, b"second").unwrap(), WriteOutcome::AlreadyExists);
        assert_eq!(fs::read(path.as_std_path()).unwrap(), b"first");
    }

    #[test]
    fn matrix_text_round_trip_accepts_non_finite_tokens() {
        let parsed = parse_matrix("1 nan\n-inf, 0.25\n").unwrap();
        assert!(parsed[[0, 1]].is_nan());
        assert_eq!(parsed[[1, 0]], f64::NEG_INFINITY);

        let m = array![[1.0, -0.125], [-0.125, 1.0]];
        assert_eq!(parse_matrix(&format_matrix(m.view())).unwrap(), m);
    }

    #[test]
    fn ragged_matrix_is_rejected() {
        assert!(parse_matrix("1 2\n3\n").is_err());
    }

    #[test]
    fn listing_skips_temp_files() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        fs::write(dir.join("b.json").as_std_path(), b"{}").unwrap();
        fs::write(dir.join("a.json").as_std_path(), b"{}").unwrap();
        fs::write(dir.join(".kira-xyz.json").as_std_path(), b"{}").unwrap();
        fs::write(dir.join("notes.txt").as_std_path(), b"").unwrap();
        let listed = list_records(&dir).unwrap();
        let names = listed
            .iter()
            .filter_map(|path| path.file_name())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.json", "b.json"]);
    }
}
