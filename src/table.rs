//! Tab-separated inputs: BIDS `events.tsv` and `participants.tsv`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::warn;

use crate::domain::SubjectId;
use crate::error::KiraError;

const MISSING: &str = "n/a";

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn read(path: &Path) -> Result<Self, KiraError> {
        let content = fs::read_to_string(path).map_err(|err| KiraError::unreadable(path, err))?;
        Self::parse(&content).map_err(|reason| KiraError::unreadable(path, reason))
    }

    /// Tab-delimited unless the header has no tabs, then comma-delimited.
    pub fn parse(content: &str) -> Result<Self, String> {
        let mut lines = content
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty());
        let header_line = lines.next().ok_or_else(|| "empty table".to_string())?;
        let delimiter = if header_line.contains('\t') { '\t' } else { ',' };
        let header = split(header_line, delimiter);

        let mut rows = Vec::new();
        for (index, line) in lines.enumerate() {
            let row = split(line, delimiter);
            if row.len() != header.len() {
                return Err(format!(
                    "row {} has {} fields, header has {}",
                    index + 1,
                    row.len(),
                    header.len()
                ));
            }
            rows.push(row);
        }
        Ok(Self { header, rows })
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|column| column == name)
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }
}

fn split(line: &str, delimiter: char) -> Vec<String> {
    line.split(delimiter)
        .map(|field| field.trim().to_string())
        .collect()
}

fn present(value: &str) -> Option<&str> {
    if value.is_empty() || value.eq_ignore_ascii_case(MISSING) {
        None
    } else {
        Some(value)
    }
}

/// One annotated trial. `index` is the row position in the file and stays
/// stable when other rows are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub index: usize,
    pub onset: f64,
    pub duration: f64,
    pub trial_type: Option<String>,
    pub rating: Option<f64>,
}

pub fn read_events(path: &Path, rating_column: &str) -> Result<Vec<EventRow>, KiraError> {
    let table = Table::read(path)?;
    events_from_table(&table, rating_column).map_err(|reason| KiraError::unreadable(path, reason))
}

pub fn events_from_table(table: &Table, rating_column: &str) -> Result<Vec<EventRow>, String> {
    let onset = table
        .column("onset")
        .ok_or_else(|| "missing onset column".to_string())?;
    let duration = table.column("duration");
    let trial_type = table.column("trial_type");
    let rating = table.column(rating_column);

    let mut events = Vec::with_capacity(table.rows().len());
    for (index, row) in table.rows().iter().enumerate() {
        let Some(onset_value) = present(&row[onset]).and_then(|value| value.parse::<f64>().ok())
        else {
            warn!(row = index, value = %row[onset], "dropping event with unreadable onset");
            continue;
        };
        // Missing durations resolve to the fallback window later on.
        let duration_value = duration
            .and_then(|column| present(&row[column]))
            .and_then(|value| value.parse::<f64>().ok())
            .unwrap_or(0.0);
        events.push(EventRow {
            index,
            onset: onset_value,
            duration: duration_value,
            trial_type: trial_type
                .and_then(|column| present(&row[column]))
                .map(str::to_string),
            rating: rating
                .and_then(|column| present(&row[column]))
                .and_then(|value| value.parse::<f64>().ok()),
        });
    }
    Ok(events)
}

/// Raw label cell per subject from a participants table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Participants {
    labels: HashMap<SubjectId, String>,
}

impl Participants {
    pub fn read(path: &Path, label_column: &str) -> Result<Self, KiraError> {
        let table = Table::read(path)?;
        Self::from_table(&table, label_column).map_err(|reason| KiraError::unreadable(path, reason))
    }

    pub fn from_table(table: &Table, label_column: &str) -> Result<Self, String> {
        let id = table
            .column("participant_id")
            .ok_or_else(|| "missing participant_id column".to_string())?;
        let label = table
            .column(label_column)
            .ok_or_else(|| format!("missing {label_column} column"))?;

        let mut labels = HashMap::new();
        for row in table.rows() {
            let Ok(subject) = row[id].parse::<SubjectId>() else {
                warn!(participant = %row[id], "skipping participant with invalid id");
                continue;
            };
            if let Some(value) = present(&row[label]) {
                labels.insert(subject, value.to_string());
            }
        }
        Ok(Self { labels })
    }

    pub fn label(&self, subject: &SubjectId) -> Option<&str> {
        self.labels.get(subject).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.labels.values().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bids_events() {
        let content = "onset\tduration\ttrial_type\tpain\n\
                       10.0\t0\twarm\t3\n\
                       n/a\t2\twarm\t1\n\
                       20.5\tn/a\thot\tn/a\n";
        let table = Table::parse(content).unwrap();
        let events = events_from_table(&table, "pain").unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].rating, Some(3.0));
        assert_eq!(events[1].index, 2);
        assert_eq!(events[1].duration, 0.0);
        assert_eq!(events[1].trial_type.as_deref(), Some("hot"));
        assert_eq!(events[1].rating, None);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        assert!(Table::parse("onset\tduration\n1\t2\t3\n").is_err());
    }

    #[test]
    fn participants_normalize_prefix() {
        let table = Table::parse("participant_id,sex\nsub-01,M\nsub-02,n/a\n").unwrap();
        let participants = Participants::from_table(&table, "sex").unwrap();
        assert_eq!(participants.label(&"01".parse().unwrap()), Some("M"));
        assert_eq!(participants.label(&"02".parse().unwrap()), None);
        assert_eq!(participants.len(), 1);
    }
}
