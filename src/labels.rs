//! Per-dataset label extraction into the tagged [`Label`] encoding.

use std::collections::BTreeMap;

use crate::config::DatasetSpec;
use crate::domain::{DatasetKind, Label, SubjectId};
use crate::error::KiraError;
use crate::table::{EventRow, Participants};
use crate::task::TaskType;

/// Everything a trial label may be drawn from.
pub struct LabelContext<'a> {
    pub dataset: &'a DatasetSpec,
    pub participants: Option<&'a Participants>,
    pub subject: &'a SubjectId,
    /// Resolved once for the whole dataset; fixes the label encoding.
    pub task: TaskType,
}

impl LabelContext<'_> {
    /// `event` is `None` for whole-scan records.
    pub fn label_for(&self, event: Option<&EventRow>) -> Result<Label, KiraError> {
        Label::encode(self.value_for(event)?, self.task.label_kind())
    }

    fn value_for(&self, event: Option<&EventRow>) -> Result<f64, KiraError> {
        let trial_level = match self.dataset.kind {
            DatasetKind::Demographic => None,
            DatasetKind::Pain => event.and_then(|event| event.rating).map(Ok),
            DatasetKind::Stimulus => event.and_then(|event| self.stimulus_class(event)),
            DatasetKind::Other => event.and_then(|event| {
                event
                    .rating
                    .map(Ok)
                    .or_else(|| self.stimulus_class(event))
            }),
        };
        if let Some(value) = trial_level {
            return value;
        }
        self.subject_value().unwrap_or_else(|| {
            Err(KiraError::LabelUnavailable(format!(
                "{} sub-{}: no {} label",
                self.dataset.id, self.subject, self.dataset.kind
            )))
        })
    }

    fn stimulus_class(&self, event: &EventRow) -> Option<Result<f64, KiraError>> {
        let trial_type = event.trial_type.as_deref()?;
        if let Some(index) = self
            .dataset
            .trial_classes
            .iter()
            .position(|class| class == trial_type)
        {
            return Some(Ok(index as f64));
        }
        match trial_type.parse::<i64>() {
            Ok(value) => Some(Ok(value as f64)),
            Err(_) => Some(Err(KiraError::LabelUnavailable(format!(
                "unknown trial_type {trial_type:?}"
            )))),
        }
    }

    fn subject_value(&self) -> Option<Result<f64, KiraError>> {
        let raw = self.participants?.label(self.subject)?;
        Some(participant_value(raw, &self.dataset.label_map))
    }
}

/// Numeric value of a participants cell, through `label_map` first.
pub fn participant_value(raw: &str, label_map: &BTreeMap<String, f64>) -> Result<f64, KiraError> {
    if let Some(value) = label_map.get(raw) {
        return Ok(*value);
    }
    raw.parse::<f64>()
        .map_err(|_| KiraError::LabelUnavailable(format!("unmapped label {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LabelKind;
    use crate::table::Table;

    fn dataset(kind: DatasetKind) -> DatasetSpec {
        DatasetSpec {
            id: "ds9".parse().unwrap(),
            kind,
            tr: None,
            participants: None,
            label_map: BTreeMap::from([("F".to_string(), 0.0), ("M".to_string(), 1.0)]),
            rating_column: "rating".to_string(),
            trial_classes: vec!["faces".to_string(), "houses".to_string()],
            scans: Vec::new(),
        }
    }

    fn event(trial_type: Option<&str>, rating: Option<f64>) -> EventRow {
        EventRow {
            index: 0,
            onset: 0.0,
            duration: 2.0,
            trial_type: trial_type.map(str::to_string),
            rating,
        }
    }

    #[test]
    fn demographic_labels_come_from_participants() {
        let spec = dataset(DatasetKind::Demographic);
        let table = Table::parse("participant_id\tsex\tage\nsub-01\tM\t23.5\n").unwrap();
        let sex = Participants::from_table(&table, "sex").unwrap();
        let age = Participants::from_table(&table, "age").unwrap();
        let subject: SubjectId = "01".parse().unwrap();

        let ctx = LabelContext {
            dataset: &spec,
            participants: Some(&sex),
            subject: &subject,
            task: TaskType::GenderClassification,
        };
        assert_eq!(ctx.label_for(None).unwrap(), Label::Categorical(1));

        let ctx = LabelContext {
            participants: Some(&age),
            task: TaskType::AgeRegression,
            ..ctx
        };
        assert_eq!(ctx.label_for(None).unwrap(), Label::Continuous(23.5));
    }

    #[test]
    fn stimulus_classes_use_configured_order() {
        let spec = dataset(DatasetKind::Stimulus);
        let subject: SubjectId = "01".parse().unwrap();
        let ctx = LabelContext {
            dataset: &spec,
            participants: None,
            subject: &subject,
            task: TaskType::StimulusClass,
        };
        assert_eq!(
            ctx.label_for(Some(&event(Some("houses"), None))).unwrap(),
            Label::Categorical(1)
        );
        assert_eq!(
            ctx.label_for(Some(&event(Some("4"), None))).unwrap(),
            Label::Categorical(4)
        );
        assert!(ctx.label_for(Some(&event(Some("tools"), None))).is_err());
    }

    #[test]
    fn pain_without_rating_is_unavailable() {
        let spec = dataset(DatasetKind::Pain);
        let subject: SubjectId = "01".parse().unwrap();
        let ctx = LabelContext {
            dataset: &spec,
            participants: None,
            subject: &subject,
            task: TaskType::PainLevelClassification,
        };
        assert_eq!(
            ctx.label_for(Some(&event(None, Some(6.5)))).unwrap(),
            Label::Continuous(6.5)
        );
        assert!(ctx.label_for(Some(&event(None, None))).is_err());
    }

    #[test]
    fn integral_and_fractional_ratings_share_one_kind() {
        let spec = dataset(DatasetKind::Pain);
        let subject: SubjectId = "01".parse().unwrap();
        let ctx = LabelContext {
            dataset: &spec,
            participants: None,
            subject: &subject,
            task: TaskType::PainLevelClassification,
        };
        let kinds = [3.0, 7.5]
            .into_iter()
            .map(|rating| ctx.label_for(Some(&event(None, Some(rating)))).unwrap().kind())
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec![LabelKind::Continuous, LabelKind::Continuous]);
    }

    #[test]
    fn mapped_and_numeric_participant_cells() {
        let map = BTreeMap::from([("F".to_string(), 0.0)]);
        assert_eq!(participant_value("F", &map).unwrap(), 0.0);
        assert_eq!(participant_value("41", &map).unwrap(), 41.0);
        assert!(participant_value("X", &map).is_err());
    }
}
