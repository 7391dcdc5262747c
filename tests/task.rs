use std::fs;

use camino::Utf8PathBuf;

use kira_connectome::domain::{DatasetKind, LabelKind};
use kira_connectome::migrate::{UpgradeOptions, UpgradeOutcome, upgrade_dir, upgrade_record};
use kira_connectome::store::list_records;
use kira_connectome::task::{TaskType, TaskTypeResolver};

#[test]
fn resolver_is_deterministic() {
    assert_eq!(
        TaskTypeResolver::for_dataset(DatasetKind::Demographic, [0.0, 1.0, 0.0]),
        TaskType::GenderClassification
    );
    assert_eq!(
        TaskTypeResolver::for_dataset(DatasetKind::Demographic, [23.5, 31.0]),
        TaskType::AgeRegression
    );
    for ratings in [vec![0.0], vec![1.0, 4.0], vec![9.5]] {
        assert_eq!(
            TaskTypeResolver::for_dataset(DatasetKind::Pain, ratings),
            TaskType::PainLevelClassification
        );
    }
    assert_eq!(TaskType::Unknown.code(), -1);
}

#[test]
fn one_label_kind_per_task_after_upgrade() {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    for (index, rating) in ["3", "7.5", "0", "10"].iter().enumerate() {
        fs::write(
            dir.join(format!("dsB_sub-01_trial-{index:03}.json")).as_std_path(),
            format!(r#"{{"subject_id":"01","label":{rating}}}"#),
        )
        .unwrap();
    }

    let options = UpgradeOptions {
        dataset: "dsB".parse().unwrap(),
        kind: DatasetKind::Pain,
        force: false,
    };
    let summary = upgrade_dir(&dir, &options).unwrap();
    assert_eq!(summary.upgraded, 4);

    for path in list_records(&dir).unwrap() {
        let record: serde_json::Value =
            serde_json::from_slice(&fs::read(path.as_std_path()).unwrap()).unwrap();
        assert_eq!(record["task_type"], 2);
        assert_eq!(record["label"]["kind"], "continuous");
    }
    assert_eq!(
        TaskType::PainLevelClassification.label_kind(),
        LabelKind::Continuous
    );
}

#[test]
fn tagged_records_are_left_byte_for_byte() {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();

    // deliberately compact, so any rewrite would change the bytes
    let tagged = br#"{"schema_version":2,"dataset_id":"dsA","subject_id":"01","trial_id":"000","task_type":1,"label":{"kind":"continuous","value":41.0},"edge_weight":[0.25]}"#;
    let legacy = br#"{"subject_id":"02","trial_id":"001","label":35.5,"edge_weight":[0.5]}"#;
    fs::write(dir.join("dsA_sub-01_trial-000.json").as_std_path(), tagged).unwrap();
    fs::write(dir.join("dsA_sub-02_trial-001.json").as_std_path(), legacy).unwrap();

    let options = UpgradeOptions {
        dataset: "dsA".parse().unwrap(),
        kind: DatasetKind::Demographic,
        force: false,
    };
    let summary = upgrade_dir(&dir, &options).unwrap();
    assert_eq!(summary.upgraded, 1);
    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.failed, 0);

    let after = fs::read(dir.join("dsA_sub-01_trial-000.json").as_std_path()).unwrap();
    assert_eq!(after, tagged);

    let upgraded: serde_json::Value = serde_json::from_slice(
        &fs::read(dir.join("dsA_sub-02_trial-001.json").as_std_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(upgraded["task_type"], 1);
    assert_eq!(upgraded["label"]["kind"], "continuous");

    // second pass touches nothing
    let again = upgrade_dir(&dir, &options).unwrap();
    assert_eq!(again.upgraded, 0);
    assert_eq!(again.unchanged, 2);
}

#[test]
fn corrupt_record_fails_alone() {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    fs::write(dir.join("broken.json").as_std_path(), b"{not json").unwrap();
    fs::write(
        dir.join("ok.json").as_std_path(),
        br#"{"subject_id":"01","label":3}"#,
    )
    .unwrap();

    let options = UpgradeOptions {
        dataset: "dsB".parse().unwrap(),
        kind: DatasetKind::Pain,
        force: false,
    };
    let summary = upgrade_dir(&dir, &options).unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.upgraded, 1);
    assert_eq!(
        upgrade_record(&dir.join("ok.json"), &options, TaskType::PainLevelClassification).unwrap(),
        UpgradeOutcome::Unchanged
    );
}
