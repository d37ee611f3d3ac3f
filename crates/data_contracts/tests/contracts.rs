use data_contracts::{
    TrainingLog, VolumeEntry, VolumeManifest, VolumeManifestSchemaVersion, VolumeValidationError,
};

fn entry(id: u32) -> VolumeEntry {
    VolumeEntry {
        id,
        dims: [4, 8, 8],
        image: format!("img_{id}.f32").into(),
        label: format!("lbl_{id}.f32").into(),
        aux_label: None,
    }
}

#[test]
fn duplicate_ids_rejected() {
    let manifest = VolumeManifest {
        schema_version: VolumeManifestSchemaVersion::V1,
        root: None,
        entries: vec![entry(1), entry(2), entry(1)],
    };
    assert_eq!(
        manifest.validate().unwrap_err(),
        VolumeValidationError::DuplicateId(1)
    );
}

#[test]
fn empty_axis_rejected() {
    let mut bad = entry(3);
    bad.dims = [0, 8, 8];
    assert!(matches!(
        bad.validate(),
        Err(VolumeValidationError::EmptyDims { id: 3, .. })
    ));
}

#[test]
fn manifest_parses_without_optional_fields() {
    let raw = r#"{
        "schema_version": "V1",
        "entries": [{"id": 7, "dims": [2, 4, 4], "image": "a.f32", "label": "b.f32"}]
    }"#;
    let manifest: VolumeManifest = serde_json::from_str(raw).unwrap();
    assert!(manifest.validate().is_ok());
    assert_eq!(manifest.entry(7).map(|e| e.voxel_count()), Some(32));
    assert!(manifest.root.is_none());
}

#[test]
fn log_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run").join("log.json");
    let mut log = TrainingLog::new(serde_json::json!({"batch_size": 2}), 3.5);
    log.push_training([("loss", 0.7)]);
    log.push_validation(0, [("loss", 0.6)]);
    log.lowest_val_loss = Some(0.6);
    log.lowest_val_loss_iteration = Some(0);
    log.save(&path).unwrap();

    let loaded = TrainingLog::load(&path).unwrap();
    assert_eq!(loaded, log);
    assert!(!path.with_extension("json.tmp").exists());
}

#[test]
fn missing_log_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(TrainingLog::load(&dir.path().join("absent.json")).is_err());
}
