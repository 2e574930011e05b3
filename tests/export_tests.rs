use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::io::Read;
use std::sync::Arc;

use kili_export::conversion::MemorySink;
use kili_export::{
    build_ontology, export_to_file, run_export, Asset, ExportFormat, ExportOptions, InputType,
    KiliError, LabelSelection, LabelType, Ontology, ProjectInfo, RawLabel, SplitOption,
    MANIFEST_FILE,
};

fn ontology() -> Arc<Ontology> {
    Arc::new(
        build_ontology(&json!({
            "jobs": {
                "OBJECT_DETECTION_JOB": {
                    "mlTask": "OBJECT_DETECTION",
                    "content": {
                        "categories": {"CAR": {"name": "Car"}, "PERSON": {"name": "Person"}},
                        "input": "radio"
                    },
                    "tools": ["rectangle", "polygon"]
                },
                "TRANSCRIPTION_JOB": {
                    "mlTask": "TRANSCRIPTION",
                    "content": {"input": "textField"}
                }
            }
        }))
        .unwrap(),
    )
}

fn project() -> ProjectInfo {
    ProjectInfo {
        id: "project-42".to_string(),
        title: "Street scenes".to_string(),
        description: "Cars and pedestrians".to_string(),
    }
}

fn box_response(category: &str) -> Value {
    json!({
        "OBJECT_DETECTION_JOB": {"annotations": [{
            "mid": "box-1",
            "type": "rectangle",
            "categories": [{"name": category}],
            "boundingPoly": [{"normalizedVertices": [
                {"x": 0.1, "y": 0.5}, {"x": 0.1, "y": 0.1}, {"x": 0.5, "y": 0.1}, {"x": 0.5, "y": 0.5}
            ]}]
        }]},
        "TRANSCRIPTION_JOB": {"text": "plate ABC-123"}
    })
}

fn label(id: &str, hour: u32, response: Value) -> RawLabel {
    RawLabel {
        id: id.to_string(),
        label_type: LabelType::Default,
        created_at: Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap(),
        author: None,
        json_response: response,
    }
}

fn asset(external_id: &str, labels: Vec<RawLabel>) -> Asset {
    Asset {
        id: None,
        external_id: external_id.to_string(),
        content: None,
        width: Some(1000),
        height: Some(500),
        input_type: InputType::Image,
        json_metadata: None,
        labels,
    }
}

fn without_date(manifest: &str) -> String {
    manifest
        .lines()
        .filter(|line| !line.starts_with("Export date:"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn test_latest_mode_keeps_newest_label() {
    let assets = vec![asset(
        "photo",
        vec![
            label("t2", 2, box_response("CAR")),
            label("t3", 3, box_response("PERSON")),
            label("t1", 1, box_response("CAR")),
        ],
    )];
    let options = ExportOptions::new(ExportFormat::KiliRaw);
    let mut sink = MemorySink::default();
    let report = run_export(&assets, &ontology(), &project(), &options, &mut sink).unwrap();
    assert_eq!(report.summary.exported_labels, 1);

    let record: Value = serde_json::from_str(sink.text("labels/photo.json").unwrap()).unwrap();
    assert_eq!(record["latestLabel"]["id"], "t3");
}

#[test]
fn test_all_mode_keeps_every_label() {
    let assets = vec![asset(
        "photo",
        vec![
            label("t2", 2, box_response("CAR")),
            label("t3", 3, box_response("PERSON")),
            label("t1", 1, box_response("CAR")),
        ],
    )];
    let options = ExportOptions::new(ExportFormat::YoloV4).with_selection(LabelSelection::All);
    let mut sink = MemorySink::default();
    let report = run_export(&assets, &ontology(), &project(), &options, &mut sink).unwrap();
    assert_eq!(report.summary.exported_labels, 3);

    for (id, class) in [("t1", 0), ("t2", 0), ("t3", 1)] {
        let path = format!("OBJECT_DETECTION_JOB/labels/photo__{}.txt", id);
        assert_eq!(
            sink.text(&path).unwrap(),
            format!("{} 0.3 0.3 0.4 0.4\n", class)
        );
    }
    assert_eq!(
        sink.text("OBJECT_DETECTION_JOB/classes.txt").unwrap(),
        "0 Car\n1 Person\n"
    );
}

#[test]
fn test_one_malformed_asset_does_not_abort_the_export() {
    let degenerate = json!({
        "OBJECT_DETECTION_JOB": {"annotations": [{
            "mid": "bad",
            "type": "polygon",
            "categories": [{"name": "CAR"}],
            "boundingPoly": [{"normalizedVertices": [{"x": 0.1, "y": 0.1}, {"x": 0.2, "y": 0.2}]}]
        }]}
    });
    let assets: Vec<Asset> = (1..=5)
        .map(|index| {
            let response = if index == 3 {
                degenerate.clone()
            } else {
                box_response("CAR")
            };
            asset(&format!("asset-{}", index), vec![label("l", 1, response)])
        })
        .collect();

    let options = ExportOptions::new(ExportFormat::YoloV5);
    let mut sink = MemorySink::default();
    let report = run_export(&assets, &ontology(), &project(), &options, &mut sink).unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].external_id, "asset-3");
    assert_matches!(report.failures[0].error, KiliError::InvalidGeometry(_));
    assert_eq!(report.summary.exported_assets, 4);
    assert_eq!(report.summary.failed_assets, 1);
    for index in [1, 2, 4, 5] {
        let path = format!("OBJECT_DETECTION_JOB/labels/asset-{}.txt", index);
        assert!(sink.files.contains_key(&path), "missing {}", path);
    }
    assert!(!sink.files.contains_key("OBJECT_DETECTION_JOB/labels/asset-3.txt"));
}

#[test]
fn test_unrepresentable_jobs_are_reported_as_skips() {
    let assets = vec![asset("photo", vec![label("l", 1, box_response("CAR"))])];
    let options = ExportOptions::new(ExportFormat::YoloV7).with_split_option(SplitOption::Merged);
    let mut sink = MemorySink::default();
    let report = run_export(&assets, &ontology(), &project(), &options, &mut sink).unwrap();

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].job_id, "TRANSCRIPTION_JOB");
    assert_eq!(report.skipped[0].external_id, "photo");
    assert_eq!(report.summary.skipped_items, 1);
    assert_eq!(sink.text("labels/photo.txt").unwrap(), "0 0.3 0.3 0.4 0.4\n");
    assert!(sink.text("data.yaml").unwrap().contains("names: ['Car', 'Person']"));
}

#[test]
fn test_exports_are_repeatable() {
    let assets = vec![
        asset("a", vec![label("l1", 1, box_response("CAR"))]),
        asset("b", vec![label("l2", 2, box_response("PERSON"))]),
        asset("c", Vec::new()),
    ];
    let options = ExportOptions::new(ExportFormat::KiliRaw).with_single_file(true);

    let mut first = MemorySink::default();
    let mut second = MemorySink::default();
    let report = run_export(&assets, &ontology(), &project(), &options, &mut first).unwrap();
    run_export(&assets, &ontology(), &project(), &options, &mut second).unwrap();

    assert_eq!(report.summary.assets_without_labels, 1);
    assert_eq!(first.text("data.json"), second.text("data.json"));
    let manifest = first.text(MANIFEST_FILE).unwrap();
    assert_eq!(without_date(manifest), without_date(second.text(MANIFEST_FILE).unwrap()));
    assert!(manifest.contains("Project name: Street scenes"));
    assert!(manifest.contains("Project identifier: project-42"));
    assert!(manifest.contains("Project description: Cars and pedestrians"));
    assert!(manifest.contains("Exported format: kili_raw"));
    assert!(manifest.contains("Export date: "));
}

#[test]
fn test_coco_archive_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("export.zip");
    let assets = vec![asset("photo", vec![label("l", 1, box_response("PERSON"))])];
    let options = ExportOptions::new(ExportFormat::Coco);

    let report = export_to_file(&assets, &ontology(), &project(), &options, &path).unwrap();
    assert_eq!(report.summary.written_files, 2);

    let mut archive = zip::ZipArchive::new(std::fs::File::open(&path).unwrap()).unwrap();
    let mut contents = String::new();
    archive
        .by_name("annotations.json")
        .unwrap()
        .read_to_string(&mut contents)
        .unwrap();
    let coco: Value = serde_json::from_str(&contents).unwrap();
    assert_eq!(coco["categories"][1]["name"], "Person");
    assert_eq!(coco["annotations"][0]["category_id"], 2);
    assert_eq!(coco["images"][0]["width"], 1000);
    assert!(archive.by_name(MANIFEST_FILE).is_ok());
}

#[test]
fn test_unsupported_layout_is_rejected_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("export.zip");
    let assets = vec![asset("photo", vec![label("l", 1, box_response("CAR"))])];
    let options = ExportOptions::new(ExportFormat::YoloV5).with_single_file(true);

    assert_matches!(
        export_to_file(&assets, &ontology(), &project(), &options, &path),
        Err(KiliError::UnsupportedOption(_))
    );
    assert!(!path.exists());

    let mut sink = MemorySink::default();
    assert_matches!(
        run_export(&assets, &ontology(), &project(), &options, &mut sink),
        Err(KiliError::UnsupportedOption(_))
    );
    assert!(sink.files.is_empty());
}

#[test]
fn test_video_frames_become_separate_files() {
    let frame = |x: f64| {
        json!({"OBJECT_DETECTION_JOB": {"annotations": [{
            "mid": "car",
            "type": "rectangle",
            "categories": [{"name": "CAR"}],
            "boundingPoly": [{"normalizedVertices": [
                {"x": x, "y": 0.5}, {"x": x, "y": 0.1}, {"x": x + 0.4, "y": 0.1}, {"x": x + 0.4, "y": 0.5}
            ]}]
        }]}})
    };
    let mut video = asset("clip", vec![label("l", 1, json!({"0": frame(0.1), "1": frame(0.5)}))]);
    video.input_type = InputType::Video;

    let options = ExportOptions::new(ExportFormat::YoloV5);
    let mut sink = MemorySink::default();
    run_export(&[video], &ontology(), &project(), &options, &mut sink).unwrap();

    assert_eq!(
        sink.text("OBJECT_DETECTION_JOB/labels/clip_1.txt").unwrap(),
        "0 0.3 0.3 0.4 0.4\n"
    );
    assert_eq!(
        sink.text("OBJECT_DETECTION_JOB/labels/clip_2.txt").unwrap(),
        "0 0.7 0.3 0.4 0.4\n"
    );
}

#[test]
fn test_colliding_stems_get_distinct_paths() {
    let assets = vec![
        asset("a/b.jpg", vec![label("l1", 1, box_response("CAR"))]),
        asset("ab.jpg", vec![label("l2", 1, box_response("PERSON"))]),
    ];
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("export.zip");
    let options = ExportOptions::new(ExportFormat::YoloV5);

    let report = export_to_file(&assets, &ontology(), &project(), &options, &path).unwrap();
    assert_eq!(report.summary.exported_assets, 2);
    let mut archive = zip::ZipArchive::new(std::fs::File::open(&path).unwrap()).unwrap();
    let mut second = String::new();
    archive
        .by_name("OBJECT_DETECTION_JOB/labels/ab.jpg__2.txt")
        .unwrap()
        .read_to_string(&mut second)
        .unwrap();
    assert_eq!(second, "1 0.3 0.3 0.4 0.4\n");
    assert!(archive.by_name("OBJECT_DETECTION_JOB/labels/ab.jpg.txt").is_ok());

    let mut sink = MemorySink::default();
    let options = ExportOptions::new(ExportFormat::KiliRaw);
    let report = run_export(&assets, &ontology(), &project(), &options, &mut sink).unwrap();
    assert!(report.failures.is_empty());
    let first: Value = serde_json::from_str(sink.text("labels/ab.jpg.json").unwrap()).unwrap();
    let second: Value = serde_json::from_str(sink.text("labels/ab.jpg__2.json").unwrap()).unwrap();
    assert_eq!(first["externalId"], "a/b.jpg");
    assert_eq!(second["externalId"], "ab.jpg");
}

#[test]
fn test_nested_children_are_reported_as_skips() {
    let ontology = Arc::new(
        build_ontology(&json!({
            "jobs": {
                "OBJECT_DETECTION_JOB": {
                    "mlTask": "OBJECT_DETECTION",
                    "content": {
                        "categories": {"CAR": {"name": "Car", "children": ["COLOR_JOB"]}},
                        "input": "radio"
                    },
                    "tools": ["rectangle"]
                },
                "COLOR_JOB": {
                    "mlTask": "CLASSIFICATION",
                    "content": {"categories": {"RED": {"name": "Red"}}, "input": "radio"},
                    "isChild": true
                }
            }
        }))
        .unwrap(),
    );
    let response = json!({"OBJECT_DETECTION_JOB": {"annotations": [{
        "mid": "car-1",
        "type": "rectangle",
        "categories": [{"name": "CAR"}],
        "boundingPoly": [{"normalizedVertices": [
            {"x": 0.1, "y": 0.5}, {"x": 0.1, "y": 0.1}, {"x": 0.5, "y": 0.1}, {"x": 0.5, "y": 0.5}
        ]}],
        "children": {"COLOR_JOB": {"categories": [{"name": "RED"}]}}
    }]}});
    let assets = vec![asset("photo", vec![label("l", 1, response)])];

    for format in [ExportFormat::YoloV4, ExportFormat::Coco, ExportFormat::PascalVoc] {
        let mut sink = MemorySink::default();
        let report = run_export(&assets, &ontology, &project(), &ExportOptions::new(format), &mut sink).unwrap();
        assert_eq!(report.summary.exported_assets, 1);
        assert_eq!(report.skipped.len(), 1, "{}", format);
        assert_eq!(report.skipped[0].mid.as_deref(), Some("car-1"));
        assert!(report.skipped[0].reason.contains("COLOR_JOB"));
    }
}
