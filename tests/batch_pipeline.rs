//! End-to-end batch scenarios with a scripted recognizer.

use std::sync::Arc;
use std::time::Duration;

use handwriting_scanner_lib::aggregator::FlagReason;
use handwriting_scanner_lib::excel;
use handwriting_scanner_lib::recognizer::{Script, ScriptedRecognizer};
use handwriting_scanner_lib::types::{CellValue, JobOutcome, RecognizedRegion};
use handwriting_scanner_lib::{
    Aggregator, BatchOrchestrator, BatchStatus, ColumnDef, ColumnType, Error, ErrorKind, Image,
    RecognizerError, RowExtractor, Schema, Settings, MAX_BATCH_SIZE,
};

const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x10\0\0\0\x10\x08\x02\0\0\0";

fn schema() -> Schema {
    Schema::new(vec![
        ColumnDef::new("Sample ID", ColumnType::Text, true),
        ColumnDef::new("Weight", ColumnType::Number, true),
    ])
    .unwrap()
}

fn image(name: &str) -> Image {
    Image::with_id(name, name, PNG.to_vec())
}

fn lines(lines: &[&str]) -> Script {
    Script::Regions(
        lines
            .iter()
            .map(|l| RecognizedRegion::new(*l, Some(0.9)))
            .collect(),
    )
}

fn orchestrator(recognizer: Arc<ScriptedRecognizer>, workers: usize) -> BatchOrchestrator {
    let settings = Settings {
        workers,
        retry_backoff: Duration::from_millis(5),
        job_timeout: Duration::from_secs(10),
        ..Settings::default()
    };
    BatchOrchestrator::new(recognizer, RowExtractor::default(), settings)
}

#[tokio::test]
async fn batch_size_bounds() {
    let o = orchestrator(Arc::new(ScriptedRecognizer::new()), 4);
    assert!(matches!(
        o.submit(Vec::new(), schema()),
        Err(Error::BatchTooLarge { count: 0, .. })
    ));
    let too_many = (0..=MAX_BATCH_SIZE).map(|i| image(&format!("{i}.png"))).collect();
    let err = o.submit(too_many, schema()).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::BatchTooLarge));

    let mut recognizer = ScriptedRecognizer::new();
    let mut images = Vec::new();
    for i in 0..MAX_BATCH_SIZE {
        let name = format!("{i}.png");
        recognizer = recognizer.on(&name, lines(&["S | 1"]));
        images.push(image(&name));
    }
    let job = orchestrator(Arc::new(recognizer), 8)
        .submit(images, schema())
        .unwrap()
        .wait()
        .await;
    assert_eq!(job.status, BatchStatus::Completed);
    assert_eq!(job.success_count(), MAX_BATCH_SIZE);
}

#[tokio::test]
async fn one_invalid_image_among_ten() {
    let mut recognizer = ScriptedRecognizer::new();
    let mut images = Vec::new();
    for i in 0..10 {
        let name = format!("sheet{i}.png");
        let id = format!("S-{i}");
        recognizer = recognizer.on(&name, lines(&[&format!("{id} | {i}.5")]));
        images.push(image(&name));
    }
    images.insert(4, Image::with_id("broken", "broken.png", b"not really a png".to_vec()));

    let job = orchestrator(Arc::new(recognizer), 3)
        .submit(images, schema())
        .unwrap()
        .wait()
        .await;
    assert_eq!(job.status, BatchStatus::PartiallyFailed);
    assert_eq!(job.success_count(), 10);
    assert_eq!(job.failure_count(), 1);
    match job.outcome(&"broken".into()) {
        Some(JobOutcome::Failed(f)) => assert_eq!(f.reason, ErrorKind::InvalidImage),
        other => panic!("unexpected outcome {:?}", other),
    }

    let table = Aggregator::default().aggregate(&job);
    assert_eq!(table.rows.len(), 10);
    for (i, row) in table.rows.iter().enumerate() {
        assert_eq!(row.value("Sample ID"), Some(&CellValue::Text(format!("S-{i}"))));
        assert_eq!(
            row.value("Weight").and_then(CellValue::as_number),
            Some(i as f64 + 0.5)
        );
    }
}

#[tokio::test]
async fn unreadable_image_reported_by_the_recognizer_among_ten() {
    let mut recognizer = ScriptedRecognizer::new();
    let mut images = Vec::new();
    for i in 0..10 {
        let name = format!("sheet{i}.png");
        let script = if i == 6 {
            Script::Fail(RecognizerError::InvalidImage("page is blank ink smear".into()))
        } else {
            lines(&[&format!("S-{i} | {i}")])
        };
        recognizer = recognizer.on(&name, script);
        images.push(image(&name));
    }
    let recognizer = Arc::new(recognizer);

    let job = orchestrator(recognizer.clone(), 4)
        .submit(images, schema())
        .unwrap()
        .wait()
        .await;
    assert_eq!(job.status, BatchStatus::PartiallyFailed);
    assert_eq!(job.success_count(), 9);
    assert_eq!(recognizer.calls("sheet6.png"), 1);

    let table = Aggregator::default().aggregate(&job);
    assert_eq!(table.rows.len(), 9);
    assert_eq!(table.failures.len(), 1);
    assert_eq!(table.failures[0].image.original_name, "sheet6.png");
    assert_eq!(table.failures[0].reason, ErrorKind::InvalidImage);
    assert!(table.failures[0].detail.contains("ink smear"));
    assert!(table.unprocessed.is_empty());
}

#[tokio::test]
async fn recognizer_panic_becomes_a_failure_entry() {
    let recognizer = ScriptedRecognizer::new()
        .on("a.png", lines(&["S-1 | 1"]))
        .on("boom.png", Script::Panic("index out of bounds".into()))
        .on("c.png", lines(&["S-3 | 3"]));
    let images = vec![image("a.png"), image("boom.png"), image("c.png")];

    let handle = orchestrator(Arc::new(recognizer), 1)
        .submit(images, schema())
        .unwrap();
    let job = handle.wait().await;
    assert_eq!(job.status, BatchStatus::PartiallyFailed);
    assert_eq!(handle.poll().completed, 3);

    let table = Aggregator::default().aggregate(&job);
    let ids: Vec<&str> = table
        .rows
        .iter()
        .filter_map(|r| r.value("Sample ID").and_then(CellValue::as_text))
        .collect();
    assert_eq!(ids, vec!["S-1", "S-3"]);
    assert_eq!(table.failures.len(), 1);
    assert_eq!(table.failures[0].image.original_name, "boom.png");
    assert!(table.failures[0].detail.contains("index out of bounds"));
    assert!(table.unprocessed.is_empty());
}

#[tokio::test]
async fn duplicate_image_ids_are_refused_before_any_work() {
    let recognizer = Arc::new(
        ScriptedRecognizer::new()
            .on("a.png", lines(&["A-1 | 1"]))
            .on("b.png", lines(&["B-1 | 2", "B-2 | 3"])),
    );
    let images = vec![
        Image::with_id("x", "a.png", PNG.to_vec()),
        Image::with_id("x", "b.png", PNG.to_vec()),
    ];
    let err = orchestrator(recognizer.clone(), 2)
        .submit(images, schema())
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateImage(ref id) if id == "x"));
    assert_eq!(recognizer.calls("a.png"), 0);
    assert_eq!(recognizer.calls("b.png"), 0);
}

#[tokio::test]
async fn submission_order_survives_reversed_completion() {
    let recognizer = ScriptedRecognizer::new()
        .on("first.png", lines(&["A-1 | 1", "A-2 | 2"]))
        .with_delay("first.png", Duration::from_millis(120))
        .on("second.png", lines(&["B-1 | 3"]))
        .with_delay("second.png", Duration::from_millis(60))
        .on("third.png", lines(&["C-1 | 4"]));
    let images = vec![image("first.png"), image("second.png"), image("third.png")];

    let job = orchestrator(Arc::new(recognizer), 3)
        .submit(images, schema())
        .unwrap()
        .wait()
        .await;
    let table = Aggregator::default().aggregate(&job);
    let ids: Vec<&str> = table
        .rows
        .iter()
        .filter_map(|r| r.value("Sample ID").and_then(CellValue::as_text))
        .collect();
    assert_eq!(ids, vec!["A-1", "A-2", "B-1", "C-1"]);
    let provenance: Vec<(&str, usize)> = table
        .provenance
        .iter()
        .map(|p| (p.image.original_name.as_str(), p.row_index))
        .collect();
    assert_eq!(
        provenance,
        vec![("first.png", 0), ("first.png", 1), ("second.png", 0), ("third.png", 0)]
    );
}

#[tokio::test]
async fn three_image_lab_sheet() {
    let recognizer = ScriptedRecognizer::new()
        .on(
            "a.jpg",
            lines(&[
                "Sample ID | Weight",
                "S-1 | 12.5",
                "S-2 | 7,25",
                "S-3 | 1 204",
                "S-4 | 0.5",
                "S-5 | 3",
            ]),
        )
        .on(
            "b.jpg",
            Script::Fail(RecognizerError::InvalidImage("too blurred to read".into())),
        )
        .on("c.jpg", lines(&["S-6 | 4.75", "S-7 | n/a"]));
    let images = vec![image("a.jpg"), image("b.jpg"), image("c.jpg")];

    let job = orchestrator(Arc::new(recognizer), 2)
        .submit(images, schema())
        .unwrap()
        .wait()
        .await;
    assert_eq!(job.status, BatchStatus::PartiallyFailed);

    let table = Aggregator::new(0.5).aggregate(&job);
    assert_eq!(table.rows.len(), 7);
    assert_eq!(table.rows[2].value("Weight"), Some(&CellValue::Number(1204.0)));

    let flagged: Vec<usize> = table
        .flags
        .iter()
        .enumerate()
        .filter_map(|(i, f)| f.as_ref().map(|_| i))
        .collect();
    assert_eq!(flagged, vec![6]);
    let weight = table.rows[6].cell("Weight").unwrap();
    assert!(weight.value.is_none());
    assert_eq!(weight.confidence, 0.0);
    let flag = table.flags[6].as_ref().unwrap();
    assert!(flag.reasons.contains(&FlagReason::MissingRequired));
    assert!(flag.warnings.iter().any(|w| w.contains("n/a")));

    assert_eq!(table.failures.len(), 1);
    assert_eq!(table.failures[0].image.original_name, "b.jpg");
    assert_eq!(table.failures[0].reason, ErrorKind::InvalidImage);

    let summary = table.summary();
    assert_eq!(summary.images_succeeded, 2);
    assert_eq!(summary.flagged_rows, 1);

    let sheets = excel::read_sheets(&excel::write(&table, &schema()).unwrap()).unwrap();
    assert_eq!(sheets[0].1.len(), 8);
    assert_eq!(sheets[2].1[1][2], "InvalidImage");
}

#[tokio::test]
async fn cancellation_keeps_completed_images_only() {
    let mut recognizer = ScriptedRecognizer::new();
    let mut images = Vec::new();
    for i in 0..20 {
        let name = format!("{i:02}.png");
        let script = if i == 5 {
            Script::Hang
        } else {
            lines(&[&format!("S-{i} | {i}")])
        };
        recognizer = recognizer.on(&name, script);
        images.push(image(&name));
    }
    let recognizer = Arc::new(recognizer);

    let handle = orchestrator(recognizer.clone(), 1)
        .submit(images, schema())
        .unwrap();
    let mut progress = handle.subscribe();
    progress.wait_for(|p| p.completed == 5).await.unwrap();
    handle.cancel();

    let job = handle.wait().await;
    assert_eq!(job.status, BatchStatus::Cancelled);
    assert_eq!(job.results.len(), 5);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.poll().completed, 5);
    assert_eq!(handle.poll().status, BatchStatus::Cancelled);
    for i in 6..20 {
        assert_eq!(recognizer.calls(&format!("{i:02}.png")), 0);
    }

    let table = Aggregator::default().aggregate(&job);
    assert_eq!(table.rows.len(), 5);
    assert!(table.failures.is_empty());
    assert_eq!(table.unprocessed.len(), 15);
    assert_eq!(table.unprocessed[0].original_name, "05.png");
}

#[tokio::test]
async fn workbook_output_is_idempotent() {
    let recognizer = ScriptedRecognizer::new()
        .on("a.png", lines(&["S-1 | 2", "S-2 | x"]))
        .on("b.png", Script::Fail(RecognizerError::InvalidImage("torn".into())));
    let job = orchestrator(Arc::new(recognizer), 2)
        .submit(vec![image("a.png"), image("b.png")], schema())
        .unwrap()
        .wait()
        .await;
    let table = Aggregator::default().aggregate(&job);

    let first = excel::write(&table, &schema()).unwrap();
    let second = excel::write(&table, &schema()).unwrap();
    assert_eq!(first, second);
}
