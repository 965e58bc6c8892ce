use blockfile::batch::quarantine::QUARANTINE_DIR;
use blockfile::batch::{available_workers, BatchConfig, BatchRunner};
use blockfile::class_table::{
    CLASS_CAMERA, CLASS_GPS_PVT, CLASS_LIDAR, CLASS_WEATHER, LIDAR_FRAME, PVT_POSITION, WEATHER_CONDITIONS,
};
use blockfile::{encode_block, AnchorKind, Block, NoProgress, Outcome, ProgressObserver, RecordKey, Verifier};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn raw(data_id: u16, payload: &[u8]) -> Vec<u8> {
    encode_block(&Block::new(RecordKey::new(CLASS_LIDAR, 1, 0, data_id), payload.to_vec()))
}

fn three_blocks() -> Vec<Vec<u8>> {
    vec![raw(2, b"calibration-table"), raw(3, b"intrinsics"), raw(2, b"second-calibration")]
}

fn put(dir: &Path, name: &str, bytes: &[u8]) {
    fs::write(dir.join(name), bytes).unwrap();
}

fn runner() -> BatchRunner {
    BatchRunner::new(Verifier::default())
}

fn config(dir: &TempDir, threads: usize) -> BatchConfig {
    BatchConfig { threads, ..BatchConfig::new(dir.path()) }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<(usize, String)>>);

impl ProgressObserver for Recorder {
    fn on_new_file(&self, id: usize, _: &str) {
        self.0.lock().unwrap().push((id, "new".into()));
    }
    fn on_progress(&self, id: usize, phase: &str, _: u8) {
        self.0.lock().unwrap().push((id, phase.into()));
    }
    fn on_complete(&self, id: usize, _: &str, result: &str) {
        self.0.lock().unwrap().push((id, format!("done:{result}")));
    }
}

fn le_bytes<const N: usize>(fields: impl IntoIterator<Item = [u8; N]>) -> Vec<u8> {
    fields.into_iter().flatten().collect()
}

#[test]
fn test_validated_sensor_records_pass() {
    let dir = tempfile::tempdir().unwrap();
    let position = le_bytes([48.137_f64, 11.575, 519.0].map(f64::to_le_bytes));
    let weather = le_bytes([18.5_f32, 62.0, 1011.3].map(f32::to_le_bytes));
    let mut frame = le_bytes([42_u16, 1024, 64].map(u16::to_le_bytes));
    frame.extend_from_slice(&[0x5A; 32]);
    let bytes = [
        encode_block(&Block::new(RecordKey::new(CLASS_GPS_PVT, 1, 0, PVT_POSITION), position)),
        encode_block(&Block::new(RecordKey::new(CLASS_WEATHER, 1, 0, WEATHER_CONDITIONS), weather)),
        encode_block(&Block::new(RecordKey::new(CLASS_LIDAR, 1, 0, LIDAR_FRAME), frame)),
    ]
    .concat();
    put(dir.path(), "sensors.blk", &bytes);

    let report = runner().run(&config(&dir, 1), Arc::new(NoProgress)).unwrap();
    let file = &report.results[0].result;
    assert_eq!(file.outcome, Outcome::Passed);
    assert_eq!(file.blocks, 3);
    assert!(file.issues.is_empty());
    assert_eq!(report.failed, 0);
    assert!(dir.path().join("sensors.blk").exists());
}

#[test]
fn test_valid_file_passes_and_stays() {
    let dir = tempfile::tempdir().unwrap();
    put(dir.path(), "good.blk", &three_blocks().concat());

    let report = runner().run(&config(&dir, 1), Arc::new(NoProgress)).unwrap();
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].result.outcome, Outcome::Passed);
    assert_eq!(report.results[0].result.blocks, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.exit_code(), 0);
    assert!(dir.path().join("good.blk").exists());
    assert!(!dir.path().join(QUARANTINE_DIR).exists());
}

#[test]
fn test_truncated_file_is_structural_and_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let blocks = three_blocks();
    let mut bytes = blocks[0].clone();
    bytes.extend_from_slice(&blocks[1][..blocks[1].len() - 6]);
    put(dir.path(), "trunc.blk", &bytes);

    let report = runner().run(&config(&dir, 1), Arc::new(NoProgress)).unwrap();
    let file = &report.results[0];
    assert_eq!(file.result.outcome, Outcome::FailedStructural);
    assert_eq!(report.failed, 1);
    let dest = dir.path().join(QUARANTINE_DIR).join("trunc.blk");
    assert_eq!(file.quarantined_to.as_deref(), Some(dest.as_path()));
    assert_eq!(fs::read(dest).unwrap(), bytes);
    assert!(!dir.path().join("trunc.blk").exists());
}

#[test]
fn test_flipped_payload_byte_is_repaired_then_semantic() {
    let dir = tempfile::tempdir().unwrap();
    let mut blocks = three_blocks();
    blocks[1][14] ^= 0x01;
    put(dir.path(), "flip.blk", &blocks.concat());

    let report = runner().run(&config(&dir, 1), Arc::new(NoProgress)).unwrap();
    let result = &report.results[0].result;
    assert_eq!(result.outcome, Outcome::FailedSemantic);
    assert_eq!(result.repairs.len(), 1);
    assert_eq!(result.repairs[0].anchor(), AnchorKind::ChecksumStart);
    assert_eq!(result.repairs[0].failed_at, blocks[0].len() as u64);
    assert_eq!(report.failed, 1);
    assert!(dir.path().join(QUARANTINE_DIR).join("flip.blk").exists());
}

#[test]
fn test_empty_file_passes() {
    let dir = tempfile::tempdir().unwrap();
    put(dir.path(), "empty.blk", &[]);

    let report = runner().run(&config(&dir, 1), Arc::new(NoProgress)).unwrap();
    assert_eq!(report.results[0].result.outcome, Outcome::Passed);
    assert_eq!(report.results[0].result.blocks, 0);
    assert_eq!(report.failed, 0);
}

#[test]
fn test_two_workers_count_one_failure() {
    let dir = tempfile::tempdir().unwrap();
    put(dir.path(), "a_good.blk", &three_blocks().concat());
    put(dir.path(), "b_bad.blk", &[0xFFu8; 9]);

    let report = runner().run(&config(&dir, 2), Arc::new(NoProgress)).unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.results[0].result.outcome, Outcome::Passed);
    assert_eq!(report.results[1].result.outcome, Outcome::FailedStructural);
    assert_eq!(report.workers, 2.min(available_workers()));
}

#[test]
fn test_worker_count_is_capped() {
    let dir = tempfile::tempdir().unwrap();
    put(dir.path(), "a.blk", &raw(2, b"x"));
    let report = runner().run(&config(&dir, 10_000), Arc::new(NoProgress)).unwrap();
    assert_eq!(report.workers, available_workers());
    let report = runner().run(&config(&dir, 0), Arc::new(NoProgress)).unwrap();
    assert_eq!(report.workers, 1);
}

#[test]
fn test_quarantine_collision_keeps_file_and_still_fails() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join(QUARANTINE_DIR)).unwrap();
    put(&dir.path().join(QUARANTINE_DIR), "bad.blk", b"earlier");
    put(dir.path(), "bad.blk", &[0u8; 5]);

    let report = runner().run(&config(&dir, 1), Arc::new(NoProgress)).unwrap();
    let file = &report.results[0];
    assert_eq!(report.failed, 1);
    assert!(file.quarantined_to.is_none());
    assert!(file.quarantine_error.as_deref().unwrap().contains("refusing to overwrite"));
    assert_eq!(fs::read(dir.path().join("bad.blk")).unwrap(), [0u8; 5]);
    assert_eq!(fs::read(dir.path().join(QUARANTINE_DIR).join("bad.blk")).unwrap(), b"earlier");
}

#[test]
fn test_no_quarantine_leaves_failures_in_place() {
    let dir = tempfile::tempdir().unwrap();
    put(dir.path(), "bad.blk", &[0u8; 5]);
    let cfg = BatchConfig { quarantine: false, ..config(&dir, 1) };

    let report = runner().run(&cfg, Arc::new(NoProgress)).unwrap();
    assert_eq!(report.failed, 1);
    assert!(dir.path().join("bad.blk").exists());
    assert!(!dir.path().join(QUARANTINE_DIR).exists());
}

#[test]
fn test_semantic_range_failure_is_quarantined() {
    use blockfile::class_table::CAMERA_IMAGE;
    let dir = tempfile::tempdir().unwrap();
    // width 0 is outside the accepted range.
    let header: Vec<u8> = [0u32, 2, 4].iter().flat_map(|v| v.to_le_bytes()).collect();
    let image = encode_block(&Block::new(RecordKey::new(CLASS_CAMERA, 1, 0, CAMERA_IMAGE), header));
    put(dir.path(), "img.blk", &image);

    let report = runner().run(&config(&dir, 1), Arc::new(NoProgress)).unwrap();
    let result = &report.results[0].result;
    assert_eq!(result.outcome, Outcome::FailedSemantic);
    assert!(result.repairs.is_empty());
    assert!(report.results[0].quarantined_to.is_some());
}

#[test]
fn test_cancelled_run_is_incomplete_not_failed() {
    let dir = tempfile::tempdir().unwrap();
    put(dir.path(), "a.blk", &[0u8; 5]);
    put(dir.path(), "b.blk", &three_blocks().concat());

    let runner = runner();
    runner.cancel_handle().store(true, std::sync::atomic::Ordering::SeqCst);
    let report = runner.run(&config(&dir, 2), Arc::new(NoProgress)).unwrap();
    assert!(report.results.iter().all(|r| r.result.outcome == Outcome::Incomplete));
    assert_eq!(report.failed, 0);
    assert_eq!(report.incomplete(), 2);
    assert!(dir.path().join("a.blk").exists());
}

#[test]
fn test_observer_sees_ordered_events_per_file() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..6 {
        let bytes = if i % 2 == 0 { three_blocks().concat() } else { vec![0xAB; 20] };
        put(dir.path(), &format!("f{i}.blk"), &bytes);
    }
    let recorder = Arc::new(Recorder::default());
    let report = runner().run(&config(&dir, 3), recorder.clone()).unwrap();
    assert_eq!(report.failed, 3);

    let events = recorder.0.lock().unwrap();
    for id in 0..6 {
        let mine: Vec<&String> = events.iter().filter(|(i, _)| *i == id).map(|(_, e)| e).collect();
        assert_eq!(mine.first().map(|s| s.as_str()), Some("new"));
        assert!(mine.last().unwrap().starts_with("done:"));
        assert_eq!(mine.iter().filter(|e| e.starts_with("done:")).count(), 1);
    }
}

#[test]
fn test_report_serialises_to_json() {
    let dir = tempfile::tempdir().unwrap();
    let mut blocks = three_blocks();
    blocks[2][16] ^= 0x80;
    put(dir.path(), "r.blk", &blocks.concat());

    let report = runner().run(&config(&dir, 1), Arc::new(NoProgress)).unwrap();
    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["failed"], 1);
    assert!(json["started_at"].is_string());
    assert_eq!(json["results"][0]["outcome"], "failed_semantic");
    assert_eq!(json["results"][0]["repairs"][0]["candidate"]["anchor_kind"], "checksum_start");
}
