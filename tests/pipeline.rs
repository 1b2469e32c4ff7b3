use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use roi_recorder::storage::memory::WriteGate;
use roi_recorder::{
    verify_region_dir, CapturePolicy, ChunkedStore, Dispatcher, DispatcherConfig, ExitCode, Frame,
    FrameSource, Image, ImageShape, LogContext, MemoryStorage, OverflowPolicy, PipelineError,
    Recorder, RecorderConfig, RecorderState, Region, SourceConfig, SyntheticSource,
};

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn recorder_config(buffer_size: usize, overflow: OverflowPolicy) -> RecorderConfig {
    RecorderConfig {
        buffer_size,
        overflow,
        poll_interval: Duration::from_millis(5),
        ..RecorderConfig::default()
    }
}

fn recorder(storage: &MemoryStorage, path: &str, config: RecorderConfig) -> Recorder {
    Recorder::new(
        0,
        path,
        ImageShape::new(8, 4, 1),
        Arc::new(storage.clone()),
        config,
        LogContext::for_region(0),
    )
}

fn frame(sequence: u64) -> Frame {
    Frame::new(sequence as f64 / 30.0, sequence, Image::filled(8, 4, 1, sequence as u8))
}

fn synthetic(width: u32, height: u32, frames: u64) -> Box<dyn FrameSource> {
    Box::new(
        SyntheticSource::new(SourceConfig {
            url: "stub://gradient".to_string(),
            width,
            height,
            paced: false,
            max_frames: Some(frames),
            ..SourceConfig::default()
        })
        .expect("synthetic source"),
    )
}

/// Delivers `fail_after` frames, then fails `failures` times in a row, then delivers
/// frames again until `total` have been captured.
struct FlakySource {
    fail_after: u64,
    failures: u32,
    total: u64,
    delivered: u64,
    failed: u32,
}

impl FlakySource {
    fn new(fail_after: u64, failures: u32, total: u64) -> Box<dyn FrameSource> {
        Box::new(Self {
            fail_after,
            failures,
            total,
            delivered: 0,
            failed: 0,
        })
    }
}

impl FrameSource for FlakySource {
    fn resolution(&self) -> (u32, u32) {
        (16, 8)
    }

    fn channels(&self) -> u8 {
        1
    }

    fn next_frame(&mut self) -> Result<Option<(f64, Image)>> {
        if self.delivered == self.fail_after && self.failed < self.failures {
            self.failed += 1;
            return Err(anyhow!("camera timeout"));
        }
        if self.delivered >= self.total {
            return Ok(None);
        }
        self.delivered += 1;
        Ok(Some((self.delivered as f64, Image::filled(16, 8, 1, 7))))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn dispatcher_config(regions: Vec<Region>, recorder: RecorderConfig) -> DispatcherConfig {
    DispatcherConfig {
        regions,
        recorder,
        capture: CapturePolicy {
            max_attempts: 3,
            retry_delay: Duration::from_millis(1),
        },
        ..DispatcherConfig::default()
    }
}

// ----------------------------------------------------------------------------
// Recorder
// ----------------------------------------------------------------------------

#[test]
fn frames_reach_storage_in_capture_order() {
    let storage = MemoryStorage::new().with_write_delay(Duration::from_millis(1));
    let mut rec = recorder(&storage, "ordered", recorder_config(8, OverflowPolicy::DropOldest));
    rec.open().unwrap();
    rec.start().unwrap();
    for seq in 0..40 {
        rec.write(frame(seq)).unwrap();
    }
    rec.close();

    let sequences = storage.recording(Path::new("ordered")).unwrap().sequences();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(sequences.len() as u64 + rec.lost_frames(), 40);
}

#[test]
fn block_policy_loses_nothing_with_a_slow_writer() {
    let storage = MemoryStorage::new().with_write_delay(Duration::from_millis(2));
    let mut rec = recorder(&storage, "blocking", recorder_config(4, OverflowPolicy::Block));
    rec.open().unwrap();
    rec.start().unwrap();
    for seq in 0..40 {
        rec.write(frame(seq)).unwrap();
        assert!(rec.buffered_frames() <= rec.capacity());
    }
    assert_eq!(rec.close(), ExitCode::Clean);

    assert_eq!(rec.lost_frames(), 0);
    assert_eq!(rec.n_saved_frames(), 40);
    let recording = storage.recording(Path::new("blocking")).unwrap();
    assert_eq!(recording.sequences(), (0..40).collect::<Vec<_>>());
}

#[test]
fn drop_oldest_keeps_the_newest_frames() {
    let storage = MemoryStorage::new();
    let mut rec = recorder(&storage, "dropping", recorder_config(5, OverflowPolicy::DropOldest));
    // Nothing drains the buffer until the writer starts.
    for seq in 0..8 {
        rec.write(frame(seq)).unwrap();
        assert!(rec.buffered_frames() <= 5);
    }
    assert_eq!(rec.lost_frames(), 3);
    assert_eq!(rec.buffered_frames(), 5);

    rec.open().unwrap();
    rec.start().unwrap();
    assert_eq!(rec.close(), ExitCode::Clean);

    let recording = storage.recording(Path::new("dropping")).unwrap();
    assert_eq!(recording.sequences(), vec![3, 4, 5, 6, 7]);
    assert_eq!(rec.n_saved_frames() + rec.lost_frames(), 8);
}

#[test]
fn clean_shutdown_drains_everything() {
    let storage = MemoryStorage::new().with_write_delay(Duration::from_millis(1));
    let mut rec = recorder(&storage, "drained", recorder_config(64, OverflowPolicy::DropOldest));
    rec.open().unwrap();
    rec.start().unwrap();
    for seq in 0..50 {
        rec.write(frame(seq)).unwrap();
    }
    let code = rec.close();

    assert_eq!(code, ExitCode::Clean);
    assert_eq!(code.code(), 0);
    assert_eq!(rec.state(), RecorderState::Closed);
    assert_eq!(rec.buffered_frames(), 0);
    assert_eq!(rec.pending_control(), 0);
    assert!(!rec.is_writer_alive());
    assert_eq!(rec.n_saved_frames(), 50);
    let recording = storage.recording(Path::new("drained")).unwrap();
    assert!(recording.closed);
    assert_eq!(recording.close_calls, 1);
}

#[test]
fn close_is_idempotent() {
    let storage = MemoryStorage::new();
    let mut rec = recorder(&storage, "twice", recorder_config(4, OverflowPolicy::DropOldest));
    rec.open().unwrap();
    rec.start().unwrap();
    rec.write(frame(0)).unwrap();

    assert_eq!(rec.close(), ExitCode::Clean);
    assert_eq!(rec.close(), ExitCode::Clean);
    assert!(matches!(
        rec.write(frame(1)),
        Err(PipelineError::State { .. })
    ));
    let recording = storage.recording(Path::new("twice")).unwrap();
    assert_eq!(recording.close_calls, 1);
    assert_eq!(recording.sequences(), vec![0]);
}

#[test]
fn stuck_writer_reports_unflushed_on_join_timeout() {
    let gate = WriteGate::closed();
    let storage = MemoryStorage::new().with_gate(gate.clone());
    let mut rec = recorder(&storage, "stuck", recorder_config(4, OverflowPolicy::DropOldest));
    rec.open().unwrap();
    rec.start().unwrap();
    for seq in 0..3 {
        rec.write(frame(seq)).unwrap();
    }
    rec.request_stop();
    assert_eq!(rec.join(Duration::from_millis(50)), ExitCode::Unflushed);
    assert!(!rec.is_finished());

    gate.open();
    assert_eq!(rec.close(), ExitCode::Clean);
    assert_eq!(rec.n_saved_frames(), 3);
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

#[test]
fn regions_record_independently() {
    let storage = MemoryStorage::new();
    let regions = vec![Region::new(0, 0, 100, 50), Region::new(50, 50, 200, 200)];
    let mut dispatcher = Dispatcher::new(
        synthetic(300, 300, 60),
        Arc::new(storage.clone()),
        dispatcher_config(regions, recorder_config(128, OverflowPolicy::Block)),
    );
    dispatcher.open(Path::new("isolated")).unwrap();
    let report = dispatcher.run().unwrap();

    assert_eq!(report.frames_captured, 60);
    assert_eq!(report.exit_code(), ExitCode::Clean);
    assert_eq!(report.total_lost(), 0);

    let first = storage.recording(Path::new("isolated_ROI_0")).unwrap();
    let second = storage.recording(Path::new("isolated_ROI_1")).unwrap();
    assert_eq!(first.frames.len(), 60);
    assert_eq!(second.frames.len(), 60);
    assert!(first.frames.iter().all(|f| f.shape.dims() == (50, 100)));
    assert!(second.frames.iter().all(|f| f.shape.dims() == (200, 200)));
    assert_eq!(first.sequences(), second.sequences());
    for region in &report.regions {
        assert_eq!(region.saved, 60);
        assert_eq!(region.lost, 0);
    }
}

#[test]
fn write_failures_stay_inside_their_region() {
    let storage = MemoryStorage::new().with_failures_at("failing_ROI_0", [3, 4, 5, 17]);
    let regions = vec![Region::new(0, 0, 8, 8), Region::new(8, 0, 8, 8)];
    let mut dispatcher = Dispatcher::new(
        synthetic(16, 8, 30),
        Arc::new(storage.clone()),
        dispatcher_config(regions, recorder_config(64, OverflowPolicy::Block)),
    );
    dispatcher.open(Path::new("failing")).unwrap();
    let report = dispatcher.run().unwrap();

    assert_eq!(report.frames_captured, 30);
    assert_eq!(report.exit_code(), ExitCode::Clean);
    let (broken, healthy) = (&report.regions[0], &report.regions[1]);
    assert_eq!(broken.exit_code, ExitCode::Clean);
    assert_eq!(broken.saved, 26);
    assert_eq!(broken.write_errors, 4);
    assert_eq!(healthy.exit_code, ExitCode::Clean);
    assert_eq!(healthy.saved, 30);
    assert_eq!(healthy.write_errors, 0);

    let sequences = storage
        .recording(Path::new("failing_ROI_0"))
        .unwrap()
        .sequences();
    assert!(!sequences.contains(&4));
    assert!(sequences.contains(&18));
    assert_eq!(
        storage.recording(Path::new("failing_ROI_1")).unwrap().sequences(),
        (0..30).collect::<Vec<_>>()
    );
}

#[test]
fn chunked_store_rolls_over_and_verifies() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("session");
    let recorder = RecorderConfig {
        framerate: 30.0,
        chunk_duration_s: 0.5,
        ..recorder_config(128, OverflowPolicy::Block)
    };
    let mut dispatcher = Dispatcher::new(
        synthetic(32, 24, 60),
        Arc::new(ChunkedStore),
        dispatcher_config(vec![Region::full(32, 24)], recorder),
    );
    dispatcher.open(&base).unwrap();
    let report = dispatcher.run().unwrap();

    assert_eq!(report.exit_code(), ExitCode::Clean);
    assert_eq!(report.regions[0].saved, 60);
    assert_eq!(report.regions[0].chunks, 4);

    let region_dir = dir.path().join("session_ROI_0");
    let check = verify_region_dir(&region_dir).unwrap();
    assert_eq!(check.format.as_deref(), Some("chunked-store"));
    assert_eq!(check.chunks.len(), 4);
    assert_eq!(check.snapshots.len(), 4);
    assert_eq!(check.frames, Some(60));
    assert!(check.is_complete(), "{:?}", check);
}

#[test]
fn max_frames_ends_the_session() {
    let storage = MemoryStorage::new();
    let recorder = RecorderConfig {
        max_frames: Some(10),
        ..recorder_config(4, OverflowPolicy::Block)
    };
    let mut dispatcher = Dispatcher::new(
        synthetic(16, 16, 1_000_000),
        Arc::new(storage.clone()),
        dispatcher_config(vec![Region::full(16, 16)], recorder),
    );
    dispatcher.open(Path::new("limited")).unwrap();
    let report = dispatcher.run().unwrap();

    assert_eq!(report.exit_code(), ExitCode::Clean);
    assert!(report.regions[0].saved >= 10);
    assert!(report.frames_captured < 1_000_000);
}

#[test]
fn first_capture_failure_is_fatal() {
    let storage = MemoryStorage::new();
    let mut dispatcher = Dispatcher::new(
        FlakySource::new(0, 1, 10),
        Arc::new(storage.clone()),
        dispatcher_config(
            vec![Region::full(16, 8)],
            recorder_config(8, OverflowPolicy::DropOldest),
        ),
    );
    dispatcher.open(Path::new("no_camera")).unwrap();
    let err = dispatcher.run().unwrap_err();

    assert!(matches!(err, PipelineError::Capture { attempts: 1, .. }));
    let rec = &dispatcher.recorders()[0];
    assert_eq!(rec.state(), RecorderState::Closed);
    assert_eq!(rec.exit_code(), Some(ExitCode::Clean));
    assert_eq!(rec.n_saved_frames(), 0);
}

#[test]
fn capture_retries_recover_from_transient_failures() {
    let storage = MemoryStorage::new();
    let mut dispatcher = Dispatcher::new(
        FlakySource::new(5, 2, 10),
        Arc::new(storage.clone()),
        dispatcher_config(
            vec![Region::full(16, 8)],
            recorder_config(16, OverflowPolicy::Block),
        ),
    );
    dispatcher.open(Path::new("flaky")).unwrap();
    let report = dispatcher.run().unwrap();

    assert_eq!(report.frames_captured, 10);
    assert_eq!(report.regions[0].saved, 10);
}

#[test]
fn exhausted_retries_tear_down_cleanly() {
    let storage = MemoryStorage::new();
    let mut dispatcher = Dispatcher::new(
        FlakySource::new(5, 10, 20),
        Arc::new(storage.clone()),
        dispatcher_config(
            vec![Region::full(16, 8), Region::new(0, 0, 8, 8)],
            recorder_config(16, OverflowPolicy::Block),
        ),
    );
    dispatcher.open(Path::new("lost_camera")).unwrap();
    let err = dispatcher.run().unwrap_err();

    assert!(matches!(err, PipelineError::Capture { attempts: 3, .. }));
    for rec in dispatcher.recorders() {
        assert_eq!(rec.exit_code(), Some(ExitCode::Clean));
        assert_eq!(rec.n_saved_frames(), 5);
        assert!(!rec.is_writer_alive());
    }
    let report = dispatcher.close();
    assert_eq!(report.frames_captured, 5);
}
