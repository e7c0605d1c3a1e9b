//! Encoder lifecycle: progress, interruption, and failure latching.

use std::time::Duration;

use iris_file_engine::{
    validate_slide, EncodeSlideInfo, Encoder, EncoderStatus, Encoding, ResultFlag,
};

use super::test_utils::{wait_for_settled, wait_until, ThrottledSource};

fn encoder_with_source(source: ThrottledSource, dst: &std::path::Path) -> Encoder {
    let encoder = Encoder::create(EncodeSlideInfo {
        desired_encoding: Encoding::Iris,
        ..Default::default()
    })
    .unwrap();
    encoder.set_src_reader(source.shared()).unwrap();
    encoder.set_dst_path(dst).unwrap();
    encoder
}

#[test]
fn progress_is_monotone_and_completes() {
    // A 16x16-tile source (4096x4096 px) with a small per-tile delay keeps
    // the run observable while it is polled.
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("monotone.iris");
    let encoder = encoder_with_source(
        ThrottledSource::new(16, 16, Duration::from_millis(2)),
        &dst,
    );
    encoder.dispatch().unwrap();

    let mut samples = Vec::new();
    let mut last = encoder.progress();
    while last.status == EncoderStatus::Active && samples.len() < 100_000 {
        samples.push(last.progress);
        std::thread::sleep(Duration::from_millis(5));
        last = encoder.progress();
    }
    samples.push(last.progress);

    assert_eq!(last.status, EncoderStatus::Inactive, "{}", last.error_msg);
    assert_eq!(last.progress, 1.0);
    for window in samples.windows(2) {
        assert!(
            window[1] >= window[0],
            "progress regressed: {} then {}",
            window[0],
            window[1]
        );
    }

    assert!(validate_slide(&dst).unwrap().is_valid());
}

#[test]
fn interrupt_mid_encode_shuts_down_and_removes_output() {
    // 256 throttled tiles give the interrupt a wide window to land in.
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("interrupted.iris");
    let encoder = encoder_with_source(
        ThrottledSource::new(16, 16, Duration::from_millis(10)),
        &dst,
    );
    encoder.dispatch().unwrap();

    // Let some work happen first, then cancel.
    wait_until(&encoder, Duration::from_secs(30), |progress| {
        progress.progress > 0.0 || progress.status != EncoderStatus::Active
    });
    encoder.interrupt().unwrap();

    let settled = wait_for_settled(&encoder, Duration::from_secs(60));
    assert_eq!(settled.status, EncoderStatus::Shutdown);
    assert!(!dst.exists(), "partial output file must be deleted");

    // Shutdown resets back to a reusable encoder.
    encoder.reset().unwrap();
    assert_eq!(encoder.progress().status, EncoderStatus::Inactive);
}

#[test]
fn interrupt_before_progress_also_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("early-interrupt.iris");
    let encoder = encoder_with_source(
        ThrottledSource::new(16, 16, Duration::from_millis(10)),
        &dst,
    );
    encoder.dispatch().unwrap();
    encoder.interrupt().unwrap();

    let settled = wait_for_settled(&encoder, Duration::from_secs(60));
    assert_eq!(settled.status, EncoderStatus::Shutdown);
    assert!(!dst.exists());
}

#[test]
fn worker_failure_latches_error_state() {
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("failing.iris");
    let encoder = encoder_with_source(
        ThrottledSource::new(4, 4, Duration::from_millis(1)).failing_at(7),
        &dst,
    );
    encoder.dispatch().unwrap();

    let settled = wait_for_settled(&encoder, Duration::from_secs(60));
    assert_eq!(settled.status, EncoderStatus::Error);
    assert!(
        settled.error_msg.contains("synthetic read failure"),
        "unexpected message: {}",
        settled.error_msg
    );
    assert!(!dst.exists(), "failed run must not leave an output file");

    // Error state rejects a new dispatch until reset.
    let redispatch = encoder.dispatch();
    assert!(redispatch.is_err());
    assert_eq!(
        redispatch.unwrap_err().flag(),
        ResultFlag::Failure
    );
    encoder.reset().unwrap();
    assert_eq!(encoder.progress().status, EncoderStatus::Inactive);
}

#[test]
fn interrupt_while_inactive_is_harmless() {
    let encoder = Encoder::create(EncodeSlideInfo::default()).unwrap();
    encoder.interrupt().unwrap();
    assert_eq!(encoder.progress().status, EncoderStatus::Inactive);
}

#[test]
fn four_x_derivation_produces_shorter_pyramid() {
    use iris_file_engine::{DerivationLayers, EncoderDerivation, Slide, SlideOpenInfo};

    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("fourx.iris");
    let encoder = Encoder::create(EncodeSlideInfo {
        desired_encoding: Encoding::Iris,
        derivation: EncoderDerivation {
            layers: DerivationLayers::FourX,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();
    encoder
        .set_src_reader(ThrottledSource::new(16, 16, Duration::ZERO).shared())
        .unwrap();
    encoder.set_dst_path(&dst).unwrap();
    encoder.dispatch().unwrap();
    let settled = wait_for_settled(&encoder, Duration::from_secs(120));
    assert_eq!(settled.status, EncoderStatus::Inactive, "{}", settled.error_msg);

    let slide = Slide::open(SlideOpenInfo::new(&dst)).unwrap();
    let dims: Vec<u32> = slide
        .info()
        .extent
        .layers
        .iter()
        .map(|layer| layer.x_tiles)
        .collect();
    // 16 -> 4 -> 1 under 4x derivation.
    assert_eq!(dims, vec![1, 4, 16]);
}
