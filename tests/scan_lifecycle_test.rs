//! End-to-end scans on the simulated beamline.

mod common;

use common::{harness, value_u64};
use rust_scan::block::{BlockView, BlockViewExt};
use rust_scan::info::DatasetType;
use rust_scan::{RunnableState, ScanError};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_snake_grid_single_run() {
    let h = harness("GRID").await;
    let controller = &h.beamline.controller;
    assert_eq!(controller.state(), RunnableState::Ready);

    let params = controller
        .configure(h.params(1.0, None))
        .await
        .expect("Configure failed");
    assert_eq!(params.generator.size(), 6);
    assert_eq!(controller.total_steps(), 6);
    assert_eq!(controller.configured_steps(), 6);
    assert_eq!(controller.state(), RunnableState::Armed);

    let producers = controller.dataset_producers();
    let primary = producers
        .iter()
        .find(|p| p.name == "det.data")
        .expect("No primary dataset");
    assert_eq!(primary.dataset_type, DatasetType::Primary);
    assert_eq!(primary.rank, 4);
    assert_eq!(primary.path, "/entry/detector/detector");
    for axis in ["x", "y"] {
        let set = producers
            .iter()
            .find(|p| p.name == format!("{axis}.value_set"))
            .expect("No set-point dataset");
        assert_eq!(set.dataset_type, DatasetType::PositionSet);
        assert_eq!(set.rank, 1);
    }
    assert!(producers.iter().any(|p| p.name == "det.StatsTotal"));

    controller.run().await.expect("Run failed");
    assert_eq!(controller.completed_steps(), 6);
    assert_eq!(controller.state(), RunnableState::Ready);
    assert_eq!(value_u64(h.beamline.writer.as_ref(), "uniqueId"), 6);
    assert_eq!(value_u64(h.beamline.detector.as_ref(), "arrayCounterReadback"), 6);
}

#[tokio::test(start_paused = true)]
async fn test_inner_axis_only_runs_each_row() {
    let h = harness("ROWS").await;
    let controller = &h.beamline.controller;

    controller
        .configure(h.params(1.0, Some(&["x"])))
        .await
        .expect("Configure failed");
    assert_eq!(controller.steps_per_run(), 3);
    assert_eq!(controller.configured_steps(), 3);

    controller.run().await.expect("First run failed");
    assert_eq!(controller.state(), RunnableState::Armed);
    assert_eq!(controller.completed_steps(), 3);
    assert_eq!(controller.configured_steps(), 6);

    controller.run().await.expect("Second run failed");
    assert_eq!(controller.state(), RunnableState::Ready);
    assert_eq!(controller.completed_steps(), 6);
    assert_eq!(value_u64(h.beamline.writer.as_ref(), "uniqueId"), 6);
}

#[tokio::test(start_paused = true)]
async fn test_no_axes_to_move_runs_whole_scan() {
    let h = harness("STILL").await;
    let controller = &h.beamline.controller;

    controller
        .configure(h.params(0.1, Some(&[])))
        .await
        .expect("Configure failed");
    assert_eq!(controller.steps_per_run(), 6);
    assert_eq!(value_u64(h.beamline.motion.as_ref(), "pointsBuilt"), 0);

    controller.run().await.expect("Run failed");
    assert_eq!(controller.completed_steps(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_short_duration_is_tweaked_by_validate() {
    let h = harness("TWEAK").await;
    let params = h
        .beamline
        .controller
        .validate(h.params(0.01, None))
        .await
        .expect("Validate failed");
    // 0.5 mm per point at 1 mm/s
    assert!(params.generator.duration >= 0.5);
    let exposure = params.exposure.expect("Exposure not derived");
    assert!(exposure > 0.0 && exposure <= params.generator.duration - 0.002);
}

#[tokio::test(start_paused = true)]
async fn test_inconsistent_coordinate_system_is_rejected() {
    let h = harness("CS").await;
    let motor = h.beamline.registry.get("CS:MOTOR:Y").expect("No y motor");
    motor.put("cs", json!("CS2,B")).await.expect("Failed to move motor");

    let err = h
        .beamline
        .controller
        .configure(h.params(1.0, None))
        .await
        .expect_err("Configure should fail");
    assert!(matches!(err, ScanError::InconsistentCoordinateSystem(_)), "{err}");
    assert_eq!(h.beamline.controller.state(), RunnableState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_axis_to_move_is_rejected() {
    let h = harness("AXES").await;
    let err = h
        .beamline
        .controller
        .configure(h.params(1.0, Some(&["z"])))
        .await
        .expect_err("Configure should fail");
    assert!(matches!(err, ScanError::MissingScannable(_)), "{err}");
}

#[tokio::test(start_paused = true)]
async fn test_configure_abort_reset_returns_to_ready() {
    let h = harness("ABORT").await;
    let controller = &h.beamline.controller;

    controller
        .configure(h.params(1.0, None))
        .await
        .expect("Configure failed");
    controller.abort().await.expect("Abort failed");
    assert_eq!(controller.state(), RunnableState::Aborted);

    controller.reset().await.expect("Reset failed");
    assert_eq!(controller.state(), RunnableState::Ready);
    assert_eq!(controller.completed_steps(), 0);
    assert_eq!(controller.configured_steps(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_is_rejected_before_configure() {
    let h = harness("EARLY").await;
    let err = h.beamline.controller.run().await.expect_err("Run should fail");
    assert!(matches!(err, ScanError::BadTransition { .. }), "{err}");
    let state: String = h.beamline.controller.get("state").expect("No state");
    assert_eq!(state, "Ready");
}
