//! A writer that stops capturing drives the scan into Fault.

mod common;

use common::harness;
use rust_scan::block::BlockView;
use rust_scan::{RunnableState, ScanError};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_stalled_writer_faults_scan() {
    let h = harness("STALL").await;
    let controller = &h.beamline.controller;
    h.beamline
        .writer
        .put("stalled", json!(true))
        .await
        .expect("Failed to stall writer");

    controller
        .configure(h.params(0.1, None))
        .await
        .expect("Configure failed");
    let err = controller.run().await.expect_err("Run should fail");
    assert!(matches!(err, ScanError::WriterStalled { .. }), "{err}");
    assert_eq!(controller.state(), RunnableState::Fault);

    controller.reset().await.expect("Reset failed");
    assert_eq!(controller.state(), RunnableState::Ready);
}
