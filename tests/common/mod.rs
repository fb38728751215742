//! Shared fixtures for the scan integration tests.
#![allow(dead_code)]

use std::time::Duration;

use rust_scan::block::{BlockView, BlockViewExt};
use rust_scan::config::ScanConfig;
use rust_scan::generator::{CompoundGenerator, LineSpec};
use rust_scan::hooks::ConfigureParams;
use rust_scan::sim::Beamline;
use tempfile::TempDir;

/// Simulated beamline whose designs and data live in a temporary directory.
pub struct Harness {
    pub beamline: Beamline,
    pub config: ScanConfig,
    pub dir: TempDir,
}

impl Harness {
    /// Controller mri of the beamline
    pub fn scan_mri(&self) -> String {
        self.beamline.controller.mri().to_string()
    }

    /// Directory data files are written to
    pub fn data_dir(&self) -> String {
        self.dir.path().join("data").to_string_lossy().into_owned()
    }

    /// Parameters for the 2x3 snake grid written into the harness directory.
    pub fn params(&self, duration: f64, axes_to_move: Option<&[&str]>) -> ConfigureParams {
        let mut params = ConfigureParams::new(grid(duration)).with_file_dir(self.data_dir());
        if let Some(axes) = axes_to_move {
            params = params.with_axes_to_move(axes);
        }
        params
    }
}

/// Test configuration keeping designs under `dir`.
pub fn config(dir: &TempDir) -> ScanConfig {
    let mut config = ScanConfig::default();
    config.controller.design_dir = dir.path().join("designs");
    config
}

/// Build a beamline named `prefix`.
pub async fn harness(prefix: &str) -> Harness {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = config(&dir);
    let beamline = Beamline::build(prefix, &config)
        .await
        .expect("Failed to build beamline");
    Harness { beamline, config, dir }
}

/// y (outer, 2 points) by x (inner, 3 points), snaking.
pub fn grid(duration: f64) -> CompoundGenerator {
    CompoundGenerator::new(
        vec![
            LineSpec::new("y", "mm", 0.0, 1.0, 2),
            LineSpec::new("x", "mm", 0.0, 1.0, 3),
        ],
        duration,
        true,
    )
}

/// Wait (on the test clock) until `attribute` of `view` satisfies `predicate`.
pub async fn wait_for(view: &dyn BlockView, attribute: &str, predicate: impl Fn(u64) -> bool) {
    let mut rx = view.subscribe(attribute).expect("Failed to subscribe");
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            if rx.borrow_and_update().value.as_u64().is_some_and(&predicate) {
                return;
            }
            rx.changed().await.expect("Attribute closed");
        }
    })
    .await
    .expect("Timed out waiting for attribute");
}

/// Current value of a numeric attribute
pub fn value_u64(view: &dyn BlockView, attribute: &str) -> u64 {
    view.get(attribute).expect("Failed to read attribute")
}
