//! Simulated devices
//!
//! In-process blocks standing in for the hardware a scan drives. They keep time
//! with `tokio::time`, so tests running on a paused clock execute whole scans
//! instantly:
//!
//! - [`motor_block`]: a motor record in a coordinate system
//! - [`motion_controller_block`]: executes profile rows, publishing `pointsScanned`
//! - [`detector_block`]: acquires frames and publishes their ids on `uniqueId`
//! - [`stats_block`], [`position_labeller_block`], [`hdf_writer_block`]: plugins
//!   following the detector's frames
//!
//! [`Beamline`] wires one of each behind a runnable controller.

pub mod detector;
pub mod hdf_writer;
pub mod labeller;
pub mod motion;
pub mod motor;
pub mod stats;

pub use detector::detector_block;
pub use hdf_writer::hdf_writer_block;
pub use labeller::position_labeller_block;
pub use motion::motion_controller_block;
pub use motor::{motor_block, MotorSettings};
pub use stats::stats_block;

use std::sync::Arc;

use tracing::info;

use crate::block::{Block, BlockRegistry};
use crate::config::ScanConfig;
use crate::controller::RunnableController;
use crate::error::ScanResult;
use crate::parts::{
    DetectorDriverPart, HdfWriterPart, MotorAxisPart, PositionLabellerPart, StatsPluginPart, TrajectoryPart,
};

/// Readout time of the simulated detector in seconds.
pub const DETECTOR_READOUT_S: f64 = 0.002;

/// A complete simulated beamline: two motors on `CS1`, a motion controller, a
/// detector with stats, labeller and writer plugins, and the scan controller.
pub struct Beamline {
    /// Every block, including the controller
    pub registry: Arc<BlockRegistry>,
    /// Scan controller, registered as `<prefix>:SCAN`
    pub controller: Arc<RunnableController>,
    /// Motion controller
    pub motion: Arc<Block>,
    /// Detector driver
    pub detector: Arc<Block>,
    /// File writer
    pub writer: Arc<Block>,
    /// Position labeller
    pub labeller: Arc<Block>,
}

impl std::fmt::Debug for Beamline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Beamline")
            .field("controller", &self.controller.mri())
            .finish_non_exhaustive()
    }
}

impl Beamline {
    /// Build every block under `prefix`, add the parts and initialise the controller.
    ///
    /// Scannable `x` is `CS1` axis `A`, `y` is axis `B`.
    pub async fn build(prefix: &str, config: &ScanConfig) -> ScanResult<Self> {
        let registry = Arc::new(BlockRegistry::new());
        let mri = |name: &str| format!("{prefix}:{name}");

        for (scannable, axis) in [("x", "A"), ("y", "B")] {
            let settings = MotorSettings::new("CS1", axis);
            registry.register(motor_block(&mri(&format!("MOTOR:{}", scannable.to_uppercase())), &settings))?;
        }
        let motion = motion_controller_block(&mri("PMAC"), "CS1");
        let detector = detector_block(&mri("DET"), DETECTOR_READOUT_S);
        let writer = hdf_writer_block(&mri("HDF"), detector.clone());
        let labeller = position_labeller_block(&mri("POS"), detector.clone());
        registry.register(motion.clone())?;
        registry.register(detector.clone())?;
        registry.register(writer.clone())?;
        registry.register(labeller.clone())?;
        registry.register(stats_block(&mri("STAT")))?;

        let controller = RunnableController::new(mri("SCAN"), config.controller.clone(), registry.clone());
        controller.add_part(Arc::new(MotorAxisPart::new("x", mri("MOTOR:X"))))?;
        controller.add_part(Arc::new(MotorAxisPart::new("y", mri("MOTOR:Y"))))?;
        controller.add_part(Arc::new(TrajectoryPart::new("pmac", mri("PMAC"), &config.trajectory)))?;
        controller.add_part(Arc::new(DetectorDriverPart::new("det", mri("DET"), &config.detector)))?;
        controller.add_part(Arc::new(StatsPluginPart::new("stat", mri("STAT"), "det")))?;
        controller.add_part(Arc::new(PositionLabellerPart::new("pos", mri("POS"))))?;
        controller.add_part(Arc::new(HdfWriterPart::new("hdf", mri("HDF"), &config.writer)))?;
        registry.register(controller.clone())?;
        controller.init().await?;
        info!(prefix, "Simulated beamline ready");

        Ok(Self {
            registry,
            controller,
            motion,
            detector,
            writer,
            labeller,
        })
    }
}
