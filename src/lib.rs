//! # Rust Scan Library
//!
//! Coordinates multi-dimensional scans across motion controllers, area detectors
//! and HDF5 file writers. A [`controller::RunnableController`] owns the scan state
//! machine and drives a set of [`part::Part`]s through lifecycle hooks; each part
//! programs one device block.
//!
//! ## Crate Structure
//!
//! - **`error`**: the `ScanError` enum shared by every module.
//! - **`config`**: `ScanConfig`, loaded from TOML and `RUST_SCAN_` environment variables.
//! - **`tracing_config`**: tracing-subscriber initialisation.
//! - **`block`**: attributes, methods and the `BlockView` trait devices are driven through.
//! - **`context`**: per-hook handle with cancellation, waits and progress reporting.
//! - **`generator`**: the nested line scan producing points and dimensions.
//! - **`info`**: what parts report to each other between hooks.
//! - **`hooks`** / **`part`**: the lifecycle hooks and the part plug-in trait.
//! - **`controller`**: the runnable state machine, hook dispatch and saved designs.
//! - **`trajectory`**: profile planning for coordinate-system motion.
//! - **`writer`**: dataset producers, dimension slots and the HDF5 layout document.
//! - **`parts`**: parts for motors, motion controllers, detectors, plugins, writers
//!   and child controllers.
//! - **`sim`**: simulated blocks and a complete simulated beamline.

pub mod block;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod generator;
pub mod hooks;
pub mod info;
pub mod part;
pub mod parts;
pub mod sim;
pub mod tracing_config;
pub mod trajectory;
pub mod writer;

pub use controller::{RunnableController, RunnableState};
pub use error::{ScanError, ScanResult};
