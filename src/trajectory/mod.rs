//! Trajectory planning for coordinate-system motion
//!
//! - [`profile`]: profile rows, velocity modes, user programs and tick quantisation
//! - [`planner`]: coordinate-system resolution and batch planning
//! - [`scaling`]: resolution/offset inheritance per CS axis
//!
//! Planning is pure; [`crate::parts::trajectory`] programs the batches into a motion
//! controller block and follows its progress.

pub mod planner;
pub mod profile;
pub mod scaling;

pub use planner::{minimum_duration, resolve_cs, CsMapping, Join, ProfilePlanner, MIN_POINT_DURATION_S};
pub use profile::{round_up_to_tick, ProfileBatch, TickQuantiser, UserProgram, VelocityMode, TICK_S};
pub use scaling::{AxisScaling, PositionKind, ScalingCache};
