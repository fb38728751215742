//! Simulated motor record.

use std::sync::Arc;

use serde_json::json;

use crate::block::{AttributeMeta, Block};

/// Kinematics and coordinate-system assignment of a simulated motor.
#[derive(Debug, Clone, PartialEq)]
pub struct MotorSettings {
    /// Coordinate system port, e.g. `CS1`
    pub cs_port: String,
    /// CS axis letter
    pub cs_axis: String,
    /// EGU/s²
    pub acceleration: f64,
    /// EGU per count
    pub resolution: f64,
    /// EGU offset
    pub offset: f64,
    /// EGU/s
    pub max_velocity: f64,
    /// Starting position
    pub position: f64,
    /// Settle time after a move
    pub velocity_settle: f64,
    /// Engineering units
    pub units: String,
}

impl MotorSettings {
    /// 1 mm/s motor with 10 mm/s² acceleration on `cs_port`/`cs_axis`.
    pub fn new(cs_port: &str, cs_axis: &str) -> Self {
        Self {
            cs_port: cs_port.to_string(),
            cs_axis: cs_axis.to_string(),
            acceleration: 10.0,
            resolution: 0.001,
            offset: 0.0,
            max_velocity: 1.0,
            position: 0.0,
            velocity_settle: 0.0,
            units: "mm".to_string(),
        }
    }

    /// Override the maximum velocity and acceleration.
    pub fn with_kinematics(mut self, max_velocity: f64, acceleration: f64) -> Self {
        self.max_velocity = max_velocity;
        self.acceleration = acceleration;
        self
    }

    /// Override the resolution and offset.
    pub fn with_scaling(mut self, resolution: f64, offset: f64) -> Self {
        self.resolution = resolution;
        self.offset = offset;
        self
    }
}

/// Motor block exposing `cs` as `"<port>,<axis>"` plus its kinematics.
pub fn motor_block(mri: &str, settings: &MotorSettings) -> Arc<Block> {
    let cs = if settings.cs_port.is_empty() {
        String::new()
    } else {
        format!("{},{}", settings.cs_port, settings.cs_axis)
    };
    Block::builder(mri)
        .attribute("cs", json!(cs), AttributeMeta::new("Coordinate system port and axis").config())
        .attribute("acceleration", json!(settings.acceleration), AttributeMeta::new("EGU/s²").config())
        .attribute("resolution", json!(settings.resolution), AttributeMeta::new("EGU per count").config())
        .attribute("offset", json!(settings.offset), AttributeMeta::new("EGU offset").config())
        .attribute("maxVelocity", json!(settings.max_velocity), AttributeMeta::new("EGU/s").config())
        .attribute("readback", json!(settings.position), AttributeMeta::new("Current position").writeable())
        .attribute(
            "velocitySettle",
            json!(settings.velocity_settle),
            AttributeMeta::new("Settle time after a move").config(),
        )
        .attribute("units", json!(settings.units), AttributeMeta::new("Engineering units"))
        .build()
}
