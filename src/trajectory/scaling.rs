//! Axis resolution/offset inheritance
//!
//! A CS axis is programmed with the resolution and offset of the motor feeding it.
//! Relative positions only take the scale and units; absolute positions also take
//! the offset. The cache remembers which scannable each CS axis inherited from, so
//! scaling is written again only when that source changes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::info::MotorInfo;

/// Kind of position a parameter holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionKind {
    /// Absolute position: inherits scale, offset and units
    Pos,
    /// Position relative to a reference: inherits scale and units
    RelativePos,
}

/// Scale, offset and units of an axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisScaling {
    /// EGU per count
    pub scale: f64,
    /// EGU offset
    pub offset: f64,
    /// Engineering units
    pub units: String,
}

impl AxisScaling {
    /// Scaling of a motor.
    pub fn from_motor(motor: &MotorInfo) -> Self {
        Self {
            scale: motor.resolution,
            offset: motor.offset,
            units: motor.units.clone(),
        }
    }

    /// Scaling inherited from `source` for a position of the given kind.
    pub fn inherit(source: &AxisScaling, kind: PositionKind) -> Self {
        match kind {
            PositionKind::Pos => source.clone(),
            PositionKind::RelativePos => Self {
                scale: source.scale,
                offset: 0.0,
                units: source.units.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Inherited {
    scannable: String,
    kind: PositionKind,
    scaling: AxisScaling,
}

/// Scaling per CS axis, keyed by the scannable it was inherited from.
#[derive(Debug, Clone, Default)]
pub struct ScalingCache {
    axes: BTreeMap<String, Inherited>,
}

impl ScalingCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scaling for `cs_axis` fed by `motor`, and whether it differs from last time.
    pub fn resolve(&mut self, cs_axis: &str, motor: &MotorInfo, kind: PositionKind) -> (AxisScaling, bool) {
        let scaling = AxisScaling::inherit(&AxisScaling::from_motor(motor), kind);
        let entry = Inherited {
            scannable: motor.scannable.clone(),
            kind,
            scaling: scaling.clone(),
        };
        let changed = self.axes.get(cs_axis) != Some(&entry);
        if changed {
            self.axes.insert(cs_axis.to_string(), entry);
        }
        (scaling, changed)
    }

    /// Scannable `cs_axis` currently inherits from
    pub fn source(&self, cs_axis: &str) -> Option<&str> {
        self.axes.get(cs_axis).map(|i| i.scannable.as_str())
    }

    /// Forget every axis.
    pub fn clear(&mut self) {
        self.axes.clear();
    }
}
