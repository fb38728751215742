//! Infos: the typed values parts return from hooks
//!
//! Every hook handler returns a list of [`Info`] values. The dispatcher gathers them
//! into a [`PartInfo`] map keyed by part name, and consumers pull out the variant they
//! care about with [`filter_values`] / [`unique_value`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ScanError, ScanResult};

/// Infos returned by each part for one hook, keyed by part name.
pub type PartInfo = BTreeMap<String, Vec<Info>>;

/// Motion controller coordinate-system axis names.
pub const CS_AXIS_NAMES: [&str; 9] = ["A", "B", "C", "U", "V", "W", "X", "Y", "Z"];

/// How a motor axis is mapped and how fast it may move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorInfo {
    /// Axis name within the coordinate system, one of [`CS_AXIS_NAMES`]
    pub cs_axis: String,
    /// Coordinate system port
    pub cs_port: String,
    /// Acceleration in EGU/s²
    pub acceleration: f64,
    /// EGU per motor count
    pub resolution: f64,
    /// EGU offset
    pub offset: f64,
    /// Maximum velocity in EGU/s
    pub max_velocity: f64,
    /// Position when status was reported
    pub current_position: f64,
    /// Generator axis this motor moves
    pub scannable: String,
    /// Settle time after a move, seconds
    pub velocity_settle: f64,
    /// Engineering units
    #[serde(default)]
    pub units: String,
}

impl MotorInfo {
    /// Time to ramp from standstill to full speed.
    pub fn acceleration_time(&self) -> f64 {
        self.max_velocity / self.acceleration
    }

    /// Shortest time to travel `distance` from rest to rest.
    ///
    /// Uses a trapezoidal profile when full speed is reached and a triangular one
    /// otherwise.
    pub fn move_time(&self, distance: f64) -> f64 {
        let distance = distance.abs();
        if distance == 0.0 {
            return 0.0;
        }
        let accel_time = self.acceleration_time();
        let ramp_distance = self.max_velocity * accel_time;
        if distance >= ramp_distance {
            2.0 * accel_time + (distance - ramp_distance) / self.max_velocity
        } else {
            2.0 * (distance / self.acceleration).sqrt()
        }
    }

    /// Time to change velocity from `v1` to `v2`.
    pub fn ramp_time(&self, v1: f64, v2: f64) -> f64 {
        (v2 - v1).abs() / self.acceleration
    }
}

/// Direction of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    /// Consumes a value published elsewhere
    In,
    /// Publishes a value
    Out,
}

/// Type of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortType {
    /// Boolean signal
    #[serde(rename = "bool")]
    Bool,
    /// Integer signal
    #[serde(rename = "int32")]
    Int32,
    /// Area detector array stream
    #[serde(rename = "NDArray")]
    NdArray,
    /// Motion controller coordinate system
    #[serde(rename = "CS")]
    Cs,
}

/// Port advertised by a part at reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Attribute carrying the port
    pub name: String,
    /// In or out
    pub direction: PortDirection,
    /// Signal type
    pub port_type: PortType,
    /// Current value
    pub value: String,
    /// Outport wire name, or the disconnected sentinel of an inport
    pub extra: String,
}

impl PortInfo {
    /// True when an inport is connected to something.
    pub fn is_connected(&self) -> bool {
        self.direction == PortDirection::Out || self.value != self.extra
    }
}

/// Position and visibility of a part on the layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutInfo {
    /// Part name
    pub name: String,
    /// Child mri
    pub mri: String,
    /// Horizontal position
    pub x: f64,
    /// Vertical position
    pub y: f64,
    /// Whether the child is shown
    pub visible: bool,
}

/// Which kind of NDAttribute is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeDatasetType {
    /// Extra detector channel
    Detector,
    /// Per-frame monitor value
    Monitor,
    /// Readback position
    Position,
}

/// Role of a dataset in the written file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DatasetType {
    /// Main detector data
    Primary,
    /// Data derived from the primary
    Secondary,
    /// Monitor channel
    Monitor,
    /// Demand position of an axis
    PositionSet,
    /// Readback position of an axis
    PositionValue,
}

/// A dataset the written file will contain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetProducer {
    /// Dataset name, e.g. `det.data`
    pub name: String,
    /// File the dataset lives in
    pub filename: String,
    /// Role of the dataset
    #[serde(rename = "type")]
    pub dataset_type: DatasetType,
    /// Rank including the scan dimensions
    pub rank: usize,
    /// Path within the file
    pub path: String,
    /// Path of the matching unique id dataset, empty for demand positions
    pub unique_id_path: String,
}

/// Everything a part can say in response to a hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Info {
    /// Validate should retry with `parameter` set to `value`
    ParameterTweak {
        /// Name of the configure parameter
        parameter: String,
        /// New value
        value: Value,
    },
    /// Progress of a running part
    RunProgress {
        /// Steps completed
        steps: u64,
    },
    /// Motor mapping and kinematics
    Motor(MotorInfo),
    /// Port advertised at reset
    Port(PortInfo),
    /// New layout of a child
    Layout(LayoutInfo),
    /// Field that can be exported to the parent block
    Exportable {
        /// Attribute or method name
        field: String,
    },
    /// Dataset written by a file writer
    DatasetProducer(DatasetProducer),
    /// Primary detector frames of the given rank
    NdArrayDataset {
        /// Rank of one frame
        rank: usize,
    },
    /// Scalar per frame derived from the primary data
    CalculatedNdAttributeDataset {
        /// Dataset name prefix
        name: String,
        /// NDAttribute holding the value
        attr: String,
    },
    /// Arbitrary NDAttribute captured alongside frames
    NdAttributeDataset {
        /// Dataset name prefix
        name: String,
        /// Kind of value
        #[serde(rename = "type")]
        dataset_type: AttributeDatasetType,
        /// NDAttribute holding the value
        attr: String,
        /// Rank of one value
        rank: usize,
    },
    /// Unix to Windows path mapping for a writer running on Windows
    FilePathTranslator {
        /// Drive letter, e.g. `X:`
        drive: String,
        /// Unix directory mounted on that drive
        mount_unix: String,
        /// UNC prefix, e.g. `\\dc\data`, used instead of the drive when set
        network_prefix: String,
    },
    /// Part settings for a saved design
    PartDesign(Value),
}

/// Extract one variant of [`Info`].
pub trait InfoKind: Sized {
    /// The variant's payload if `info` is that variant
    fn from_info(info: &Info) -> Option<Self>;
}

impl InfoKind for MotorInfo {
    fn from_info(info: &Info) -> Option<Self> {
        match info {
            Info::Motor(m) => Some(m.clone()),
            _ => None,
        }
    }
}

impl InfoKind for PortInfo {
    fn from_info(info: &Info) -> Option<Self> {
        match info {
            Info::Port(p) => Some(p.clone()),
            _ => None,
        }
    }
}

impl InfoKind for LayoutInfo {
    fn from_info(info: &Info) -> Option<Self> {
        match info {
            Info::Layout(l) => Some(l.clone()),
            _ => None,
        }
    }
}

impl InfoKind for DatasetProducer {
    fn from_info(info: &Info) -> Option<Self> {
        match info {
            Info::DatasetProducer(d) => Some(d.clone()),
            _ => None,
        }
    }
}

/// Path translation contributed by a part.
#[derive(Debug, Clone, PartialEq)]
pub struct PathTranslation {
    /// Drive letter
    pub drive: String,
    /// Unix mount point
    pub mount_unix: String,
    /// UNC prefix
    pub network_prefix: String,
}

impl InfoKind for PathTranslation {
    fn from_info(info: &Info) -> Option<Self> {
        match info {
            Info::FilePathTranslator {
                drive,
                mount_unix,
                network_prefix,
            } => Some(PathTranslation {
                drive: drive.clone(),
                mount_unix: mount_unix.clone(),
                network_prefix: network_prefix.clone(),
            }),
            _ => None,
        }
    }
}

/// `(parameter, value)` tweak requested during validate.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterTweak {
    /// Parameter name
    pub parameter: String,
    /// New value
    pub value: Value,
}

impl InfoKind for ParameterTweak {
    fn from_info(info: &Info) -> Option<Self> {
        match info {
            Info::ParameterTweak { parameter, value } => Some(ParameterTweak {
                parameter: parameter.clone(),
                value: value.clone(),
            }),
            _ => None,
        }
    }
}

/// Every info of kind `T`, in part-name order.
pub fn filter_values<T: InfoKind>(part_info: &PartInfo) -> Vec<T> {
    part_info
        .values()
        .flat_map(|infos| infos.iter().filter_map(T::from_info))
        .collect()
}

/// Infos of kind `T` grouped by the part that returned them.
pub fn filter_parts<T: InfoKind>(part_info: &PartInfo) -> BTreeMap<String, Vec<T>> {
    part_info
        .iter()
        .filter_map(|(part, infos)| {
            let found: Vec<T> = infos.iter().filter_map(T::from_info).collect();
            (!found.is_empty()).then(|| (part.clone(), found))
        })
        .collect()
}

/// At most one info of kind `T` across all parts.
pub fn unique_value<T: InfoKind>(part_info: &PartInfo, what: &str) -> ScanResult<Option<T>> {
    let mut found = filter_values::<T>(part_info);
    match found.len() {
        0 => Ok(None),
        1 => Ok(found.pop()),
        n => Err(ScanError::Configuration(format!(
            "Expected at most one {what}, got {n}"
        ))),
    }
}
