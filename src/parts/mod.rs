//! Parts: the per-device plug-ins a runnable controller orchestrates
//!
//! Each part registers hook handlers with the controller and talks to exactly one
//! block (or none, for [`FilePathTranslatorPart`]).
//!
//! | Part                        | Block                      | Hooks                                  |
//! |-----------------------------|----------------------------|----------------------------------------|
//! | [`MotorAxisPart`]           | motor record               | ReportStatus, ReportPorts              |
//! | [`TrajectoryPart`]          | motion controller          | Validate, Configure .. Abort, Save/Load|
//! | [`DetectorDriverPart`]      | area detector driver       | Validate, ReportStatus, Configure .. Abort |
//! | [`StatsPluginPart`]         | statistics plugin          | ReportStatus, Configure                |
//! | [`PositionLabellerPart`]    | position labeller plugin   | Configure .. Abort                     |
//! | [`HdfWriterPart`]           | HDF5 file writer           | Configure .. Abort                     |
//! | [`FilePathTranslatorPart`]  | none                       | ReportStatus                           |
//! | [`ChildPart`]               | child runnable controller  | Validate .. Abort, Save/Load           |

pub mod child;
pub mod detector;
pub mod filepath;
pub mod hdf_writer;
pub mod motor;
pub mod position_labeller;
pub mod stats;
pub mod trajectory;

pub use child::ChildPart;
pub use detector::DetectorDriverPart;
pub use filepath::FilePathTranslatorPart;
pub use hdf_writer::HdfWriterPart;
pub use motor::MotorAxisPart;
pub use position_labeller::{PositionLabellerPart, POSITIONS_PER_XML};
pub use stats::StatsPluginPart;
pub use trajectory::{TrajectoryPart, TrajectorySettings};

use serde_json::{Map, Value};

use crate::block::BlockView;
use crate::context::Context;
use crate::error::{ScanError, ScanResult};
use crate::info::Info;

/// Capture the named attributes of `view` as a part design.
pub(crate) fn save_attributes(view: &dyn BlockView, attributes: &[&str]) -> ScanResult<Vec<Info>> {
    let mut design = Map::new();
    for attribute in attributes {
        design.insert((*attribute).to_string(), view.value(attribute)?);
    }
    Ok(vec![Info::PartDesign(Value::Object(design))])
}

/// Restore attributes saved by [`save_attributes`]. Only `attributes` are accepted.
pub(crate) async fn load_attributes(
    ctx: &Context,
    view: &dyn BlockView,
    attributes: &[&str],
    design: Option<Value>,
) -> ScanResult<Vec<Info>> {
    let Some(design) = design else {
        return Ok(vec![]);
    };
    let Value::Object(values) = design else {
        return Err(ScanError::Configuration(format!(
            "design for {} is not an object",
            view.mri()
        )));
    };
    for (attribute, value) in values {
        if !attributes.contains(&attribute.as_str()) {
            return Err(ScanError::UnknownAttribute {
                mri: view.mri().to_string(),
                attribute,
            });
        }
        ctx.put(view, &attribute, value).await?;
    }
    Ok(vec![])
}
