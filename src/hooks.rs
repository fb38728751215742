//! Lifecycle hooks and the payloads they carry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ScanError, ScanResult};
use crate::generator::CompoundGenerator;
use crate::info::{LayoutInfo, ParameterTweak, PartInfo};

/// Named lifecycle phase a part can take part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Hook {
    /// Report kinematics, datasets and other static information
    ReportStatus,
    /// Check parameters, optionally returning tweaks
    Validate,
    /// Program devices for the first run of a scan
    Configure,
    /// Observe every part's configure output
    PostConfigure,
    /// Execute the configured steps
    Run,
    /// A run finished with more steps to go; program the next batch
    PostRunArmed,
    /// The whole scan finished
    PostRunReady,
    /// Reposition after a pause
    Seek,
    /// Stop devices so the scan can be repositioned
    Pause,
    /// Continue running after a pause
    Resume,
    /// Stop everything
    Abort,
    /// Layout of children changed
    Layout,
    /// Report ports at reset
    ReportPorts,
    /// Report exportable fields
    ReportExportable,
    /// Restore settings from a design
    Load,
    /// Capture settings for a design
    Save,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn default_file_dir() -> String {
    "/tmp".to_string()
}

fn default_file_template() -> String {
    "%s.h5".to_string()
}

/// Parameters passed to validate and configure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureParams {
    /// Points to visit
    pub generator: CompoundGenerator,
    /// Axes moved within one run; `None` means every generator axis
    #[serde(default)]
    pub axes_to_move: Option<Vec<String>>,
    /// Directory files are written to
    #[serde(default = "default_file_dir")]
    pub file_dir: String,
    /// printf-style template applied to each file name
    #[serde(default = "default_file_template")]
    pub file_template: String,
    /// Detector exposure, derived from the point duration when absent
    #[serde(default)]
    pub exposure: Option<f64>,
}

impl ConfigureParams {
    /// Parameters scanning `generator` with defaults for everything else.
    pub fn new(generator: CompoundGenerator) -> Self {
        Self {
            generator,
            axes_to_move: None,
            file_dir: default_file_dir(),
            file_template: default_file_template(),
            exposure: None,
        }
    }

    /// Set the axes moved within one run.
    pub fn with_axes_to_move(mut self, axes: &[&str]) -> Self {
        self.axes_to_move = Some(axes.iter().map(|a| a.to_string()).collect());
        self
    }

    /// Set the output directory.
    pub fn with_file_dir(mut self, dir: impl Into<String>) -> Self {
        self.file_dir = dir.into();
        self
    }

    /// Axes moved within one run, defaulting to every generator axis.
    pub fn axes_to_move(&self) -> Vec<String> {
        self.axes_to_move
            .clone()
            .unwrap_or_else(|| self.generator.axes())
    }

    /// Apply a tweak addressed by camelCase name, with `.` separating nested fields.
    pub fn apply_tweak(&self, tweak: &ParameterTweak) -> ScanResult<Self> {
        let mut value = serde_json::to_value(self)?;
        let mut target = &mut value;
        for key in tweak.parameter.split('.') {
            target = target
                .as_object_mut()
                .and_then(|map| map.get_mut(key))
                .ok_or_else(|| {
                    ScanError::ParameterOutOfRange(format!(
                        "unknown parameter '{}'",
                        tweak.parameter
                    ))
                })?;
        }
        *target = tweak.value.clone();
        Ok(serde_json::from_value(value)?)
    }
}

/// Payload of Configure, PostRunArmed and Seek.
#[derive(Debug, Clone)]
pub struct ConfigureArgs {
    /// Steps already done
    pub completed_steps: u64,
    /// Steps the coming run will do
    pub steps_to_do: u64,
    /// Infos from the preceding ReportStatus
    pub part_info: PartInfo,
    /// Validated parameters
    pub params: Arc<ConfigureParams>,
}

/// Arguments delivered to a hook handler.
#[derive(Debug, Clone)]
pub enum HookArgs {
    /// Hooks without a payload
    None,
    /// Validate
    Validate {
        /// Infos from the preceding ReportStatus
        part_info: PartInfo,
        /// Parameters to check
        params: Arc<ConfigureParams>,
    },
    /// Configure, PostRunArmed and Seek
    Configure(ConfigureArgs),
    /// PostConfigure
    PostConfigure {
        /// Infos returned by Configure
        part_info: PartInfo,
        /// Validated parameters
        params: Arc<ConfigureParams>,
    },
    /// Layout
    Layout {
        /// Ports reported at reset
        ports: PartInfo,
        /// Requested layout rows
        layout: Vec<LayoutInfo>,
    },
    /// Load, keyed by part name
    Load(Arc<BTreeMap<String, Value>>),
}

impl HookArgs {
    fn wrong(hook: Hook, expected: &'static str) -> ScanError {
        ScanError::WrongHookArgs {
            hook: hook.to_string(),
            expected,
        }
    }

    /// Validate payload.
    pub fn validate(&self, hook: Hook) -> ScanResult<(&PartInfo, &Arc<ConfigureParams>)> {
        match self {
            HookArgs::Validate { part_info, params } => Ok((part_info, params)),
            _ => Err(Self::wrong(hook, "validate")),
        }
    }

    /// Configure, PostRunArmed or Seek payload.
    pub fn configure(&self, hook: Hook) -> ScanResult<&ConfigureArgs> {
        match self {
            HookArgs::Configure(args) => Ok(args),
            _ => Err(Self::wrong(hook, "configure")),
        }
    }

    /// PostConfigure payload.
    pub fn post_configure(&self, hook: Hook) -> ScanResult<(&PartInfo, &Arc<ConfigureParams>)> {
        match self {
            HookArgs::PostConfigure { part_info, params } => Ok((part_info, params)),
            _ => Err(Self::wrong(hook, "post-configure")),
        }
    }

    /// Layout payload.
    pub fn layout(&self, hook: Hook) -> ScanResult<(&PartInfo, &[LayoutInfo])> {
        match self {
            HookArgs::Layout { ports, layout } => Ok((ports, layout)),
            _ => Err(Self::wrong(hook, "layout")),
        }
    }

    /// Saved structure for `part`, if the design has one.
    pub fn load_for(&self, hook: Hook, part: &str) -> ScanResult<Option<Value>> {
        match self {
            HookArgs::Load(design) => Ok(design.get(part).cloned()),
            _ => Err(Self::wrong(hook, "load")),
        }
    }
}

/// A hook being delivered to one part.
#[derive(Debug, Clone)]
pub struct HookCall {
    /// Hook being dispatched
    pub hook: Hook,
    /// Its payload
    pub args: Arc<HookArgs>,
}

impl HookCall {
    /// Validate payload.
    pub fn validate(&self) -> ScanResult<(&PartInfo, &Arc<ConfigureParams>)> {
        self.args.validate(self.hook)
    }

    /// Configure, PostRunArmed or Seek payload.
    pub fn configure(&self) -> ScanResult<&ConfigureArgs> {
        self.args.configure(self.hook)
    }

    /// PostConfigure payload.
    pub fn post_configure(&self) -> ScanResult<(&PartInfo, &Arc<ConfigureParams>)> {
        self.args.post_configure(self.hook)
    }

    /// Layout payload.
    pub fn layout(&self) -> ScanResult<(&PartInfo, &[LayoutInfo])> {
        self.args.layout(self.hook)
    }

    /// Saved structure for `part`.
    pub fn load_for(&self, part: &str) -> ScanResult<Option<Value>> {
        self.args.load_for(self.hook, part)
    }
}
