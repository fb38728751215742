//! Motor axis part: reports where a scannable sits in a coordinate system.

use std::sync::Arc;

use tracing::debug;

use crate::block::{BlockView, BlockViewExt};
use crate::context::Context;
use crate::error::{ScanError, ScanResult};
use crate::hooks::Hook;
use crate::info::{Info, MotorInfo, PortDirection, PortInfo, PortType};
use crate::part::{Part, PartRegistrar};

/// Exposes one motor record to the trajectory part as a [`MotorInfo`].
#[derive(Debug)]
pub struct MotorAxisPart {
    name: String,
    mri: String,
}

impl MotorAxisPart {
    /// Part `name` (the scannable name) for the motor block `mri`.
    pub fn new(name: impl Into<String>, mri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mri: mri.into(),
        }
    }

    fn cs(view: &dyn BlockView) -> ScanResult<Option<(String, String)>> {
        let cs: String = view.get("cs")?;
        if cs.is_empty() {
            return Ok(None);
        }
        match cs.split_once(',') {
            Some((port, axis)) if !port.is_empty() && !axis.is_empty() => {
                Ok(Some((port.trim().to_string(), axis.trim().to_string())))
            }
            _ => Err(ScanError::InconsistentCoordinateSystem(format!(
                "{}: cs '{cs}' is not '<port>,<axis>'",
                view.mri()
            ))),
        }
    }

    async fn report_status(&self, ctx: &Context) -> ScanResult<Vec<Info>> {
        let view = ctx.block_view(&self.mri)?;
        let Some((cs_port, cs_axis)) = Self::cs(view.as_ref())? else {
            debug!(part = %self.name, "Motor is not in a coordinate system");
            return Ok(vec![]);
        };
        Ok(vec![Info::Motor(MotorInfo {
            cs_axis,
            cs_port,
            acceleration: view.get("acceleration")?,
            resolution: view.get("resolution")?,
            offset: view.get("offset")?,
            max_velocity: view.get("maxVelocity")?,
            current_position: view.get("readback")?,
            scannable: self.name.clone(),
            velocity_settle: view.get("velocitySettle")?,
            units: view.get("units")?,
        })])
    }

    fn report_ports(&self, ctx: &Context) -> ScanResult<Vec<Info>> {
        let view = ctx.block_view(&self.mri)?;
        let cs: String = view.get("cs")?;
        Ok(vec![Info::Port(PortInfo {
            name: "cs".into(),
            direction: PortDirection::In,
            port_type: PortType::Cs,
            value: cs,
            extra: String::new(),
        })])
    }
}

impl Part for MotorAxisPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn mri(&self) -> Option<&str> {
        Some(&self.mri)
    }

    fn setup(self: Arc<Self>, registrar: &mut PartRegistrar) {
        registrar.hook(Hook::ReportStatus, &self, |part, ctx, _call| async move {
            part.report_status(&ctx).await
        });
        registrar.hook(Hook::ReportPorts, &self, |part, ctx, _call| async move {
            part.report_ports(&ctx)
        });
    }
}
