//! Area detector driver part
//!
//! Frames are numbered by absolute scan step: Configure and Seek set the driver's
//! `arrayCounter` to the completed step count so the n-th frame of the scan carries
//! id `n`. Acquisition is internally timed, one frame per `acquirePeriod`, and
//! starts when the run starts.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::block::BlockViewExt;
use crate::config::DetectorConfig;
use crate::context::{BlockFuture, Context};
use crate::error::{ScanError, ScanResult};
use crate::hooks::{ConfigureArgs, ConfigureParams, Hook};
use crate::info::{AttributeDatasetType, Info};
use crate::part::{Part, PartRegistrar};

const DESIGN_ATTRIBUTES: &[&str] = &["imageMode"];

/// NDAttribute captured alongside the detector frames.
#[derive(Debug, Clone, PartialEq)]
struct AttributeDataset {
    name: String,
    dataset_type: AttributeDatasetType,
    attr: String,
}

#[derive(Debug, Default)]
struct Armed {
    end_step: u64,
    duration: f64,
    acquisition: Option<BlockFuture>,
}

/// Programs a detector driver and reports progress from its frame counter.
#[derive(Debug)]
pub struct DetectorDriverPart {
    name: String,
    mri: String,
    frame_timeout_base: f64,
    attributes: Vec<AttributeDataset>,
    armed: Mutex<Armed>,
}

impl DetectorDriverPart {
    /// Part for the detector driver block `mri`. `name` prefixes its datasets.
    pub fn new(name: impl Into<String>, mri: impl Into<String>, config: &DetectorConfig) -> Self {
        Self {
            name: name.into(),
            mri: mri.into(),
            frame_timeout_base: config.frame_timeout_base_s,
            attributes: Vec::new(),
            armed: Mutex::new(Armed::default()),
        }
    }

    /// Also capture NDAttribute `attr` into a dataset called `name`.
    pub fn with_attribute_dataset(
        mut self,
        name: impl Into<String>,
        dataset_type: AttributeDatasetType,
        attr: impl Into<String>,
    ) -> Self {
        self.attributes.push(AttributeDataset {
            name: name.into(),
            dataset_type,
            attr: attr.into(),
        });
        self
    }

    fn report_status(&self) -> Vec<Info> {
        let mut infos = vec![Info::NdArrayDataset { rank: 2 }];
        infos.extend(self.attributes.iter().map(|a| Info::NdAttributeDataset {
            name: a.name.clone(),
            dataset_type: a.dataset_type,
            attr: a.attr.clone(),
            rank: 0,
        }));
        infos
    }

    fn exposure_for(&self, ctx: &Context, params: &ConfigureParams) -> ScanResult<(f64, f64)> {
        let view = ctx.block_view(&self.mri)?;
        let readout: f64 = view.get("readoutTime")?;
        let duration = params.generator.duration;
        if duration <= readout {
            return Err(ScanError::ParameterOutOfRange(format!(
                "duration {duration}s must be longer than the {readout}s readout time of {}",
                self.mri
            )));
        }
        Ok((duration - readout, readout))
    }

    fn validate(&self, ctx: &Context, params: &ConfigureParams) -> ScanResult<Vec<Info>> {
        let (max_exposure, _) = self.exposure_for(ctx, params)?;
        match params.exposure {
            Some(exposure) if exposure <= 0.0 => Err(ScanError::ParameterOutOfRange(format!(
                "exposure must be positive, got {exposure}"
            ))),
            Some(exposure) if exposure <= max_exposure => Ok(vec![]),
            _ => {
                debug!(part = %self.name, exposure = max_exposure, "Deriving exposure from duration");
                Ok(vec![Info::ParameterTweak {
                    parameter: "exposure".into(),
                    value: json!(max_exposure),
                }])
            }
        }
    }

    #[instrument(skip_all, fields(part = %self.name, completed = args.completed_steps, steps = args.steps_to_do))]
    async fn configure(&self, ctx: &Context, args: &ConfigureArgs) -> ScanResult<Vec<Info>> {
        self.stop_acquisition();
        let (max_exposure, _) = self.exposure_for(ctx, &args.params)?;
        let exposure = args.params.exposure.unwrap_or(max_exposure).min(max_exposure);
        let duration = args.params.generator.duration;
        let view = ctx.block_view(&self.mri)?;
        ctx.put_many(
            view.as_ref(),
            vec![
                ("arrayCallbacks", json!(true)),
                ("imageMode", json!("Multiple")),
                ("numImages", json!(args.steps_to_do)),
                ("exposure", json!(exposure)),
                ("acquirePeriod", json!(duration)),
                ("arrayCounter", json!(args.completed_steps)),
            ],
        )
        .await?;
        *self.armed.lock() = Armed {
            end_step: args.completed_steps + args.steps_to_do,
            duration,
            acquisition: None,
        };
        info!(part = %self.name, exposure, period = duration, "Detector armed");
        Ok(vec![])
    }

    #[instrument(skip_all, fields(part = %self.name))]
    async fn run(&self, ctx: &Context) -> ScanResult<Vec<Info>> {
        let view = ctx.block_view(&self.mri)?;
        let (end_step, duration) = {
            let armed = self.armed.lock();
            (armed.end_step, armed.duration)
        };
        let acquisition = ctx.post_async(view.clone(), "start", json!({}));
        self.armed.lock().acquisition = Some(acquisition.clone());

        if let Some(sink) = ctx.progress_sink() {
            let part = ctx.part_name().to_string();
            ctx.subscribe_value(view.as_ref(), "arrayCounterReadback", move |update| {
                if let Some(frames) = update.value.as_u64() {
                    sink(&part, frames.min(end_step));
                }
            })?;
        }

        let timeout = Duration::from_secs_f64(self.frame_timeout_base + duration);
        ctx.wait_value(
            view.as_ref(),
            "arrayCounterReadback",
            |v| v.as_u64().is_some_and(|n| n >= end_step),
            Some(timeout),
        )
        .await?;
        let result = ctx.wait(&acquisition).await?;
        debug!(part = %self.name, ?result, "Acquisition complete");
        ctx.update_completed_steps(end_step);
        Ok(vec![])
    }

    fn stop_acquisition(&self) {
        if let Some(acquisition) = self.armed.lock().acquisition.take() {
            acquisition.abort();
        }
    }

    async fn stop(&self, ctx: &Context) -> ScanResult<Vec<Info>> {
        self.stop_acquisition();
        let view = ctx.block_view(&self.mri)?;
        ctx.post(view.as_ref(), "stop", json!({})).await?;
        Ok(vec![])
    }

    async fn load(&self, ctx: &Context, design: Option<Value>) -> ScanResult<Vec<Info>> {
        let view = ctx.block_view(&self.mri)?;
        super::load_attributes(ctx, view.as_ref(), DESIGN_ATTRIBUTES, design).await
    }
}

impl Part for DetectorDriverPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn mri(&self) -> Option<&str> {
        Some(&self.mri)
    }

    fn setup(self: Arc<Self>, registrar: &mut PartRegistrar) {
        registrar.hook(Hook::ReportStatus, &self, |part, _ctx, _call| async move {
            Ok(part.report_status())
        });
        registrar.hook(Hook::Validate, &self, |part, ctx, call| async move {
            let (_, params) = call.validate()?;
            part.validate(&ctx, params)
        });
        registrar.hooks(
            &[Hook::Configure, Hook::PostRunArmed, Hook::Seek],
            &self,
            |part, ctx, call| async move { part.configure(&ctx, call.configure()?).await },
        );
        registrar.hooks(&[Hook::Run, Hook::Resume], &self, |part, ctx, _call| async move {
            part.run(&ctx).await
        });
        registrar.hooks(&[Hook::Pause, Hook::Abort], &self, |part, ctx, _call| async move {
            part.stop(&ctx).await
        });
        registrar.hook(Hook::Save, &self, |part, ctx, _call| async move {
            let view = ctx.block_view(&part.mri)?;
            super::save_attributes(view.as_ref(), DESIGN_ATTRIBUTES)
        });
        registrar.hook(Hook::Load, &self, |part, ctx, call| async move {
            let design = call.load_for(&part.name)?;
            part.load(&ctx, design).await
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockRegistry;
    use crate::generator::{CompoundGenerator, LineSpec};
    use crate::info::PartInfo;
    use crate::sim::detector_block;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio_util::sync::CancellationToken;

    fn params(duration: f64) -> ConfigureParams {
        ConfigureParams::new(CompoundGenerator::new(
            vec![LineSpec::new("x", "mm", 0.0, 1.0, 5)],
            duration,
            false,
        ))
    }

    fn setup() -> (Arc<BlockRegistry>, DetectorDriverPart) {
        let registry = Arc::new(BlockRegistry::new());
        registry.register(detector_block("DET", 0.01)).unwrap();
        (registry, DetectorDriverPart::new("det", "DET", &DetectorConfig::default()))
    }

    #[test]
    fn exposure_is_derived_from_duration() {
        let (registry, part) = setup();
        let ctx = Context::new(registry, CancellationToken::new(), "det");
        let infos = part.validate(&ctx, &params(0.1)).unwrap();
        let [Info::ParameterTweak { parameter, value }] = infos.as_slice() else {
            panic!("expected an exposure tweak, got {infos:?}");
        };
        assert_eq!(parameter, "exposure");
        assert!((value.as_f64().unwrap() - 0.09).abs() < 1e-12);

        let mut short = params(0.1);
        short.exposure = Some(0.05);
        assert!(part.validate(&ctx, &short).unwrap().is_empty());
    }

    #[test]
    fn duration_within_readout_is_rejected() {
        let (registry, part) = setup();
        let ctx = Context::new(registry, CancellationToken::new(), "det");
        let err = part.validate(&ctx, &params(0.01)).unwrap_err();
        assert!(matches!(err, ScanError::ParameterOutOfRange(_)));
    }

    #[test]
    fn status_declares_frames_and_attributes() {
        let part = DetectorDriverPart::new("det", "DET", &DetectorConfig::default()).with_attribute_dataset(
            "I0",
            AttributeDatasetType::Monitor,
            "I0.value",
        );
        let infos = part.report_status();
        assert_eq!(infos.len(), 2);
        assert!(matches!(infos[0], Info::NdArrayDataset { rank: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_frames_from_the_configured_offset() {
        let (registry, part) = setup();
        let reported = Arc::new(AtomicU64::new(0));
        let sink_reported = reported.clone();
        let ctx = Context::new(registry.clone(), CancellationToken::new(), "det")
            .with_progress(Arc::new(move |_part: &str, steps| {
                sink_reported.fetch_max(steps, Ordering::SeqCst);
            }));
        let args = ConfigureArgs {
            completed_steps: 2,
            steps_to_do: 3,
            part_info: PartInfo::new(),
            params: Arc::new(params(0.1)),
        };
        part.configure(&ctx, &args).await.unwrap();
        let view = registry.get("DET").unwrap();
        assert_eq!(view.get::<u64>("numImages").unwrap(), 3);
        assert_eq!(view.get::<u64>("arrayCounterReadback").unwrap(), 2);

        part.run(&ctx).await.unwrap();
        assert_eq!(reported.load(Ordering::SeqCst), 5);
        assert_eq!(view.get::<u64>("uniqueId").unwrap(), 5);
    }
}
