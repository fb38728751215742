//! HDF5 file writer part
//!
//! Configure collects the dataset declarations from ReportStatus, writes the
//! layout document next to the data, programs the writer and starts capture.
//! Run waits for the first frame to reach the writer, then follows its `uniqueId`
//! until the frame that completes the run has been written, asking for a flush
//! whenever frames stop arriving and failing with [`ScanError::WriterStalled`] once
//! nothing has been written for the frame timeout.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::block::{BlockView, BlockViewExt};
use crate::config::WriterConfig;
use crate::context::{BlockFuture, Context};
use crate::error::{ScanError, ScanResult};
use crate::hooks::{ConfigureArgs, Hook};
use crate::info::{unique_value, Info, PathTranslation};
use crate::part::{Part, PartRegistrar};
use crate::writer::{
    dataset_producers, dimension_attributes, layout_xml, translate, DatasetSources, LayoutSpec, UniqueIdTracker,
};

/// Settings saved with a design.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterSettings {
    /// File name without template, also the prefix of the primary dataset
    pub file_name: String,
    /// Capture every NDAttribute rather than only declared ones
    #[serde(default)]
    pub capture_all_attributes: bool,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            file_name: "det".to_string(),
            capture_all_attributes: false,
        }
    }
}

#[derive(Debug, Default)]
struct Capture {
    tracker: UniqueIdTracker,
    /// `arrayCounterReadback` when last armed; ids seen before it moves are stale.
    counter_at_arm: i64,
    frame_timeout: Duration,
    start: Option<BlockFuture>,
    /// Resolves once a frame arrives after arming.
    first_frame: Option<BlockFuture>,
}

/// Drives an HDF5 file writer block.
#[derive(Debug)]
pub struct HdfWriterPart {
    name: String,
    mri: String,
    config: WriterConfig,
    settings: Mutex<WriterSettings>,
    capture: Mutex<Capture>,
}

impl HdfWriterPart {
    /// Part for the writer block `mri`.
    pub fn new(name: impl Into<String>, mri: impl Into<String>, config: &WriterConfig) -> Self {
        Self {
            name: name.into(),
            mri: mri.into(),
            config: config.clone(),
            settings: Mutex::new(WriterSettings::default()),
            capture: Mutex::new(Capture::default()),
        }
    }

    /// Write files called `file_name`.
    pub fn with_file_name(self, file_name: impl Into<String>) -> Self {
        self.settings.lock().file_name = file_name.into();
        self
    }

    /// Current design settings
    pub fn settings(&self) -> WriterSettings {
        self.settings.lock().clone()
    }

    // =========================================================================
    // Configure
    // =========================================================================

    #[instrument(skip_all, fields(part = %self.name, completed = args.completed_steps, steps = args.steps_to_do))]
    async fn configure(&self, ctx: &Context, args: &ConfigureArgs) -> ScanResult<Vec<Info>> {
        let params = &args.params;
        let generator = &params.generator;
        let settings = self.settings();
        let sources = DatasetSources::collect(&args.part_info)?;
        let translation: Option<PathTranslation> = unique_value(&args.part_info, "FilePathTranslator")?;

        let file_dir = params.file_dir.trim_end_matches('/');
        let file_name = params.file_template.replacen("%s", &settings.file_name, 1);
        let layout = layout_xml(&LayoutSpec {
            generator,
            sources: &sources,
            capture_all_attributes: settings.capture_all_attributes,
        })?;
        let layout_path = Path::new(file_dir).join(format!("{}-layout.xml", self.mri));
        tokio::fs::create_dir_all(file_dir).await?;
        tokio::fs::write(&layout_path, layout).await?;
        debug!(part = %self.name, path = %layout_path.display(), "Wrote layout");

        let layout_path = layout_path.to_string_lossy();
        let xml_layout = translate(&layout_path, translation.as_ref())?;
        let mut file_path = translate(file_dir, translation.as_ref())?;
        file_path.push(if translation.is_some() { '\\' } else { '/' });

        let view = ctx.block_view(&self.mri)?;
        if view.get::<bool>("running")? {
            ctx.post(view.as_ref(), "stop", json!({})).await?;
        }
        let flush = self.config.flush_per_n_frames;
        let mut values: Vec<(String, Value)> = vec![
            ("enableCallbacks".into(), json!(true)),
            ("fileWriteMode".into(), json!("Stream")),
            ("swmrMode".into(), json!(true)),
            ("storeAttr".into(), json!(true)),
            ("dimAttDatasets".into(), json!(true)),
            ("lazyOpen".into(), json!(true)),
            ("positionMode".into(), json!(true)),
            ("arrayCounter".into(), json!(0)),
            ("filePath".into(), json!(file_path)),
            ("fileName".into(), json!(settings.file_name)),
            ("fileTemplate".into(), json!(format!("%s{}", params.file_template))),
            ("numCapture".into(), json!(generator.size())),
            ("flushDataPerNFrames".into(), json!(flush)),
            ("flushAttrPerNFrames".into(), json!(flush)),
            ("xmlLayout".into(), json!(xml_layout)),
        ];
        values.extend(dimension_attributes(generator)?);
        for (attribute, value) in values {
            ctx.put(view.as_ref(), &attribute, value).await?;
        }

        let counter_at_arm: i64 = view.get("arrayCounterReadback")?;
        let first_frame = ctx.when_value(view.as_ref(), "arrayCounterReadback", move |v| {
            v.as_i64().is_some_and(|counter| counter > counter_at_arm)
        })?;
        let start = ctx.post_async(view.clone(), "start", json!({}));
        ctx.wait_equal(view.as_ref(), "running", json!(true), Some(self.config.frame_timeout(0.0)))
            .await?;
        *self.capture.lock() = Capture {
            tracker: UniqueIdTracker::arm(args.completed_steps, args.steps_to_do, args.completed_steps as i64),
            counter_at_arm,
            frame_timeout: self.config.frame_timeout(generator.duration),
            start: Some(start),
            first_frame: Some(first_frame),
        };
        info!(part = %self.name, file = %file_name, frames = generator.size(), "Writer started");

        Ok(dataset_producers(&settings.file_name, &file_name, &sources, generator)
            .into_iter()
            .map(Info::DatasetProducer)
            .collect())
    }

    /// Another run of the same file follows.
    fn post_run_armed(&self, args: &ConfigureArgs) -> Vec<Info> {
        self.capture.lock().tracker.extend(args.steps_to_do);
        vec![]
    }

    /// Re-arm after a pause. Frames before the seek point are written again, so
    /// the capture limit grows by what the writer has already received.
    async fn seek(&self, ctx: &Context, args: &ConfigureArgs) -> ScanResult<Vec<Info>> {
        let view = ctx.block_view(&self.mri)?;
        let counter: i64 = view.get("arrayCounterReadback")?;
        let remaining = args.params.generator.size().saturating_sub(args.completed_steps);
        let received = u64::try_from(counter).unwrap_or(0);
        ctx.put(view.as_ref(), "numCapture", json!(received + remaining)).await?;
        let first_frame = ctx.when_value(view.as_ref(), "arrayCounterReadback", move |v| {
            v.as_i64().is_some_and(|c| c > counter)
        })?;
        {
            let mut capture = self.capture.lock();
            capture
                .tracker
                .seek(args.completed_steps, args.steps_to_do, args.completed_steps as i64);
            capture.counter_at_arm = counter;
            if let Some(previous) = capture.first_frame.replace(first_frame) {
                previous.abort();
            }
        }
        debug!(part = %self.name, completed = args.completed_steps, counter, "Writer re-armed after seek");
        Ok(vec![])
    }

    // =========================================================================
    // Run / Resume
    // =========================================================================

    #[instrument(skip_all, fields(part = %self.name))]
    async fn run(&self, ctx: &Context) -> ScanResult<Vec<Info>> {
        let view = ctx.block_view(&self.mri)?;
        let (tracker, frame_timeout, start, first_frame, counter_at_arm) = {
            let capture = self.capture.lock();
            (
                capture.tracker,
                capture.frame_timeout,
                capture.start.clone(),
                capture.first_frame.clone(),
                capture.counter_at_arm,
            )
        };
        if let Some(first_frame) = &first_frame {
            self.wait_first_frame(ctx, view.as_ref(), first_frame, start.as_ref(), frame_timeout)
                .await?;
        }
        // Ids count only once a frame has arrived since arming.
        let fresh = {
            let view = view.clone();
            move || {
                view.get::<i64>("arrayCounterReadback")
                    .is_ok_and(|counter| counter > counter_at_arm)
            }
        };
        let last_update = Arc::new(Mutex::new(Instant::now()));
        {
            let last_update = last_update.clone();
            let fresh = fresh.clone();
            let sink = ctx.progress_sink();
            let part = ctx.part_name().to_string();
            ctx.subscribe_value(view.as_ref(), "uniqueId", move |update| {
                let Some(id) = update.value.as_i64() else { return };
                if !fresh() {
                    return;
                }
                *last_update.lock() = Instant::now();
                if let Some(sink) = &sink {
                    sink(&part, tracker.steps_for(id));
                }
            })?;
        }

        let poll = self.config.poll_interval();
        loop {
            let waited = ctx
                .wait_value(
                    view.as_ref(),
                    "uniqueId",
                    |v| v.as_i64().is_some_and(|id| tracker.is_done(id)) && fresh(),
                    Some(poll),
                )
                .await;
            match waited {
                Ok(_) => break,
                Err(ScanError::FrameTimeout { .. }) => {
                    if let Some(Err(e)) = start.as_ref().and_then(BlockFuture::peek) {
                        return Err(e);
                    }
                    ctx.post(view.as_ref(), "flushNow", json!({})).await?;
                    let idle = last_update.lock().elapsed();
                    if idle > frame_timeout {
                        let unique_id: i64 = view.get("uniqueId")?;
                        warn!(part = %self.name, unique_id, idle_s = idle.as_secs_f64(), "Writer stalled");
                        return Err(ScanError::WriterStalled {
                            seconds: idle.as_secs_f64(),
                            unique_id,
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        }
        ctx.update_completed_steps(tracker.steps_for(tracker.done_when_reaches()));
        Ok(vec![])
    }

    /// Wait for the writer to receive a frame, failing early if capture dies.
    async fn wait_first_frame(
        &self,
        ctx: &Context,
        view: &dyn BlockView,
        first_frame: &BlockFuture,
        start: Option<&BlockFuture>,
        timeout: Duration,
    ) -> ScanResult<()> {
        let capture_failed = async {
            if let Some(start) = start {
                ctx.wait(start).await?;
            }
            std::future::pending::<ScanResult<()>>().await
        };
        let arrived = async {
            tokio::select! {
                result = ctx.wait(first_frame) => result.map(drop),
                result = capture_failed => result,
            }
        };
        match tokio::time::timeout(timeout, arrived).await {
            Ok(result) => result,
            Err(_) => {
                let unique_id: i64 = view.get("uniqueId")?;
                warn!(part = %self.name, unique_id, "No frame reached the writer");
                Err(ScanError::WriterStalled {
                    seconds: timeout.as_secs_f64(),
                    unique_id,
                })
            }
        }
    }

    // =========================================================================
    // Finish / Abort
    // =========================================================================

    async fn stop(&self, ctx: &Context) -> ScanResult<Vec<Info>> {
        {
            let mut capture = self.capture.lock();
            capture.start = None;
            if let Some(first_frame) = capture.first_frame.take() {
                first_frame.abort();
            }
        }
        let view = ctx.block_view(&self.mri)?;
        ctx.post(view.as_ref(), "stop", json!({})).await?;
        Ok(vec![])
    }

    fn save(&self) -> ScanResult<Vec<Info>> {
        Ok(vec![Info::PartDesign(serde_json::to_value(self.settings())?)])
    }

    fn load(&self, design: Option<Value>) -> ScanResult<Vec<Info>> {
        if let Some(design) = design {
            *self.settings.lock() = serde_json::from_value(design)?;
        }
        Ok(vec![])
    }
}

impl Part for HdfWriterPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn mri(&self) -> Option<&str> {
        Some(&self.mri)
    }

    fn setup(self: Arc<Self>, registrar: &mut PartRegistrar) {
        registrar.hook(Hook::Configure, &self, |part, ctx, call| async move {
            part.configure(&ctx, call.configure()?).await
        });
        registrar.hook(Hook::PostRunArmed, &self, |part, _ctx, call| async move {
            Ok(part.post_run_armed(call.configure()?))
        });
        registrar.hook(Hook::Seek, &self, |part, ctx, call| async move {
            part.seek(&ctx, call.configure()?).await
        });
        registrar.hooks(&[Hook::Run, Hook::Resume], &self, |part, ctx, _call| async move {
            part.run(&ctx).await
        });
        registrar.hooks(&[Hook::PostRunReady, Hook::Abort], &self, |part, ctx, _call| async move {
            part.stop(&ctx).await
        });
        registrar.hook(Hook::Save, &self, |part, _ctx, _call| async move { part.save() });
        registrar.hook(Hook::Load, &self, |part, _ctx, call| async move {
            let design = call.load_for(&part.name)?;
            part.load(design)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockRegistry;
    use crate::generator::{CompoundGenerator, LineSpec};
    use crate::hooks::ConfigureParams;
    use crate::info::{DatasetProducer, DatasetType, PartInfo};
    use crate::sim::{detector_block, hdf_writer_block};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio_util::sync::CancellationToken;

    struct Rig {
        registry: Arc<BlockRegistry>,
        detector: Arc<crate::block::Block>,
        dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let registry = Arc::new(BlockRegistry::new());
        let detector = detector_block("DET", 0.0);
        registry.register(detector.clone()).unwrap();
        registry.register(hdf_writer_block("HDF", detector.clone())).unwrap();
        Rig {
            registry,
            detector,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn args(rig: &Rig, duration: f64) -> ConfigureArgs {
        let generator = CompoundGenerator::new(
            vec![
                LineSpec::new("y", "mm", 0.0, 1.0, 2),
                LineSpec::new("x", "mm", 0.0, 1.0, 3),
            ],
            duration,
            true,
        );
        let params = ConfigureParams::new(generator).with_file_dir(rig.dir.path().to_string_lossy());
        ConfigureArgs {
            completed_steps: 0,
            steps_to_do: 6,
            part_info: PartInfo::from([("det".to_string(), vec![Info::NdArrayDataset { rank: 2 }])]),
            params: Arc::new(params),
        }
    }

    async fn acquire(detector: &Arc<crate::block::Block>, frames: u64, period: f64) {
        detector.put("numImages", json!(frames)).await.unwrap();
        detector.put("acquirePeriod", json!(period)).await.unwrap();
        let d = detector.clone();
        tokio::spawn(async move { d.post("start", json!({})).await });
    }

    #[tokio::test(start_paused = true)]
    async fn configure_programs_writer_and_returns_producers() {
        let rig = rig();
        let part = HdfWriterPart::new("hdf", "HDF", &WriterConfig::default());
        let ctx = Context::new(rig.registry.clone(), CancellationToken::new(), "hdf");
        let infos = part.configure(&ctx, &args(&rig, 0.1)).await.unwrap();

        let producers: Vec<DatasetProducer> = infos
            .into_iter()
            .filter_map(|i| match i {
                Info::DatasetProducer(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(producers[0].name, "det.data");
        assert_eq!(producers[0].filename, "det.h5");
        assert_eq!(producers[0].rank, 4);
        assert!(producers
            .iter()
            .any(|p| p.name == "x.value_set" && p.dataset_type == DatasetType::PositionSet));

        let view = rig.registry.get("HDF").unwrap();
        assert!(view.get::<bool>("running").unwrap());
        assert!(view.get::<bool>("positionMode").unwrap());
        assert_eq!(view.get::<u64>("numCapture").unwrap(), 6);
        assert_eq!(view.get::<String>("posNameDimN").unwrap(), "d1");
        assert_eq!(view.get::<String>("fileTemplate").unwrap(), "%s%s.h5");
        let layout: String = view.get("xmlLayout").unwrap();
        assert!(std::fs::read_to_string(layout).unwrap().contains("NXentry"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_completes_when_last_frame_is_written() {
        let rig = rig();
        let part = HdfWriterPart::new("hdf", "HDF", &WriterConfig::default());
        let reported = Arc::new(AtomicU64::new(0));
        let sink_reported = reported.clone();
        let ctx = Context::new(rig.registry.clone(), CancellationToken::new(), "hdf")
            .with_progress(Arc::new(move |_part: &str, steps| {
                sink_reported.fetch_max(steps, Ordering::SeqCst);
            }));
        part.configure(&ctx, &args(&rig, 0.1)).await.unwrap();
        acquire(&rig.detector, 6, 0.1).await;
        part.run(&ctx).await.unwrap();

        assert_eq!(reported.load(Ordering::SeqCst), 6);
        let view = rig.registry.get("HDF").unwrap();
        assert_eq!(view.get::<String>("fullFileName").unwrap(), format!("{}/det.h5", rig.dir.path().display()));
    }

    #[tokio::test(start_paused = true)]
    async fn writer_without_frames_fails_after_frame_timeout() {
        let rig = rig();
        let part = HdfWriterPart::new("hdf", "HDF", &WriterConfig::default());
        let ctx = Context::new(rig.registry.clone(), CancellationToken::new(), "hdf");
        part.configure(&ctx, &args(&rig, 0.1)).await.unwrap();
        let view = rig.registry.get("HDF").unwrap();
        view.put("stalled", json!(true)).await.unwrap();
        acquire(&rig.detector, 6, 0.1).await;

        let started = Instant::now();
        let err = part.run(&ctx).await.unwrap_err();
        assert!(matches!(err, ScanError::WriterStalled { unique_id: 0, .. }), "{err:?}");
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(view.get::<i64>("arrayCounterReadback").unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn writer_stalling_mid_run_is_flushed_then_fails() {
        let rig = rig();
        let part = HdfWriterPart::new("hdf", "HDF", &WriterConfig::default());
        let ctx = Context::new(rig.registry.clone(), CancellationToken::new(), "hdf");
        part.configure(&ctx, &args(&rig, 0.1)).await.unwrap();
        let view = rig.registry.get("HDF").unwrap();
        acquire(&rig.detector, 6, 0.1).await;
        ctx.wait_value(view.as_ref(), "uniqueId", |v| v.as_i64() >= Some(2), None)
            .await
            .unwrap();
        view.put("stalled", json!(true)).await.unwrap();

        let started = Instant::now();
        let err = part.run(&ctx).await.unwrap_err();
        assert!(matches!(err, ScanError::WriterStalled { unique_id: 2, .. }), "{err:?}");
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(view.get::<u64>("flushCount").unwrap() >= 60);
    }

    #[tokio::test(start_paused = true)]
    async fn run_waits_for_the_first_frame() {
        let rig = rig();
        let part = Arc::new(HdfWriterPart::new("hdf", "HDF", &WriterConfig::default()));
        let ctx = Arc::new(Context::new(rig.registry.clone(), CancellationToken::new(), "hdf"));
        part.configure(&ctx, &args(&rig, 0.1)).await.unwrap();

        let (run_part, run_ctx) = (part.clone(), ctx.clone());
        let running = tokio::spawn(async move { run_part.run(&run_ctx).await });
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!running.is_finished());

        acquire(&rig.detector, 6, 0.1).await;
        running.await.unwrap().unwrap();
        let view = rig.registry.get("HDF").unwrap();
        assert_eq!(view.get::<i64>("uniqueId").unwrap(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_failure_is_reported_by_run() {
        let rig = rig();
        let part = HdfWriterPart::new("hdf", "HDF", &WriterConfig::default());
        let ctx = Context::new(rig.registry.clone(), CancellationToken::new(), "hdf");
        part.configure(&ctx, &args(&rig, 0.1)).await.unwrap();
        let view = rig.registry.get("HDF").unwrap();
        acquire(&rig.detector, 6, 0.1).await;
        ctx.wait_value(view.as_ref(), "uniqueId", |v| v.as_i64() >= Some(2), None)
            .await
            .unwrap();
        view.put("diskFull", json!(true)).await.unwrap();

        let started = Instant::now();
        let err = part.run(&ctx).await.unwrap_err();
        let ScanError::Device { mri, message } = err else {
            panic!("expected a device error, got {err:?}");
        };
        assert_eq!(mri, "HDF");
        assert!(message.contains("disk full"), "{message}");
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
