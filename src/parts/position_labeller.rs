//! Position labeller part
//!
//! The labeller tags each frame with its position in the scan's dimensions so the
//! writer can place it. Positions are loaded as XML chunks of at most
//! [`POSITIONS_PER_XML`] entries and topped up during the run whenever the queue
//! falls below half a chunk. The labeller's `start` call runs for the whole
//! scan; if it fails, the run fails with its error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use serde_json::json;
use tracing::{debug, instrument};

use crate::block::{BlockView, BlockViewExt};
use crate::context::{BlockFuture, Context};
use crate::error::{ScanError, ScanResult};
use crate::generator::CompoundGenerator;
use crate::hooks::{ConfigureArgs, Hook};
use crate::info::Info;
use crate::part::{Part, PartRegistrar};

/// Largest number of positions sent in one XML chunk.
pub const POSITIONS_PER_XML: u64 = 1000;

/// Seconds added to the point duration when waiting for the queue to move.
pub const QUEUE_TIMEOUT_BASE_S: f64 = 30.0;

fn xml_err(e: impl std::fmt::Display) -> ScanError {
    ScanError::Serialization(format!("position xml: {e}"))
}

/// XML chunk labelling steps `[start, end)` of `generator`.
pub fn positions_xml(generator: &CompoundGenerator, start: u64, end: u64) -> ScanResult<String> {
    let dims = generator.dimensions();
    let mut w = Writer::new(Vec::new());
    w.write_event(Event::Decl(BytesDecl::new("1.0", None, None)))
        .map_err(xml_err)?;
    w.write_event(Event::Start(BytesStart::new("pos_layout"))).map_err(xml_err)?;
    w.write_event(Event::Start(BytesStart::new("dimensions"))).map_err(xml_err)?;
    for dim in &dims {
        let mut el = BytesStart::new("dimension");
        el.push_attribute(("name", dim.name.as_str()));
        w.write_event(Event::Empty(el)).map_err(xml_err)?;
    }
    w.write_event(Event::End(BytesEnd::new("dimensions"))).map_err(xml_err)?;
    w.write_event(Event::Start(BytesStart::new("positions"))).map_err(xml_err)?;
    for point in generator.points(start, end) {
        let point = point?;
        let mut el = BytesStart::new("position");
        for (dim, index) in dims.iter().zip(&point.indexes) {
            el.push_attribute((dim.name.as_str(), index.to_string().as_str()));
        }
        w.write_event(Event::Empty(el)).map_err(xml_err)?;
    }
    w.write_event(Event::End(BytesEnd::new("positions"))).map_err(xml_err)?;
    w.write_event(Event::End(BytesEnd::new("pos_layout"))).map_err(xml_err)?;
    String::from_utf8(w.into_inner()).map_err(xml_err)
}

#[derive(Debug, Default)]
struct Loading {
    generator: Option<CompoundGenerator>,
    id_start: u64,
    next: u64,
    end: u64,
    labelling: Option<BlockFuture>,
}

/// Resolve `wait`, unless `labelling` fails first.
async fn unless_labelling_fails<T>(
    ctx: &Context,
    labelling: Option<&BlockFuture>,
    wait: impl Future<Output = ScanResult<T>>,
) -> ScanResult<T> {
    let failed = async {
        if let Some(labelling) = labelling {
            ctx.wait(labelling).await?;
        }
        std::future::pending::<ScanResult<T>>().await
    };
    tokio::select! {
        biased;
        result = failed => result,
        result = wait => result,
    }
}

/// Feeds scan positions to a position labeller plugin.
#[derive(Debug)]
pub struct PositionLabellerPart {
    name: String,
    mri: String,
    chunk: u64,
    loading: Mutex<Loading>,
}

impl PositionLabellerPart {
    /// Part for the labeller block `mri`.
    pub fn new(name: impl Into<String>, mri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mri: mri.into(),
            chunk: POSITIONS_PER_XML,
            loading: Mutex::new(Loading::default()),
        }
    }

    /// Use chunks of `chunk` positions instead of [`POSITIONS_PER_XML`].
    pub fn with_chunk_size(mut self, chunk: u64) -> Self {
        self.chunk = chunk.clamp(1, POSITIONS_PER_XML);
        self
    }

    /// Send the next chunk. Returns false when every position has been sent.
    async fn load_next(&self, ctx: &Context, view: &dyn BlockView) -> ScanResult<bool> {
        let (xml, start, end) = {
            let mut loading = self.loading.lock();
            if loading.next >= loading.end {
                return Ok(false);
            }
            let Some(generator) = loading.generator.as_ref() else {
                return Ok(false);
            };
            let start = loading.next;
            let end = (start + self.chunk).min(loading.end);
            let xml = positions_xml(generator, start, end)?;
            loading.next = end;
            (xml, start, end)
        };
        ctx.put(view, "xml", json!(xml)).await?;
        debug!(part = %self.name, start, end, "Loaded positions");
        Ok(true)
    }

    #[instrument(skip_all, fields(part = %self.name, completed = args.completed_steps, steps = args.steps_to_do))]
    async fn configure(&self, ctx: &Context, args: &ConfigureArgs) -> ScanResult<Vec<Info>> {
        let view = ctx.block_view(&self.mri)?;
        ctx.post(view.as_ref(), "stop", json!({})).await?;
        ctx.post(view.as_ref(), "reset", json!({})).await?;
        *self.loading.lock() = Loading {
            generator: Some(args.params.generator.clone()),
            id_start: args.completed_steps + 1,
            next: args.completed_steps,
            end: args.completed_steps + args.steps_to_do,
            labelling: None,
        };
        ctx.put_many(
            view.as_ref(),
            vec![
                ("enableCallbacks", json!(true)),
                ("idStart", json!(args.completed_steps + 1)),
            ],
        )
        .await?;
        self.load_next(ctx, view.as_ref()).await?;
        // The labeller follows frames from here until stopped.
        let labelling = ctx.post_async(view.clone(), "start", json!({}));
        self.loading.lock().labelling = Some(labelling.clone());
        unless_labelling_fails(
            ctx,
            Some(&labelling),
            ctx.wait_equal(view.as_ref(), "running", json!(true), None),
        )
        .await?;
        Ok(vec![])
    }

    #[instrument(skip_all, fields(part = %self.name))]
    async fn run(&self, ctx: &Context) -> ScanResult<Vec<Info>> {
        let view = ctx.block_view(&self.mri)?;
        let (id_start, labelling, timeout) = {
            let loading = self.loading.lock();
            let duration = loading.generator.as_ref().map_or(0.0, |g| g.duration);
            (
                loading.id_start,
                loading.labelling.clone(),
                Duration::from_secs_f64(QUEUE_TIMEOUT_BASE_S + duration.max(0.0)),
            )
        };
        if let Some(sink) = ctx.progress_sink() {
            let part = ctx.part_name().to_string();
            let labeller = view.clone();
            ctx.subscribe_value(view.as_ref(), "qty", move |update| {
                let qty = update.value.as_u64().unwrap_or_default();
                let loaded: u64 = labeller.get("loaded").unwrap_or_default();
                sink(&part, id_start - 1 + loaded.saturating_sub(qty));
            })?;
        }

        let low_water = (self.chunk / 2).max(1);
        loop {
            let all_sent = {
                let loading = self.loading.lock();
                loading.next >= loading.end
            };
            if all_sent {
                let drained = ctx.wait_equal(view.as_ref(), "qty", json!(0), Some(timeout));
                unless_labelling_fails(ctx, labelling.as_ref(), drained).await?;
                break;
            }
            let low = ctx.wait_value(
                view.as_ref(),
                "qty",
                |v| v.as_u64().is_some_and(|qty| qty < low_water),
                Some(timeout),
            );
            unless_labelling_fails(ctx, labelling.as_ref(), low).await?;
            self.load_next(ctx, view.as_ref()).await?;
        }
        let end = self.loading.lock().end;
        ctx.update_completed_steps(end);
        Ok(vec![])
    }

    async fn stop(&self, ctx: &Context) -> ScanResult<Vec<Info>> {
        self.loading.lock().labelling = None;
        let view = ctx.block_view(&self.mri)?;
        ctx.post(view.as_ref(), "stop", json!({})).await?;
        Ok(vec![])
    }
}

impl Part for PositionLabellerPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn mri(&self) -> Option<&str> {
        Some(&self.mri)
    }

    fn setup(self: Arc<Self>, registrar: &mut PartRegistrar) {
        registrar.hooks(
            &[Hook::Configure, Hook::PostRunArmed, Hook::Seek],
            &self,
            |part, ctx, call| async move { part.configure(&ctx, call.configure()?).await },
        );
        registrar.hooks(&[Hook::Run, Hook::Resume], &self, |part, ctx, _call| async move {
            part.run(&ctx).await
        });
        registrar.hooks(
            &[Hook::Pause, Hook::Abort, Hook::PostRunReady],
            &self,
            |part, ctx, _call| async move { part.stop(&ctx).await },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockRegistry;
    use crate::generator::LineSpec;
    use crate::hooks::ConfigureParams;
    use crate::info::PartInfo;
    use crate::sim::{detector_block, position_labeller_block};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio_util::sync::CancellationToken;

    fn generator() -> CompoundGenerator {
        CompoundGenerator::new(
            vec![
                LineSpec::new("y", "mm", 0.0, 1.0, 2),
                LineSpec::new("x", "mm", 0.0, 1.0, 3),
            ],
            0.1,
            true,
        )
    }

    #[test]
    fn chunk_lists_dimension_indexes() {
        let xml = positions_xml(&generator(), 2, 4).unwrap();
        assert!(xml.contains("<dimension name=\"d0\"/>"));
        assert!(xml.contains("<dimension name=\"d1\"/>"));
        assert_eq!(xml.matches("<position ").count(), 2);
        assert!(xml.contains("<position d0=\"0\" d1=\"2\"/>"));
        // Snaked rows run backwards, so the second row starts at the last column.
        assert!(xml.contains("<position d0=\"1\" d1=\"2\"/>"));

        let tail = positions_xml(&generator(), 5, 6).unwrap();
        assert!(tail.contains("<position d0=\"1\" d1=\"0\"/>"));
    }

    #[tokio::test(start_paused = true)]
    async fn positions_are_refilled_during_the_run() {
        let registry = Arc::new(BlockRegistry::new());
        let detector = detector_block("DET", 0.0);
        registry.register(detector.clone()).unwrap();
        registry
            .register(position_labeller_block("POS", detector.clone()))
            .unwrap();
        let part = PositionLabellerPart::new("pos", "POS").with_chunk_size(2);
        let reported = Arc::new(AtomicU64::new(0));
        let sink_reported = reported.clone();
        let ctx = Context::new(registry.clone(), CancellationToken::new(), "pos")
            .with_progress(Arc::new(move |_part: &str, steps| {
                sink_reported.fetch_max(steps, Ordering::SeqCst);
            }));
        let args = ConfigureArgs {
            completed_steps: 0,
            steps_to_do: 6,
            part_info: PartInfo::new(),
            params: Arc::new(ConfigureParams::new(generator())),
        };
        part.configure(&ctx, &args).await.unwrap();
        let view = registry.get("POS").unwrap();
        assert_eq!(view.get::<u64>("qty").unwrap(), 2);
        assert_eq!(view.get::<u64>("idStart").unwrap(), 1);

        detector.put("numImages", json!(6)).await.unwrap();
        detector.put("acquirePeriod", json!(0.1)).await.unwrap();
        let frames = detector.clone();
        tokio::spawn(async move { frames.post("start", json!({})).await });

        part.run(&ctx).await.unwrap();
        assert_eq!(view.get::<u64>("loaded").unwrap(), 6);
        assert_eq!(reported.load(Ordering::SeqCst), 6);
    }

    fn rig() -> (Arc<BlockRegistry>, Arc<crate::block::Block>, PositionLabellerPart, Context) {
        let registry = Arc::new(BlockRegistry::new());
        let detector = detector_block("DET", 0.0);
        registry.register(detector.clone()).unwrap();
        registry
            .register(position_labeller_block("POS", detector.clone()))
            .unwrap();
        let part = PositionLabellerPart::new("pos", "POS").with_chunk_size(2);
        let ctx = Context::new(registry.clone(), CancellationToken::new(), "pos");
        (registry, detector, part, ctx)
    }

    fn six_steps() -> ConfigureArgs {
        ConfigureArgs {
            completed_steps: 0,
            steps_to_do: 6,
            part_info: PartInfo::new(),
            params: Arc::new(ConfigureParams::new(generator())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn labelling_failure_fails_the_run() {
        let (_registry, detector, part, ctx) = rig();
        part.configure(&ctx, &six_steps()).await.unwrap();

        // Frames outrun the first chunk before the run starts refilling it.
        detector.put("numImages", json!(6)).await.unwrap();
        detector.post("start", json!({})).await.unwrap();

        let err = part.run(&ctx).await.unwrap_err();
        let ScanError::Device { mri, message } = err else {
            panic!("expected a device error, got {err:?}");
        };
        assert_eq!(mri, "POS");
        assert!(message.contains("frame 3"), "{message}");
    }

    #[tokio::test(start_paused = true)]
    async fn run_times_out_when_no_frames_arrive() {
        let (_registry, _detector, part, ctx) = rig();
        part.configure(&ctx, &six_steps()).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = part.run(&ctx).await.unwrap_err();
        assert!(matches!(err, ScanError::FrameTimeout { .. }), "{err:?}");
        assert!(started.elapsed() >= Duration::from_secs_f64(QUEUE_TIMEOUT_BASE_S));
    }
}
