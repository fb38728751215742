//! Trajectory part: streams profile batches to a motion controller
//!
//! Configure, PostRunArmed and Seek resolve the coordinate system, move the axes
//! to the run-up start and build the first batch. Run and Resume execute the
//! profile, follow `pointsScanned` to report completed steps and append further
//! batches once fewer than half a batch of rows is left queued.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::block::{BlockView, BlockViewExt};
use crate::config::TrajectoryConfig;
use crate::context::Context;
use crate::error::{ScanError, ScanResult};
use crate::hooks::{ConfigureArgs, Hook};
use crate::info::{filter_values, Info, MotorInfo, CS_AXIS_NAMES};
use crate::part::{Part, PartRegistrar};
use crate::trajectory::{
    minimum_duration, resolve_cs, CsMapping, PositionKind, ProfileBatch, ProfilePlanner, ScalingCache, TICK_S,
};

/// Settings saved with a design.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrajectorySettings {
    /// Target rows per build/append
    pub points_per_build: usize,
}

/// A profile programmed for one run.
#[derive(Debug)]
struct ProfileRun {
    planner: ProfilePlanner,
    lookup: Vec<u64>,
    rows_built: usize,
    row_timeout: Duration,
}

#[derive(Debug)]
struct TrajectoryState {
    settings: TrajectorySettings,
    scaling: ScalingCache,
    run: Option<ProfileRun>,
    end_step: u64,
}

/// Drives a motion controller through profile builds for the scanned axes.
#[derive(Debug)]
pub struct TrajectoryPart {
    name: String,
    mri: String,
    row_timeout_base: f64,
    state: Mutex<TrajectoryState>,
}

impl TrajectoryPart {
    /// Part for the motion controller block `mri`.
    pub fn new(name: impl Into<String>, mri: impl Into<String>, config: &TrajectoryConfig) -> Self {
        Self {
            name: name.into(),
            mri: mri.into(),
            row_timeout_base: config.row_timeout_base_s,
            state: Mutex::new(TrajectoryState {
                settings: TrajectorySettings {
                    points_per_build: config.points_per_build,
                },
                scaling: ScalingCache::new(),
                run: None,
                end_step: 0,
            }),
        }
    }

    /// Current design settings
    pub fn settings(&self) -> TrajectorySettings {
        self.state.lock().settings.clone()
    }

    // =========================================================================
    // Validate
    // =========================================================================

    fn validate(&self, part_info: &crate::info::PartInfo, params: &crate::hooks::ConfigureParams) -> ScanResult<Vec<Info>> {
        let axes = params.axes_to_move();
        if axes.is_empty() {
            return Ok(vec![]);
        }
        let motors: Vec<MotorInfo> = filter_values(part_info);
        let mapping = resolve_cs(&motors, &axes)?;
        let minimum = minimum_duration(&params.generator, &mapping);
        if params.generator.duration < minimum {
            info!(part = %self.name, requested = params.generator.duration, minimum, "Point duration too short for axis velocity");
            return Ok(vec![Info::ParameterTweak {
                parameter: "generator.duration".into(),
                value: json!(minimum),
            }]);
        }
        Ok(vec![])
    }

    // =========================================================================
    // Configure / PostRunArmed / Seek
    // =========================================================================

    #[instrument(skip_all, fields(part = %self.name, completed = args.completed_steps, steps = args.steps_to_do))]
    async fn configure(&self, ctx: &Context, args: &ConfigureArgs) -> ScanResult<Vec<Info>> {
        let end = args.completed_steps + args.steps_to_do;
        {
            let mut state = self.state.lock();
            state.run = None;
            state.end_step = end;
        }
        let axes = args.params.axes_to_move();
        if axes.is_empty() {
            debug!(part = %self.name, "No axes to move, nothing to program");
            return Ok(vec![]);
        }

        let motors: Vec<MotorInfo> = filter_values(&args.part_info);
        let mapping = resolve_cs(&motors, &axes)?;
        let view = ctx.block_view(&self.mri)?;
        let cs_port: String = view.get("cs")?;
        if cs_port != mapping.cs_port {
            return Err(ScanError::InconsistentCoordinateSystem(format!(
                "axes are on {} but {} drives {cs_port}",
                mapping.cs_port, self.mri
            )));
        }
        self.program_scaling(ctx, view.as_ref(), &mapping).await?;

        let points_per_build = self.state.lock().settings.points_per_build;
        let generator = args.params.generator.clone();
        let duration = generator.duration;
        let mut planner = ProfilePlanner::new(generator, mapping.clone(), args.completed_steps, end, points_per_build);
        self.move_to_start(ctx, view.as_ref(), &planner, &mapping).await?;

        let batch = planner
            .next_batch()?
            .ok_or_else(|| ScanError::ParameterOutOfRange(format!("no steps to plan in [{}, {end})", args.completed_steps)))?;
        let longest_row = batch.time.iter().copied().max().unwrap_or(0);
        let mut run = ProfileRun {
            planner,
            lookup: Vec::new(),
            rows_built: 0,
            row_timeout: Duration::from_secs_f64(
                self.row_timeout_base + duration + f64::from(longest_row) * TICK_S,
            ),
        };
        self.write_batch(ctx, view.as_ref(), &mut run, batch, false).await?;
        info!(part = %self.name, rows = run.rows_built, "Profile built");
        self.state.lock().run = Some(run);
        Ok(vec![])
    }

    async fn program_scaling(&self, ctx: &Context, view: &dyn BlockView, mapping: &CsMapping) -> ScanResult<()> {
        let changed: Vec<(String, f64, f64)> = {
            let mut state = self.state.lock();
            mapping
                .axes
                .values()
                .filter_map(|motor| {
                    let (scaling, changed) = state.scaling.resolve(&motor.cs_axis, motor, PositionKind::Pos);
                    changed.then(|| (motor.cs_axis.clone(), scaling.scale, scaling.offset))
                })
                .collect()
        };
        for (axis, scale, offset) in changed {
            debug!(part = %self.name, axis = %axis, scale, offset, "Programming axis scaling");
            ctx.put(view, &format!("resolution{axis}"), json!(scale)).await?;
            ctx.put(view, &format!("offset{axis}"), json!(offset)).await?;
        }
        Ok(())
    }

    async fn move_to_start(
        &self,
        ctx: &Context,
        view: &dyn BlockView,
        planner: &ProfilePlanner,
        mapping: &CsMapping,
    ) -> ScanResult<()> {
        let start = planner.start_positions()?;
        let mut args = Map::new();
        let mut move_time: f64 = 0.0;
        for motor in mapping.axes.values() {
            if let Some(&position) = start.get(&motor.cs_axis) {
                move_time = move_time.max(motor.move_time(position - motor.current_position));
                args.insert(motor.cs_axis.clone(), json!(position));
            }
        }
        args.insert("moveTime".into(), json!(move_time));
        ctx.post(view, "moveCS", Value::Object(args)).await?;
        Ok(())
    }

    async fn write_batch(
        &self,
        ctx: &Context,
        view: &dyn BlockView,
        run: &mut ProfileRun,
        batch: ProfileBatch,
        append: bool,
    ) -> ScanResult<()> {
        batch.check()?;
        for axis in CS_AXIS_NAMES {
            ctx.put(view, &format!("use{axis}"), json!(batch.positions.contains_key(axis)))
                .await?;
        }
        for (axis, column) in &batch.positions {
            ctx.put(view, &format!("positions{axis}"), json!(column)).await?;
        }
        let modes: Vec<u8> = batch.velocity_mode.iter().map(|m| *m as u8).collect();
        let programs: Vec<u8> = batch.user_programs.iter().map(|p| *p as u8).collect();
        ctx.put_many(
            view,
            vec![
                ("timeArray", json!(batch.time)),
                ("velocityMode", json!(modes)),
                ("userPrograms", json!(programs)),
                ("numPoints", json!(run.rows_built + batch.len())),
                ("pointsToBuild", json!(batch.len())),
            ],
        )
        .await?;
        let method = if append { "appendProfile" } else { "buildProfile" };
        ctx.post(view, method, json!({})).await?;

        run.rows_built += batch.len();
        run.lookup.extend_from_slice(&batch.completed_steps);
        debug!(part = %self.name, method, rows = batch.len(), total_rows = run.rows_built, "Profile rows sent");
        Ok(())
    }

    // =========================================================================
    // Run / Resume
    // =========================================================================

    #[instrument(skip_all, fields(part = %self.name))]
    async fn run(&self, ctx: &Context) -> ScanResult<Vec<Info>> {
        let (run, end_step, points_per_build) = {
            let mut state = self.state.lock();
            (state.run.take(), state.end_step, state.settings.points_per_build)
        };
        let Some(mut run) = run else {
            ctx.update_completed_steps(end_step);
            return Ok(vec![]);
        };
        let view = ctx.block_view(&self.mri)?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.subscribe_value(view.as_ref(), "pointsScanned", move |update| {
            if let Some(points) = update.value.as_u64() {
                let _ = tx.send(points as usize);
            }
        })?;
        let execute = ctx.post_async(view.clone(), "executeProfile", json!({}));

        loop {
            tokio::select! {
                biased;
                result = ctx.wait(&execute) => {
                    result?;
                    break;
                }
                scanned = ctx.cancellable(next_scanned(&mut rx, run.row_timeout, &self.mri)) => {
                    let scanned = scanned?;
                    self.report(ctx, &run, scanned);
                    let queued = run.rows_built.saturating_sub(scanned);
                    if !run.planner.is_finished() && queued < points_per_build / 2 {
                        if let Some(batch) = run.planner.next_batch()? {
                            self.write_batch(ctx, view.as_ref(), &mut run, batch, true).await?;
                        }
                    }
                }
            }
        }
        ctx.unsubscribe_all();

        let scanned: usize = view.get("pointsScanned")?;
        if !run.planner.is_finished() || scanned < run.rows_built {
            return Err(ScanError::device(
                &self.mri,
                format!("profile stopped at row {scanned} of {}", run.rows_built),
            ));
        }
        self.report(ctx, &run, scanned);
        info!(part = %self.name, rows = scanned, "Profile complete");
        Ok(vec![])
    }

    fn report(&self, ctx: &Context, run: &ProfileRun, scanned: usize) {
        if let Some(&steps) = scanned.checked_sub(1).and_then(|row| run.lookup.get(row)) {
            ctx.update_completed_steps(steps);
        }
    }

    // =========================================================================
    // Pause / Abort
    // =========================================================================

    async fn stop(&self, ctx: &Context) -> ScanResult<Vec<Info>> {
        self.state.lock().run = None;
        let view = ctx.block_view(&self.mri)?;
        ctx.post(view.as_ref(), "abortProfile", json!({})).await?;
        Ok(vec![])
    }

    // =========================================================================
    // Save / Load
    // =========================================================================

    fn save(&self) -> ScanResult<Vec<Info>> {
        Ok(vec![Info::PartDesign(serde_json::to_value(self.settings())?)])
    }

    fn load(&self, design: Option<Value>) -> ScanResult<Vec<Info>> {
        if let Some(value) = design {
            let settings: TrajectorySettings = serde_json::from_value(value)?;
            if settings.points_per_build < 5 {
                return Err(ScanError::Configuration(format!(
                    "pointsPerBuild must be at least 5, got {}",
                    settings.points_per_build
                )));
            }
            self.state.lock().settings = settings;
        }
        Ok(vec![])
    }
}

async fn next_scanned(rx: &mut mpsc::UnboundedReceiver<usize>, timeout: Duration, mri: &str) -> ScanResult<usize> {
    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Some(points)) => Ok(points),
        Ok(None) => Err(ScanError::device(mri, "pointsScanned subscription closed")),
        Err(_) => Err(ScanError::FrameTimeout {
            what: format!("{mri}.pointsScanned"),
            seconds: timeout.as_secs_f64(),
        }),
    }
}

impl Part for TrajectoryPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn mri(&self) -> Option<&str> {
        Some(&self.mri)
    }

    fn setup(self: Arc<Self>, registrar: &mut PartRegistrar) {
        registrar.hook(Hook::Validate, &self, |part, _ctx, call| async move {
            let (part_info, params) = call.validate()?;
            part.validate(part_info, params)
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
        registrar.hook(Hook::Save, &self, |part, _ctx, _call| async move { part.save() });
        registrar.hook(Hook::Load, &self, |part, _ctx, call| async move {
            let design = call.load_for(&part.name)?;
            part.load(design)
        });
        registrar.hook(Hook::ReportExportable, &self, |_part, _ctx, _call| async move {
            Ok(vec![Info::Exportable {
                field: "pointsPerBuild".into(),
            }])
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockRegistry;
    use crate::generator::{CompoundGenerator, LineSpec};
    use crate::hooks::ConfigureParams;
    use crate::info::PartInfo;
    use crate::sim::motion_controller_block;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio_util::sync::CancellationToken;

    fn motor(scannable: &str, cs_axis: &str) -> MotorInfo {
        MotorInfo {
            cs_axis: cs_axis.into(),
            cs_port: "CS1".into(),
            acceleration: 10.0,
            resolution: 0.001,
            offset: 0.0,
            max_velocity: 1.0,
            current_position: 0.0,
            scannable: scannable.into(),
            velocity_settle: 0.0,
            units: "mm".into(),
        }
    }

    fn part_info() -> PartInfo {
        PartInfo::from([
            ("x".to_string(), vec![Info::Motor(motor("x", "A"))]),
            ("y".to_string(), vec![Info::Motor(motor("y", "B"))]),
        ])
    }

    fn params(duration: f64) -> ConfigureParams {
        let generator = CompoundGenerator::new(
            vec![
                LineSpec::new("y", "mm", 0.0, 0.1, 2),
                LineSpec::new("x", "mm", 0.0, 0.2, 3),
            ],
            duration,
            true,
        );
        ConfigureParams::new(generator)
    }

    fn args(completed: u64, steps: u64, params: ConfigureParams) -> ConfigureArgs {
        ConfigureArgs {
            completed_steps: completed,
            steps_to_do: steps,
            part_info: part_info(),
            params: Arc::new(params),
        }
    }

    fn setup() -> (Arc<BlockRegistry>, TrajectoryPart) {
        let registry = Arc::new(BlockRegistry::new());
        registry.register(motion_controller_block("PMAC", "CS1")).unwrap();
        let part = TrajectoryPart::new("pmac", "PMAC", &TrajectoryConfig::default());
        (registry, part)
    }

    #[test]
    fn short_duration_is_tweaked() {
        let (_registry, part) = setup();
        let infos = part.validate(&part_info(), &params(0.001)).unwrap();
        let [Info::ParameterTweak { parameter, value }] = infos.as_slice() else {
            panic!("expected a tweak, got {infos:?}");
        };
        assert_eq!(parameter, "generator.duration");
        assert!(value.as_f64().unwrap() > 0.001);

        assert!(part.validate(&part_info(), &params(1.0)).unwrap().is_empty());
    }

    #[test]
    fn no_axes_to_move_skips_validation() {
        let (_registry, part) = setup();
        let params = params(0.001).with_axes_to_move(&[]);
        assert!(part.validate(&PartInfo::new(), &params).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn configure_and_run_report_every_step() {
        let (registry, part) = setup();
        let reported = Arc::new(AtomicU64::new(0));
        let sink_reported = reported.clone();
        let ctx = Context::new(registry.clone(), CancellationToken::new(), "pmac")
            .with_progress(Arc::new(move |_part: &str, steps| {
                sink_reported.fetch_max(steps, Ordering::SeqCst);
            }));

        part.configure(&ctx, &args(0, 6, params(0.5))).await.unwrap();
        let view = registry.get("PMAC").unwrap();
        assert!(view.get::<bool>("useA").unwrap());
        assert!(view.get::<bool>("useB").unwrap());
        assert!(!view.get::<bool>("useC").unwrap());
        assert!(view.get::<usize>("pointsBuilt").unwrap() > 6);
        assert_eq!(view.get::<f64>("resolutionA").unwrap(), 0.001);

        part.run(&ctx).await.unwrap();
        assert_eq!(reported.load(Ordering::SeqCst), 6);
        assert_eq!(
            view.get::<usize>("pointsScanned").unwrap(),
            view.get::<usize>("pointsBuilt").unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_profile_times_out() {
        let (registry, part) = setup();
        let ctx = Context::new(registry.clone(), CancellationToken::new(), "pmac");
        part.configure(&ctx, &args(0, 6, params(0.5))).await.unwrap();
        let view = registry.get("PMAC").unwrap();
        view.put("stalled", json!(true)).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = part.run(&ctx).await.unwrap_err();
        let ScanError::FrameTimeout { what, .. } = err else {
            panic!("expected a frame timeout, got {err:?}");
        };
        assert_eq!(what, "PMAC.pointsScanned");
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(view.get::<usize>("pointsScanned").unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn small_batches_are_appended_while_running() {
        let (registry, part) = setup();
        part.load(Some(json!({ "pointsPerBuild": 5 }))).unwrap();
        let reported = Arc::new(AtomicU64::new(0));
        let sink_reported = reported.clone();
        let ctx = Context::new(registry.clone(), CancellationToken::new(), "pmac")
            .with_progress(Arc::new(move |_part: &str, steps| {
                sink_reported.fetch_max(steps, Ordering::SeqCst);
            }));

        part.configure(&ctx, &args(0, 6, params(0.5))).await.unwrap();
        part.run(&ctx).await.unwrap();
        assert_eq!(reported.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn run_without_axes_reports_the_end_step() {
        let (registry, part) = setup();
        let reported = Arc::new(AtomicU64::new(0));
        let sink_reported = reported.clone();
        let ctx = Context::new(registry, CancellationToken::new(), "pmac")
            .with_progress(Arc::new(move |_part: &str, steps| {
                sink_reported.store(steps, Ordering::SeqCst);
            }));
        let params = params(0.5).with_axes_to_move(&[]);
        part.configure(&ctx, &args(0, 6, params)).await.unwrap();
        part.run(&ctx).await.unwrap();
        assert_eq!(reported.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn wrong_cs_port_is_rejected() {
        let registry = Arc::new(BlockRegistry::new());
        registry.register(motion_controller_block("PMAC", "CS2")).unwrap();
        let part = TrajectoryPart::new("pmac", "PMAC", &TrajectoryConfig::default());
        let ctx = Context::new(registry, CancellationToken::new(), "pmac");
        let err = part.configure(&ctx, &args(0, 6, params(0.5))).await.unwrap_err();
        assert!(matches!(err, ScanError::InconsistentCoordinateSystem(_)));
    }

    #[test]
    fn design_round_trip_and_bounds() {
        let (_registry, part) = setup();
        let design = part.save().unwrap();
        let [Info::PartDesign(value)] = design.as_slice() else {
            panic!("expected a design");
        };
        assert_eq!(value["pointsPerBuild"], json!(4000));
        assert!(part.load(Some(json!({ "pointsPerBuild": 2 }))).is_err());
        part.load(Some(json!({ "pointsPerBuild": 50 }))).unwrap();
        assert_eq!(part.settings().points_per_build, 50);
    }
}
