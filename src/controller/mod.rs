//! Runnable controller
//!
//! The controller owns the scan state machine, the validated parameters and the
//! step counters, and drives its parts through hooks:
//!
//! - `validate` loops ReportStatus/Validate until no part asks for a tweak
//! - `configure` programs every part for the first run of the scan
//! - `run` executes one run of `stepsPerRun` steps, then PostRunArmed or PostRunReady
//! - `pause` cancels the running hooks and seeks every part back to a known step
//! - `abort` cancels everything and leaves the controller in Aborted until `reset`
//!
//! State and counters are published on a [`Block`] so observers see them in the order
//! the controller changed them; the controller also implements [`BlockView`] so it can
//! be driven as the child of another controller.
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = RunnableController::new("SCAN", config.controller.clone(), registry);
//! controller.add_part(Arc::new(MotorAxisPart::new("x", "MOTOR:X")))?;
//! controller.init().await?;
//!
//! controller.configure(ConfigureParams::new(generator)).await?;
//! controller.run().await?;
//! ```

pub mod design;
pub mod dispatch;
pub mod state;

pub use design::{DesignStore, LayoutEntry, SavedDesign};
pub use dispatch::HookDispatcher;
pub use state::{ControllerMethod, RunnableState};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::block::{Alarm, AttributeMeta, AttributeUpdate, Block, BlockRegistry, BlockView};
use crate::config::ControllerConfig;
use crate::context::ProgressSink;
use crate::error::{ScanError, ScanResult};
use crate::generator::CompoundGenerator;
use crate::hooks::{ConfigureArgs, ConfigureParams, Hook, HookArgs};
use crate::info::{filter_values, DatasetProducer, Info, LayoutInfo, ParameterTweak, PartInfo};
use crate::part::{Part, PartHandlers};

/// Mutable scan state, guarded by one lock so counters and state change together.
struct Inner {
    state: RunnableState,
    scope: CancellationToken,
    params: Option<Arc<ConfigureParams>>,
    steps_per_run: u64,
    completed: u64,
    configured: u64,
    total: u64,
    progress: BTreeMap<String, u64>,
    configure_info: PartInfo,
    ports: PartInfo,
    exportable: PartInfo,
    layout: Vec<LayoutInfo>,
    exports: BTreeMap<String, String>,
    design: String,
    saved: SavedDesign,
    driver_present: bool,
}

/// Clears the run-driver flag when a `run`/`resume` call returns.
struct DriverGuard<'a>(&'a RunnableController);

impl Drop for DriverGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.lock().driver_present = false;
    }
}

/// Scan controller driving a set of parts through the runnable lifecycle.
pub struct RunnableController {
    mri: String,
    config: ControllerConfig,
    block: Arc<Block>,
    dispatcher: HookDispatcher,
    store: DesignStore,
    parts: RwLock<Vec<Arc<PartHandlers>>>,
    part_mris: RwLock<BTreeMap<String, Option<String>>>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<RunnableState>,
    busy: tokio::sync::Mutex<()>,
    self_ref: Weak<RunnableController>,
}

impl RunnableController {
    /// Create a controller in the Disabled state; call [`RunnableController::init`]
    /// once its parts are added.
    pub fn new(mri: impl Into<String>, config: ControllerConfig, registry: Arc<BlockRegistry>) -> Arc<Self> {
        let mri = mri.into();
        Arc::new_cyclic(|weak: &Weak<RunnableController>| {
            let block = Self::build_block(&mri, weak);
            let (state_tx, _) = watch::channel(RunnableState::Disabled);
            let store = DesignStore::new(&config.design_dir, &mri);
            let controller = Self {
                dispatcher: HookDispatcher::new(mri.clone(), registry),
                mri,
                config,
                block,
                store,
                parts: RwLock::new(Vec::new()),
                part_mris: RwLock::new(BTreeMap::new()),
                inner: Mutex::new(Inner {
                    state: RunnableState::Disabled,
                    scope: CancellationToken::new(),
                    params: None,
                    steps_per_run: 0,
                    completed: 0,
                    configured: 0,
                    total: 0,
                    progress: BTreeMap::new(),
                    configure_info: PartInfo::new(),
                    ports: PartInfo::new(),
                    exportable: PartInfo::new(),
                    layout: Vec::new(),
                    exports: BTreeMap::new(),
                    design: String::new(),
                    saved: SavedDesign::default(),
                    driver_present: false,
                }),
                state_tx,
                busy: tokio::sync::Mutex::new(()),
                self_ref: weak.clone(),
            };
            controller.publish_writeable(RunnableState::Disabled);
            controller
        })
    }

    fn build_block(mri: &str, weak: &Weak<RunnableController>) -> Arc<Block> {
        let mut builder = Block::builder(mri)
            .attribute("state", json!(RunnableState::Disabled.to_string()), AttributeMeta::new("State of the scan"))
            .attribute("health", json!("OK"), AttributeMeta::new("Fault message or OK"))
            .attribute("completedSteps", json!(0), AttributeMeta::new("Steps completed by every part"))
            .attribute("configuredSteps", json!(0), AttributeMeta::new("Steps the current run will reach"))
            .attribute("totalSteps", json!(0), AttributeMeta::new("Steps in the whole scan"))
            .attribute("axesToMove", Value::Null, AttributeMeta::new("Default axes moved within one run").config())
            .attribute("modified", json!(false), AttributeMeta::new("Layout or exports differ from the design"));

        let w = weak.clone();
        builder = builder.attribute_with_put(
            "layout",
            json!([]),
            AttributeMeta::new("Layout of child blocks"),
            move |_block, value| {
                let weak = w.clone();
                async move {
                    let rows: Vec<LayoutInfo> = serde_json::from_value(value)?;
                    upgrade(&weak)?.set_layout(rows).await
                }
            },
        );
        let w = weak.clone();
        builder = builder.attribute_with_put(
            "design",
            json!(""),
            AttributeMeta::new("Name of the loaded design"),
            move |_block, value| {
                let weak = w.clone();
                async move {
                    let name = value.as_str().unwrap_or_default().to_string();
                    upgrade(&weak)?.set_design(&name).await
                }
            },
        );
        let w = weak.clone();
        builder = builder.attribute_with_put(
            "exports",
            json!({}),
            AttributeMeta::new("Fields exported to the parent"),
            move |_block, value| {
                let weak = w.clone();
                async move {
                    let exports: BTreeMap<String, String> = serde_json::from_value(value)?;
                    upgrade(&weak)?.set_exports(exports)
                }
            },
        );

        for method in ControllerMethod::ALL {
            let w = weak.clone();
            builder = builder.method(method.name(), method.name(), move |_block, args| {
                let weak = w.clone();
                async move { upgrade(&weak)?.call(method.name(), args).await }
            });
        }
        builder.build()
    }

    // =========================================================================
    // Assembly
    // =========================================================================

    /// Add a part; its hooks are registered immediately.
    pub fn add_part<P: Part>(&self, part: Arc<P>) -> ScanResult<()> {
        let name = part.name().to_string();
        let mri = part.mri().map(str::to_string);
        {
            let mut mris = self.part_mris.write();
            if mris.contains_key(&name) {
                return Err(ScanError::Configuration(format!(
                    "Part '{name}' is already registered on '{}'",
                    self.mri
                )));
            }
            mris.insert(name.clone(), mri);
        }
        let handlers = PartHandlers::register(part);
        debug!(mri = %self.mri, part = %name, hooks = ?handlers.hooks().collect::<Vec<_>>(), "Added part");
        self.parts.write().push(Arc::new(handlers));
        Ok(())
    }

    /// Reset into Ready and load the configured initial design, if any.
    #[instrument(skip(self), fields(mri = %self.mri), err)]
    pub async fn init(&self) -> ScanResult<()> {
        self.reset().await?;
        if let Some(design) = self.config.initial_design.clone() {
            self.set_design(&design).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Controller mri
    pub fn mri(&self) -> &str {
        &self.mri
    }

    /// Block carrying the published attributes
    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    /// Current state
    pub fn state(&self) -> RunnableState {
        self.inner.lock().state
    }

    /// Follow state changes
    pub fn subscribe_state(&self) -> watch::Receiver<RunnableState> {
        self.state_tx.subscribe()
    }

    /// Steps completed by every part
    pub fn completed_steps(&self) -> u64 {
        self.inner.lock().completed
    }

    /// Steps the current run will reach
    pub fn configured_steps(&self) -> u64 {
        self.inner.lock().configured
    }

    /// Steps in the whole scan
    pub fn total_steps(&self) -> u64 {
        self.inner.lock().total
    }

    /// Steps per run derived from `axesToMove`
    pub fn steps_per_run(&self) -> u64 {
        self.inner.lock().steps_per_run
    }

    /// Fault message or "OK"
    pub fn health(&self) -> String {
        self.block
            .value("health")
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// Infos returned by the last Configure
    pub fn configure_info(&self) -> PartInfo {
        self.inner.lock().configure_info.clone()
    }

    /// Datasets the configured scan will write
    pub fn dataset_producers(&self) -> Vec<DatasetProducer> {
        filter_values(&self.inner.lock().configure_info)
    }

    /// Current layout rows
    pub fn layout(&self) -> Vec<LayoutInfo> {
        self.inner.lock().layout.clone()
    }

    /// Current exports
    pub fn exports(&self) -> BTreeMap<String, String> {
        self.inner.lock().exports.clone()
    }

    /// Name of the loaded design
    pub fn design(&self) -> String {
        self.inner.lock().design.clone()
    }

    /// Whether layout or exports differ from the loaded design
    pub fn modified(&self) -> bool {
        let inner = self.inner.lock();
        Self::is_modified(&inner)
    }

    /// Saved designs available to this controller
    pub fn designs(&self) -> ScanResult<Vec<String>> {
        self.store.list()
    }

    // =========================================================================
    // Validate / Configure
    // =========================================================================

    /// Check parameters with every part, applying their tweaks.
    #[instrument(skip_all, fields(mri = %self.mri), err)]
    pub async fn validate(&self, params: ConfigureParams) -> ScanResult<ConfigureParams> {
        self.check_writeable(ControllerMethod::Validate)?;
        self.validate_params(params).await
    }

    async fn validate_params(&self, params: ConfigureParams) -> ScanResult<ConfigureParams> {
        let mut params = self.with_default_axes(params);
        params.generator.validate()?;
        let generator_axes = params.generator.axes();
        for axis in params.axes_to_move() {
            if !generator_axes.contains(&axis) {
                return Err(ScanError::MissingScannable(format!(
                    "axis '{axis}' in axesToMove is not scanned by the generator"
                )));
            }
        }

        let scope = self.scope();
        let cap = self.config.validate_max_iterations;
        for iteration in 0..cap {
            let shared = Arc::new(params.clone());
            let part_info = self.dispatch(Hook::ReportStatus, HookArgs::None, &scope).await?;
            let results = self
                .dispatch(
                    Hook::Validate,
                    HookArgs::Validate {
                        part_info,
                        params: shared,
                    },
                    &scope,
                )
                .await?;

            let mut changed = false;
            for tweak in filter_values::<ParameterTweak>(&results) {
                let tweaked = params.apply_tweak(&tweak)?;
                if tweaked != params {
                    debug!(mri = %self.mri, iteration, parameter = %tweak.parameter, value = %tweak.value, "Applying tweak");
                    params = tweaked;
                    changed = true;
                }
            }
            if !changed {
                return Ok(params);
            }
            params.generator.validate()?;
        }
        Err(ScanError::ValidationDidNotConverge { iterations: cap })
    }

    fn with_default_axes(&self, mut params: ConfigureParams) -> ConfigureParams {
        if params.axes_to_move.is_none() {
            if let Ok(Value::Array(axes)) = self.block.value("axesToMove") {
                params.axes_to_move = Some(
                    axes.iter()
                        .filter_map(|a| a.as_str().map(str::to_string))
                        .collect(),
                );
            }
        }
        params
    }

    /// Validate then program every part for the first run.
    #[instrument(skip_all, fields(mri = %self.mri), err)]
    pub async fn configure(&self, params: ConfigureParams) -> ScanResult<ConfigureParams> {
        self.check_writeable(ControllerMethod::Configure)?;
        let params = self.validate_params(params).await?;
        self.transition_for(ControllerMethod::Configure, RunnableState::Configuring)?;

        let result = {
            let _busy = self.busy.lock().await;
            self.do_configure(Arc::new(params.clone())).await
        };
        match result.and_then(|()| self.finish(RunnableState::Configuring, RunnableState::Armed)) {
            Ok(()) => {
                info!(mri = %self.mri, total_steps = self.total_steps(), steps_per_run = self.steps_per_run(), "Configured");
                Ok(params)
            }
            Err(e) => {
                self.handle_error(&e);
                Err(e)
            }
        }
    }

    async fn do_configure(&self, params: Arc<ConfigureParams>) -> ScanResult<()> {
        let scope = self.scope();
        let design_parts = self.inner.lock().saved.parts.clone();
        if !design_parts.is_empty() {
            self.dispatch(Hook::Load, HookArgs::Load(Arc::new(design_parts)), &scope)
                .await?;
        }

        let total = params.generator.size();
        let steps_per_run = steps_per_run(&params.generator, &params.axes_to_move())?;
        {
            let mut inner = self.inner.lock();
            inner.params = Some(params.clone());
            inner.total = total;
            inner.steps_per_run = steps_per_run;
            inner.completed = 0;
            inner.configured = 0;
            inner.progress.clear();
            inner.configure_info.clear();
            self.publish_counters(&inner);
            self.publish(vec![("axesToMove", json!(params.axes_to_move()))]);
        }

        let part_info = self.dispatch(Hook::ReportStatus, HookArgs::None, &scope).await?;
        let configure_info = self
            .dispatch(
                Hook::Configure,
                HookArgs::Configure(ConfigureArgs {
                    completed_steps: 0,
                    steps_to_do: steps_per_run,
                    part_info,
                    params: params.clone(),
                }),
                &scope,
            )
            .await?;
        self.dispatch(
            Hook::PostConfigure,
            HookArgs::PostConfigure {
                part_info: configure_info.clone(),
                params,
            },
            &scope,
        )
        .await?;

        let mut inner = self.inner.lock();
        inner.configured = steps_per_run;
        inner.configure_info = configure_info;
        self.publish_counters(&inner);
        Ok(())
    }

    // =========================================================================
    // Run / Pause / Resume
    // =========================================================================

    /// Run the configured steps.
    ///
    /// Returns once the run finishes (Armed or Ready), fails, or is aborted. A pause
    /// does not return: the call waits for `resume` and carries on.
    #[instrument(skip(self), fields(mri = %self.mri))]
    pub async fn run(&self) -> ScanResult<()> {
        {
            let mut inner = self.inner.lock();
            self.check_writeable_in(ControllerMethod::Run, inner.state)?;
            self.set_state(&mut inner, RunnableState::Running);
            inner.driver_present = true;
        }
        let _driver = DriverGuard(self);
        self.run_loop(Hook::Run).await
    }

    async fn run_loop(&self, mut hook: Hook) -> ScanResult<()> {
        loop {
            let outcome = match self.run_hook(hook).await {
                Ok(()) => self.post_run().await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) if e.is_aborted() => match self.state() {
                    RunnableState::Seeking | RunnableState::Paused => {
                        debug!(mri = %self.mri, "Run interrupted by pause, waiting for resume");
                        self.wait_for_resume().await?;
                        hook = Hook::Resume;
                    }
                    _ => {
                        self.handle_error(&e);
                        return Err(e);
                    }
                },
                Err(e) => {
                    self.handle_error(&e);
                    return Err(e);
                }
            }
        }
    }

    async fn run_hook(&self, hook: Hook) -> ScanResult<()> {
        let _busy = self.busy.lock().await;
        let scope = {
            let mut inner = self.inner.lock();
            if inner.state != RunnableState::Running {
                return Err(ScanError::Aborted);
            }
            let completed = inner.completed;
            let reporting: Vec<String> = self
                .parts
                .read()
                .iter()
                .filter(|p| p.handler(hook).is_some())
                .map(|p| p.name().to_string())
                .collect();
            inner.progress = reporting.into_iter().map(|p| (p, completed)).collect();
            inner.scope.clone()
        };
        info!(mri = %self.mri, %hook, "Running");
        let parts = self.parts.read().clone();
        self.dispatcher
            .dispatch(&parts, hook, HookArgs::None, &scope, Some(self.progress_sink()))
            .await
            .map(|_| ())
    }

    async fn post_run(&self) -> ScanResult<()> {
        let _busy = self.busy.lock().await;
        let (scope, params, completed, total, steps_per_run) = {
            let mut inner = self.inner.lock();
            if inner.state != RunnableState::Running {
                return Err(ScanError::Aborted);
            }
            inner.completed = inner.completed.max(inner.configured);
            self.publish_counters(&inner);
            self.set_state(&mut inner, RunnableState::PostRun);
            let params = inner
                .params
                .clone()
                .ok_or_else(|| ScanError::device(&self.mri, "run without configure"))?;
            (
                inner.scope.clone(),
                params,
                inner.completed,
                inner.total,
                inner.steps_per_run,
            )
        };

        if completed < total {
            let steps_to_do = steps_per_run.min(total - completed);
            let part_info = self.dispatch(Hook::ReportStatus, HookArgs::None, &scope).await?;
            self.dispatch(
                Hook::PostRunArmed,
                HookArgs::Configure(ConfigureArgs {
                    completed_steps: completed,
                    steps_to_do,
                    part_info,
                    params,
                }),
                &scope,
            )
            .await?;
            let mut inner = self.inner.lock();
            if inner.state != RunnableState::PostRun {
                return Err(ScanError::Aborted);
            }
            inner.configured = completed + steps_to_do;
            self.publish_counters(&inner);
            self.set_state(&mut inner, RunnableState::Armed);
            info!(mri = %self.mri, completed_steps = completed, "Run finished, more steps to go");
        } else {
            self.dispatch(Hook::PostRunReady, HookArgs::None, &scope).await?;
            let mut inner = self.inner.lock();
            if inner.state != RunnableState::PostRun {
                return Err(ScanError::Aborted);
            }
            self.set_state(&mut inner, RunnableState::Ready);
            info!(mri = %self.mri, completed_steps = completed, "Scan complete");
        }
        Ok(())
    }

    async fn wait_for_resume(&self) -> ScanResult<()> {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                RunnableState::Running => return Ok(()),
                RunnableState::Seeking | RunnableState::Paused => {}
                _ => return Err(ScanError::Aborted),
            }
            if rx.changed().await.is_err() {
                return Err(ScanError::Aborted);
            }
        }
    }

    /// Stop the scan and reposition every part at `last_good_step`.
    ///
    /// Defaults to the current `completedSteps`. From Running or PostRun the
    /// controller ends up Paused; from Armed it returns to Armed.
    #[instrument(skip(self), fields(mri = %self.mri))]
    pub async fn pause(&self, last_good_step: Option<u64>) -> ScanResult<()> {
        let (from, target) = {
            let mut inner = self.inner.lock();
            self.check_writeable_in(ControllerMethod::Pause, inner.state)?;
            let target = last_good_step.unwrap_or(inner.completed);
            if target >= inner.total {
                return Err(ScanError::ParameterOutOfRange(format!(
                    "cannot seek to step {target} of a {} step scan",
                    inner.total
                )));
            }
            let from = inner.state;
            self.set_state(&mut inner, RunnableState::Seeking);
            Self::replace_scope(&mut inner);
            (from, target)
        };
        info!(mri = %self.mri, from = %from, target, "Pausing");

        let result = {
            let _busy = self.busy.lock().await;
            self.do_seek(target).await
        };
        let resume_state = match from {
            RunnableState::Running | RunnableState::PostRun => RunnableState::Paused,
            other => other,
        };
        match result.and_then(|()| self.finish(RunnableState::Seeking, resume_state)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.handle_error(&e);
                Err(e)
            }
        }
    }

    async fn do_seek(&self, target: u64) -> ScanResult<()> {
        let scope = self.scope();
        self.dispatch(Hook::Pause, HookArgs::None, &scope).await?;

        let (params, steps_per_run, total) = {
            let inner = self.inner.lock();
            let params = inner
                .params
                .clone()
                .ok_or_else(|| ScanError::device(&self.mri, "pause without configure"))?;
            (params, inner.steps_per_run, inner.total)
        };
        let in_run = target % steps_per_run;
        let steps_to_do = (steps_per_run - in_run).min(total - target);

        let part_info = self.dispatch(Hook::ReportStatus, HookArgs::None, &scope).await?;
        self.dispatch(
            Hook::Seek,
            HookArgs::Configure(ConfigureArgs {
                completed_steps: target,
                steps_to_do,
                part_info,
                params,
            }),
            &scope,
        )
        .await?;

        let mut inner = self.inner.lock();
        inner.completed = target;
        inner.configured = target + steps_to_do;
        inner.progress.clear();
        self.publish_counters(&inner);
        Ok(())
    }

    /// Continue a paused scan.
    ///
    /// If a `run` call is still waiting it carries on and this returns at once;
    /// otherwise this call drives the rest of the run itself.
    #[instrument(skip(self), fields(mri = %self.mri))]
    pub async fn resume(&self) -> ScanResult<()> {
        let drive = {
            let mut inner = self.inner.lock();
            self.check_writeable_in(ControllerMethod::Resume, inner.state)?;
            self.set_state(&mut inner, RunnableState::Running);
            let drive = !inner.driver_present;
            inner.driver_present = true;
            drive
        };
        if drive {
            let _driver = DriverGuard(self);
            self.run_loop(Hook::Resume).await
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Abort / Reset / Disable
    // =========================================================================

    /// Cancel all part work and move to Aborted.
    #[instrument(skip(self), fields(mri = %self.mri))]
    pub async fn abort(&self) -> ScanResult<()> {
        {
            let mut inner = self.inner.lock();
            self.check_writeable_in(ControllerMethod::Abort, inner.state)?;
            self.set_state(&mut inner, RunnableState::Aborting);
            Self::replace_scope(&mut inner);
        }
        info!(mri = %self.mri, "Aborting");
        let result = {
            let _busy = self.busy.lock().await;
            let scope = self.scope();
            self.dispatch(Hook::Abort, HookArgs::None, &scope).await
        };
        match result.and_then(|_| self.finish(RunnableState::Aborting, RunnableState::Aborted)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.handle_error(&e);
                Err(e)
            }
        }
    }

    /// Return to Ready from Fault, Disabled, Aborted or Armed.
    #[instrument(skip(self), fields(mri = %self.mri))]
    pub async fn reset(&self) -> ScanResult<()> {
        {
            let mut inner = self.inner.lock();
            self.check_writeable_in(ControllerMethod::Reset, inner.state)?;
            self.set_state(&mut inner, RunnableState::Resetting);
            Self::replace_scope(&mut inner);
        }
        let result = {
            let _busy = self.busy.lock().await;
            self.do_reset().await
        };
        match result.and_then(|()| self.finish(RunnableState::Resetting, RunnableState::Ready)) {
            Ok(()) => {
                info!(mri = %self.mri, "Reset to Ready");
                Ok(())
            }
            Err(e) => {
                self.handle_error(&e);
                Err(e)
            }
        }
    }

    async fn do_reset(&self) -> ScanResult<()> {
        let scope = self.scope();
        let ports = self.dispatch(Hook::ReportPorts, HookArgs::None, &scope).await?;
        let exportable = self
            .dispatch(Hook::ReportExportable, HookArgs::None, &scope)
            .await?;

        let mut rows: Vec<LayoutInfo> = self
            .part_mris
            .read()
            .iter()
            .filter_map(|(name, mri)| {
                mri.as_ref().map(|mri| LayoutInfo {
                    name: name.clone(),
                    mri: mri.clone(),
                    x: 0.0,
                    y: 0.0,
                    visible: ports.contains_key(name),
                })
            })
            .collect();

        let mut inner = self.inner.lock();
        inner.saved.apply_layout(&mut rows);
        inner.layout = rows;
        inner.ports = ports;
        inner.exportable = exportable;
        inner.params = None;
        inner.completed = 0;
        inner.configured = 0;
        inner.total = 0;
        inner.steps_per_run = 0;
        inner.progress.clear();
        inner.configure_info.clear();
        self.publish_counters(&inner);
        self.publish_design(&inner);
        self.publish_health("OK", Alarm::ok());
        Ok(())
    }

    /// Stop everything and switch off.
    #[instrument(skip(self), fields(mri = %self.mri))]
    pub fn disable(&self) -> ScanResult<()> {
        let mut inner = self.inner.lock();
        self.set_state(&mut inner, RunnableState::Disabled);
        Self::replace_scope(&mut inner);
        info!(mri = %self.mri, "Disabled");
        Ok(())
    }

    // =========================================================================
    // Designs, layout and exports
    // =========================================================================

    /// Allow layout and export edits.
    pub fn edit(&self) -> ScanResult<()> {
        self.transition_for(ControllerMethod::Edit, RunnableState::Editable)
            .map(|_| ())
    }

    /// Save the current settings under `design`, defaulting to the loaded design
    /// name or the controller mri.
    #[instrument(skip(self), fields(mri = %self.mri))]
    pub async fn save(&self, design: Option<String>) -> ScanResult<()> {
        let previous = self.transition_for(ControllerMethod::Save, RunnableState::Saving)?;
        let name = design
            .filter(|d| !d.is_empty())
            .or_else(|| Some(self.design()).filter(|d| !d.is_empty()))
            .unwrap_or_else(|| self.mri.clone());

        let result = async {
            let _busy = self.busy.lock().await;
            let scope = self.scope();
            let infos = self.dispatch(Hook::Save, HookArgs::None, &scope).await?;
            let (layout, exports) = {
                let inner = self.inner.lock();
                (SavedDesign::layout_from_rows(&inner.layout), inner.exports.clone())
            };
            let parts = infos
                .into_iter()
                .filter_map(|(part, infos)| {
                    infos.into_iter().find_map(|info| match info {
                        Info::PartDesign(value) => Some((part.clone(), value)),
                        _ => None,
                    })
                })
                .collect();
            let saved = SavedDesign {
                layout,
                exports,
                parts,
            };
            self.store.save(&name, &saved)?;
            Ok(saved)
        }
        .await;

        match result {
            Ok(saved) => {
                let mut inner = self.inner.lock();
                inner.saved = saved;
                inner.design = name;
                self.publish_design(&inner);
                self.set_state(&mut inner, RunnableState::Ready);
                Ok(())
            }
            Err(e) => {
                self.recover(previous, &e);
                Err(e)
            }
        }
    }

    /// Load a saved design, fully replacing layout, exports and part settings.
    #[instrument(skip(self), fields(mri = %self.mri))]
    pub async fn set_design(&self, design: &str) -> ScanResult<()> {
        let previous = self.transition_for(ControllerMethod::SetDesign, RunnableState::Loading)?;
        let result = async {
            let saved = self.store.load(design)?;
            self.apply_design(&saved).await?;
            Ok(saved)
        }
        .await;
        match result {
            Ok(saved) => {
                let mut inner = self.inner.lock();
                inner.saved = saved;
                inner.design = design.to_string();
                self.publish_design(&inner);
                self.set_state(&mut inner, RunnableState::Ready);
                info!(mri = %self.mri, design, "Loaded design");
                Ok(())
            }
            Err(e) => {
                self.recover(previous, &e);
                Err(e)
            }
        }
    }

    /// Discard edits, restoring the loaded design.
    #[instrument(skip(self), fields(mri = %self.mri))]
    pub async fn revert(&self) -> ScanResult<()> {
        self.transition_for(ControllerMethod::Revert, RunnableState::Reverting)?;
        let saved = self.inner.lock().saved.clone();
        match self.apply_design(&saved).await {
            Ok(()) => {
                let mut inner = self.inner.lock();
                self.publish_design(&inner);
                self.set_state(&mut inner, RunnableState::Ready);
                Ok(())
            }
            Err(e) => {
                self.recover(RunnableState::Editable, &e);
                Err(e)
            }
        }
    }

    async fn apply_design(&self, saved: &SavedDesign) -> ScanResult<()> {
        let _busy = self.busy.lock().await;
        {
            let mut inner = self.inner.lock();
            let mut rows = std::mem::take(&mut inner.layout);
            saved.apply_layout(&mut rows);
            inner.layout = rows;
            inner.exports = saved.exports.clone();
        }
        let scope = self.scope();
        self.dispatch(Hook::Load, HookArgs::Load(Arc::new(saved.parts.clone())), &scope)
            .await?;
        Ok(())
    }

    /// Move or show/hide children.
    pub async fn set_layout(&self, rows: Vec<LayoutInfo>) -> ScanResult<()> {
        self.check_writeable(ControllerMethod::Save)?;
        let ports = {
            let inner = self.inner.lock();
            for row in &rows {
                if !inner.layout.iter().any(|r| r.name == row.name) {
                    return Err(ScanError::Configuration(format!(
                        "'{}' is not a child of '{}'",
                        row.name, self.mri
                    )));
                }
            }
            inner.ports.clone()
        };
        let scope = self.scope();
        let result = self
            .dispatch(
                Hook::Layout,
                HookArgs::Layout {
                    ports,
                    layout: rows.clone(),
                },
                &scope,
            )
            .await;
        let reported: Vec<LayoutInfo> = match result {
            Ok(info) => filter_values(&info),
            Err(e) => {
                self.handle_error(&e);
                return Err(e);
            }
        };

        let mut inner = self.inner.lock();
        for row in rows.iter().chain(reported.iter()) {
            if let Some(existing) = inner.layout.iter_mut().find(|r| r.name == row.name) {
                existing.x = row.x;
                existing.y = row.y;
                existing.visible = row.visible;
            }
        }
        self.publish_design(&inner);
        Ok(())
    }

    /// Export `part.field` entries under new names.
    pub fn set_exports(&self, exports: BTreeMap<String, String>) -> ScanResult<()> {
        self.check_writeable(ControllerMethod::Save)?;
        let mut inner = self.inner.lock();
        for source in exports.keys() {
            let known = source.split_once('.').is_some_and(|(part, field)| {
                inner.exportable.get(part).is_some_and(|infos| {
                    infos
                        .iter()
                        .any(|i| matches!(i, Info::Exportable { field: f } if f == field))
                })
            });
            if !known {
                return Err(ScanError::Configuration(format!(
                    "'{source}' is not an exportable field of '{}'",
                    self.mri
                )));
            }
        }
        inner.exports = exports;
        self.publish_design(&inner);
        Ok(())
    }

    // =========================================================================
    // Method calls by name
    // =========================================================================

    /// Call a controller method by wire name with a JSON argument map.
    pub async fn call(&self, method: &str, args: Value) -> ScanResult<Value> {
        let Some(m) = ControllerMethod::from_name(method) else {
            return Err(ScanError::UnknownMethod {
                mri: self.mri.clone(),
                method: method.to_string(),
            });
        };
        match m {
            ControllerMethod::Validate => {
                let params: ConfigureParams = serde_json::from_value(args)?;
                Ok(serde_json::to_value(self.validate(params).await?)?)
            }
            ControllerMethod::Configure => {
                let params: ConfigureParams = serde_json::from_value(args)?;
                Ok(serde_json::to_value(self.configure(params).await?)?)
            }
            ControllerMethod::Run => self.run().await.map(|()| Value::Null),
            ControllerMethod::Pause => {
                let step = args.get("lastGoodStep").and_then(Value::as_u64);
                self.pause(step).await.map(|()| Value::Null)
            }
            ControllerMethod::Resume => self.resume().await.map(|()| Value::Null),
            ControllerMethod::Abort => self.abort().await.map(|()| Value::Null),
            ControllerMethod::Reset => self.reset().await.map(|()| Value::Null),
            ControllerMethod::Disable => self.disable().map(|()| Value::Null),
            ControllerMethod::Edit => self.edit().map(|()| Value::Null),
            ControllerMethod::Revert => self.revert().await.map(|()| Value::Null),
            ControllerMethod::Save => {
                let design = args
                    .get("designName")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.save(design).await.map(|()| Value::Null)
            }
            ControllerMethod::SetDesign => {
                let design = args
                    .get("design")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.set_design(&design).await.map(|()| Value::Null)
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn dispatch(&self, hook: Hook, args: HookArgs, scope: &CancellationToken) -> ScanResult<PartInfo> {
        let parts = self.parts.read().clone();
        self.dispatcher.dispatch(&parts, hook, args, scope, None).await
    }

    fn scope(&self) -> CancellationToken {
        self.inner.lock().scope.clone()
    }

    fn replace_scope(inner: &mut Inner) {
        inner.scope.cancel();
        inner.scope = CancellationToken::new();
    }

    fn progress_sink(&self) -> ProgressSink {
        let weak = self.self_ref.clone();
        Arc::new(move |part: &str, steps: u64| {
            if let Some(controller) = weak.upgrade() {
                controller.update_completed_steps(part, steps);
            }
        })
    }

    /// Record a part's progress and publish the minimum over reporting parts.
    pub fn update_completed_steps(&self, part: &str, steps: u64) {
        let mut inner = self.inner.lock();
        if inner.state != RunnableState::Running {
            return;
        }
        inner.progress.insert(part.to_string(), steps);
        let lowest = inner.progress.values().copied().min().unwrap_or(steps);
        let capped = lowest.min(inner.configured);
        if capped > inner.completed {
            inner.completed = capped;
            self.publish(vec![("completedSteps", json!(capped))]);
        }
    }

    fn check_writeable(&self, method: ControllerMethod) -> ScanResult<()> {
        self.check_writeable_in(method, self.state())
    }

    fn check_writeable_in(&self, method: ControllerMethod, state: RunnableState) -> ScanResult<()> {
        if method.writeable_in(state) {
            Ok(())
        } else {
            Err(ScanError::bad_transition(method.name(), state))
        }
    }

    /// Check `method` is allowed and move to `to`, returning the previous state.
    fn transition_for(&self, method: ControllerMethod, to: RunnableState) -> ScanResult<RunnableState> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        self.check_writeable_in(method, from)?;
        self.set_state(&mut inner, to);
        Ok(from)
    }

    /// Complete a transition started earlier, unless something else took over.
    fn finish(&self, from: RunnableState, to: RunnableState) -> ScanResult<()> {
        let mut inner = self.inner.lock();
        if inner.state == from {
            self.set_state(&mut inner, to);
            Ok(())
        } else {
            debug!(mri = %self.mri, expected = %from, actual = %inner.state, "State changed underneath");
            Err(ScanError::Aborted)
        }
    }

    fn set_state(&self, inner: &mut Inner, to: RunnableState) {
        if !inner.state.can_transition_to(to) {
            warn!(mri = %self.mri, from = %inner.state, to = %to, "Unexpected state transition");
        }
        debug!(mri = %self.mri, from = %inner.state, to = %to, "State change");
        inner.state = to;
        self.publish(vec![("state", json!(to.to_string()))]);
        self.publish_writeable(to);
        self.state_tx.send_replace(to);
    }

    fn publish_writeable(&self, state: RunnableState) {
        for method in ControllerMethod::ALL {
            if let Err(e) = self
                .block
                .set_method_writeable(method.name(), method.writeable_in(state))
            {
                error!(mri = %self.mri, error = %e, "Failed to update method writeability");
            }
        }
    }

    fn publish(&self, changes: Vec<(&str, Value)>) {
        let result = self.block.squashed(|c| {
            changes
                .into_iter()
                .try_for_each(|(name, value)| c.set(name, value))
        });
        if let Err(e) = result {
            error!(mri = %self.mri, error = %e, "Failed to publish attributes");
        }
    }

    fn publish_counters(&self, inner: &Inner) {
        self.publish(vec![
            ("completedSteps", json!(inner.completed)),
            ("configuredSteps", json!(inner.configured)),
            ("totalSteps", json!(inner.total)),
        ]);
    }

    fn publish_design(&self, inner: &Inner) {
        self.publish(vec![
            ("layout", json!(inner.layout)),
            ("exports", json!(inner.exports)),
            ("design", json!(inner.design)),
            ("modified", json!(Self::is_modified(inner))),
        ]);
    }

    fn publish_health(&self, message: &str, alarm: Alarm) {
        if let Err(e) = self.block.set_with_alarm("health", json!(message), alarm) {
            error!(mri = %self.mri, error = %e, "Failed to publish health");
        }
    }

    fn is_modified(inner: &Inner) -> bool {
        SavedDesign::layout_from_rows(&inner.layout) != inner.saved.layout
            || inner.exports != inner.saved.exports
    }

    /// Route a failure: Aborted never faults, Editable only logs, anything else faults.
    fn handle_error(&self, err: &ScanError) {
        let mut inner = self.inner.lock();
        if err.is_aborted() {
            if matches!(
                inner.state,
                RunnableState::Configuring | RunnableState::Running | RunnableState::PostRun
            ) {
                warn!(mri = %self.mri, state = %inner.state, "Part aborted the scan");
                self.set_state(&mut inner, RunnableState::Aborting);
                self.set_state(&mut inner, RunnableState::Aborted);
            }
            return;
        }
        if inner.state == RunnableState::Editable {
            warn!(mri = %self.mri, error = %err, "Error while editing");
            return;
        }
        if matches!(inner.state, RunnableState::Disabled | RunnableState::Fault) {
            return;
        }
        error!(mri = %self.mri, state = %inner.state, error = %err, "Fault");
        let message = err.to_string();
        self.publish_health(&message, Alarm::major(message.clone()));
        self.set_state(&mut inner, RunnableState::Fault);
    }

    /// Design operations started from Editable fall back to Editable on error.
    fn recover(&self, previous: RunnableState, err: &ScanError) {
        if previous == RunnableState::Editable {
            let mut inner = self.inner.lock();
            warn!(mri = %self.mri, error = %err, "Design operation failed while editing");
            self.set_state(&mut inner, RunnableState::Editable);
        } else {
            self.handle_error(err);
        }
    }
}

impl std::fmt::Debug for RunnableController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableController")
            .field("mri", &self.mri)
            .field("state", &self.state())
            .finish()
    }
}

fn upgrade(weak: &Weak<RunnableController>) -> ScanResult<Arc<RunnableController>> {
    weak.upgrade()
        .ok_or_else(|| ScanError::device("controller", "controller has been dropped"))
}

/// Steps executed per run: the product of the innermost dimensions whose axes are
/// all in `axes_to_move`. With no axes to move every step runs at once.
pub fn steps_per_run(generator: &CompoundGenerator, axes_to_move: &[String]) -> ScanResult<u64> {
    if axes_to_move.is_empty() {
        return Ok(generator.size());
    }
    let mut remaining: BTreeSet<&str> = axes_to_move.iter().map(String::as_str).collect();
    let mut steps = 1u64;
    for dim in generator.dimensions().iter().rev() {
        if remaining.is_empty() {
            break;
        }
        if dim.axes.iter().all(|a| remaining.contains(a.as_str())) {
            steps *= dim.size as u64;
            for axis in &dim.axes {
                remaining.remove(axis.as_str());
            }
        } else {
            break;
        }
    }
    if !remaining.is_empty() {
        return Err(ScanError::ParameterOutOfRange(format!(
            "axesToMove {remaining:?} are not the innermost dimensions of the generator"
        )));
    }
    Ok(steps)
}

#[async_trait]
impl BlockView for RunnableController {
    fn mri(&self) -> &str {
        &self.mri
    }

    fn value(&self, attribute: &str) -> ScanResult<Value> {
        self.block.value(attribute)
    }

    fn subscribe(&self, attribute: &str) -> ScanResult<watch::Receiver<AttributeUpdate>> {
        self.block.subscribe(attribute)
    }

    async fn put(&self, attribute: &str, value: Value) -> ScanResult<()> {
        self.block.put(attribute, value).await
    }

    async fn post(&self, method: &str, args: Value) -> ScanResult<Value> {
        self.call(method, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::LineSpec;
    use crate::part::PartRegistrar;
    use std::time::Duration;
    use tracing_test::traced_test;

    /// Asks for a longer point duration on every validate round.
    struct RestlessPart;

    impl Part for RestlessPart {
        fn name(&self) -> &str {
            "restless"
        }

        fn setup(self: Arc<Self>, registrar: &mut PartRegistrar) {
            registrar.hook(Hook::Validate, &self, |_part, _ctx, call| async move {
                let (_part_info, params) = call.validate()?;
                Ok(vec![Info::ParameterTweak {
                    parameter: "generator.duration".into(),
                    value: json!(params.generator.duration + 1.0),
                }])
            });
        }
    }

    /// Reports a fixed step count during Run, then holds the run open.
    struct StepReporter {
        name: &'static str,
        steps: u64,
        hold: Duration,
    }

    impl Part for StepReporter {
        fn name(&self) -> &str {
            self.name
        }

        fn setup(self: Arc<Self>, registrar: &mut PartRegistrar) {
            registrar.hook(Hook::Run, &self, |part, ctx, _call| async move {
                ctx.update_completed_steps(part.steps);
                ctx.sleep(part.hold).await?;
                Ok(vec![])
            });
        }
    }

    fn grid() -> CompoundGenerator {
        CompoundGenerator::new(
            vec![
                LineSpec::new("y", "mm", 0.0, 1.0, 2),
                LineSpec::new("x", "mm", 0.0, 1.0, 3),
            ],
            1.0,
            true,
        )
    }

    fn axes(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn steps_per_run_folds_inner_dimensions() {
        assert_eq!(steps_per_run(&grid(), &axes(&["x", "y"])).unwrap(), 6);
        assert_eq!(steps_per_run(&grid(), &axes(&["x"])).unwrap(), 3);
        assert_eq!(steps_per_run(&grid(), &[]).unwrap(), 6);
        assert!(steps_per_run(&grid(), &axes(&["y"])).is_err());
    }

    #[tokio::test]
    async fn starts_disabled_and_resets_to_ready() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControllerConfig {
            design_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let controller = RunnableController::new("SCAN", config, Arc::new(BlockRegistry::new()));
        assert_eq!(controller.state(), RunnableState::Disabled);
        assert!(matches!(
            controller.configure(ConfigureParams::new(grid())).await,
            Err(ScanError::BadTransition { .. })
        ));

        controller.init().await.unwrap();
        assert_eq!(controller.state(), RunnableState::Ready);
        assert_eq!(controller.block().value("state").unwrap(), json!("Ready"));
        assert!(controller.block().method_meta("configure").unwrap().writeable);
        assert!(!controller.block().method_meta("run").unwrap().writeable);
    }

    #[tokio::test]
    async fn configure_without_parts_arms_and_runs() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControllerConfig {
            design_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let controller = RunnableController::new("SCAN", config, Arc::new(BlockRegistry::new()));
        controller.init().await.unwrap();

        controller
            .configure(ConfigureParams::new(grid()).with_axes_to_move(&["x"]))
            .await
            .unwrap();
        assert_eq!(controller.state(), RunnableState::Armed);
        assert_eq!(controller.configured_steps(), 3);

        controller.run().await.unwrap();
        assert_eq!(controller.completed_steps(), 3);
        assert_eq!(controller.configured_steps(), 6);
        controller.run().await.unwrap();
        assert_eq!(controller.state(), RunnableState::Ready);
        assert_eq!(controller.completed_steps(), 6);
    }

    #[tokio::test]
    async fn unknown_axis_is_missing_scannable() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControllerConfig {
            design_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let controller = RunnableController::new("SCAN", config, Arc::new(BlockRegistry::new()));
        controller.init().await.unwrap();
        let err = controller
            .configure(ConfigureParams::new(grid()).with_axes_to_move(&["z"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::MissingScannable(_)));
        assert_eq!(controller.state(), RunnableState::Ready);
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_design_load_logs_fault() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControllerConfig {
            design_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let controller = RunnableController::new("SCAN", config, Arc::new(BlockRegistry::new()));
        controller.init().await.unwrap();

        assert!(controller.set_design("missing").await.is_err());
        assert_eq!(controller.state(), RunnableState::Fault);
        assert_ne!(controller.block().value("health").unwrap(), json!("OK"));
        assert!(logs_contain("Fault"));
        assert!(logs_contain("Cannot read design"));
    }

    #[tokio::test]
    async fn endless_tweaks_do_not_converge() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControllerConfig {
            design_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let cap = config.validate_max_iterations;
        let controller = RunnableController::new("SCAN", config, Arc::new(BlockRegistry::new()));
        controller.add_part(Arc::new(RestlessPart)).unwrap();
        controller.init().await.unwrap();

        let err = controller.validate(ConfigureParams::new(grid())).await.unwrap_err();
        assert!(
            matches!(err, ScanError::ValidationDidNotConverge { iterations } if iterations == cap),
            "{err:?}"
        );
        assert_eq!(controller.state(), RunnableState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_steps_is_the_slowest_part() {
        let dir = tempfile::tempdir().unwrap();
        let config = ControllerConfig {
            design_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let controller = RunnableController::new("SCAN", config, Arc::new(BlockRegistry::new()));
        controller
            .add_part(Arc::new(StepReporter {
                name: "slow",
                steps: 2,
                hold: Duration::from_secs(2),
            }))
            .unwrap();
        controller
            .add_part(Arc::new(StepReporter {
                name: "fast",
                steps: 4,
                hold: Duration::from_secs(1),
            }))
            .unwrap();
        controller.init().await.unwrap();
        controller.configure(ConfigureParams::new(grid())).await.unwrap();

        let running = controller.clone();
        let run = tokio::spawn(async move { running.run().await });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(controller.state(), RunnableState::Running);
        assert_eq!(controller.completed_steps(), 2);
        assert_eq!(controller.block().value("completedSteps").unwrap(), json!(2));

        run.await.unwrap().unwrap();
        assert_eq!(controller.completed_steps(), 6);
        assert_eq!(controller.state(), RunnableState::Ready);
    }
}
