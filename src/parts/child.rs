//! Child controller part
//!
//! Lets one runnable controller drive another through its block view. The child
//! is configured with the parent's parameters, so its step counters line up with
//! the parent's and its `completedSteps` is forwarded as this part's progress.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::block::{BlockView, BlockViewExt};
use crate::context::{BlockFuture, Context};
use crate::error::{ScanError, ScanResult};
use crate::hooks::{ConfigureArgs, ConfigureParams, Hook};
use crate::info::Info;
use crate::part::{Part, PartRegistrar};

/// Drives a child [`RunnableController`](crate::controller::RunnableController).
#[derive(Debug)]
pub struct ChildPart {
    name: String,
    mri: String,
    run: Mutex<Option<BlockFuture>>,
}

fn state(view: &dyn BlockView) -> ScanResult<String> {
    view.get("state")
}

impl ChildPart {
    /// Part driving the controller published as `mri`.
    pub fn new(name: impl Into<String>, mri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mri: mri.into(),
            run: Mutex::new(None),
        }
    }

    /// Bring the child back to Ready from wherever the last scan left it.
    async fn ensure_ready(&self, ctx: &Context, view: &dyn BlockView) -> ScanResult<()> {
        let current = state(view)?;
        match current.as_str() {
            "Ready" => return Ok(()),
            "Paused" | "Running" | "PostRun" | "Seeking" | "Configuring" => {
                ctx.post(view, "abort", json!({})).await?;
            }
            _ => {}
        }
        debug!(part = %self.name, from = %current, "Resetting child");
        ctx.post(view, "reset", json!({})).await?;
        Ok(())
    }

    /// Ask the child to validate `params` and turn every changed top-level field into a tweak.
    async fn validate(&self, ctx: &Context, params: &ConfigureParams) -> ScanResult<Vec<Info>> {
        let view = ctx.block_view(&self.mri)?;
        let ours = serde_json::to_value(params)?;
        let theirs = ctx.post(view.as_ref(), "validate", ours.clone()).await?;
        let (Value::Object(ours), Value::Object(theirs)) = (ours, theirs) else {
            return Err(ScanError::device(&self.mri, "validate did not return parameters"));
        };
        Ok(theirs
            .into_iter()
            .filter(|(key, value)| ours.get(key) != Some(value))
            .map(|(parameter, value)| Info::ParameterTweak { parameter, value })
            .collect())
    }

    #[instrument(skip_all, fields(part = %self.name, completed = args.completed_steps))]
    async fn configure(&self, ctx: &Context, args: &ConfigureArgs) -> ScanResult<Vec<Info>> {
        *self.run.lock() = None;
        let view = ctx.block_view(&self.mri)?;
        self.ensure_ready(ctx, view.as_ref()).await?;
        ctx.post(view.as_ref(), "configure", serde_json::to_value(args.params.as_ref())?)
            .await?;
        if args.completed_steps > 0 {
            ctx.post(view.as_ref(), "pause", json!({ "lastGoodStep": args.completed_steps }))
                .await?;
        }
        info!(part = %self.name, "Child armed");
        Ok(vec![])
    }

    /// Reposition the child after the parent paused.
    async fn seek(&self, ctx: &Context, args: &ConfigureArgs) -> ScanResult<Vec<Info>> {
        let view = ctx.block_view(&self.mri)?;
        if state(view.as_ref())? != "Ready" {
            ctx.post(view.as_ref(), "pause", json!({ "lastGoodStep": args.completed_steps }))
                .await?;
            return Ok(vec![]);
        }
        // The child already finished its part of the scan; start it again from the target.
        self.configure(ctx, args).await
    }

    #[instrument(skip_all, fields(part = %self.name))]
    async fn run(&self, ctx: &Context) -> ScanResult<Vec<Info>> {
        let view = ctx.block_view(&self.mri)?;
        if let Some(sink) = ctx.progress_sink() {
            let part = ctx.part_name().to_string();
            ctx.subscribe_value(view.as_ref(), "completedSteps", move |update| {
                if let Some(steps) = update.value.as_u64() {
                    sink(&part, steps);
                }
            })?;
        }

        let pending = self.run.lock().clone();
        let run = match (state(view.as_ref())?.as_str(), pending) {
            ("Paused", Some(run)) => {
                ctx.post(view.as_ref(), "resume", json!({})).await?;
                run
            }
            ("Paused", None) => ctx.post_async(view.clone(), "resume", json!({})),
            _ => ctx.post_async(view.clone(), "run", json!({})),
        };
        *self.run.lock() = Some(run.clone());
        ctx.wait(&run).await?;
        *self.run.lock() = None;

        let steps: u64 = view.get("completedSteps")?;
        ctx.update_completed_steps(steps);
        Ok(vec![])
    }

    async fn abort(&self, ctx: &Context) -> ScanResult<Vec<Info>> {
        *self.run.lock() = None;
        let view = ctx.block_view(&self.mri)?;
        let current = state(view.as_ref())?;
        if matches!(
            current.as_str(),
            "Ready" | "Configuring" | "Armed" | "Running" | "PostRun" | "Paused" | "Seeking"
        ) {
            ctx.post(view.as_ref(), "abort", json!({})).await?;
        }
        Ok(vec![])
    }

    fn save(&self, ctx: &Context) -> ScanResult<Vec<Info>> {
        let view = ctx.block_view(&self.mri)?;
        let design: String = view.get("design")?;
        Ok(vec![Info::PartDesign(json!({ "design": design }))])
    }

    async fn load(&self, ctx: &Context, design: Option<Value>) -> ScanResult<Vec<Info>> {
        let name = design
            .as_ref()
            .and_then(|d| d.get("design"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !name.is_empty() {
            let view = ctx.block_view(&self.mri)?;
            ctx.put(view.as_ref(), "design", json!(name)).await?;
        }
        Ok(vec![])
    }
}

impl Part for ChildPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn mri(&self) -> Option<&str> {
        Some(&self.mri)
    }

    fn setup(self: Arc<Self>, registrar: &mut PartRegistrar) {
        registrar.hook(Hook::Validate, &self, |part, ctx, call| async move {
            let (_, params) = call.validate()?;
            part.validate(&ctx, params).await
        });
        registrar.hook(Hook::Configure, &self, |part, ctx, call| async move {
            part.configure(&ctx, call.configure()?).await
        });
        registrar.hook(Hook::Seek, &self, |part, ctx, call| async move {
            part.seek(&ctx, call.configure()?).await
        });
        registrar.hooks(&[Hook::Run, Hook::Resume], &self, |part, ctx, _call| async move {
            part.run(&ctx).await
        });
        registrar.hook(Hook::Abort, &self, |part, ctx, _call| async move { part.abort(&ctx).await });
        registrar.hook(Hook::Save, &self, |part, ctx, _call| async move { part.save(&ctx) });
        registrar.hook(Hook::Load, &self, |part, ctx, call| async move {
            let design = call.load_for(&part.name)?;
            part.load(&ctx, design).await
        });
    }
}
