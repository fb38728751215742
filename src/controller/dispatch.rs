//! Concurrent hook dispatch.
//!
//! Every part registered for a hook runs as its own task on a `JoinSet`, each with a
//! fresh [`Context`] sharing one child token of the controller's scope. The first
//! failure other than [`ScanError::Aborted`] cancels that token, the remaining tasks
//! are drained, and the failure is returned.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::block::BlockRegistry;
use crate::context::{Context, ProgressSink};
use crate::error::{ScanError, ScanResult};
use crate::hooks::{Hook, HookArgs, HookCall};
use crate::info::PartInfo;
use crate::part::PartHandlers;

/// Runs hooks across a set of parts.
#[derive(Clone)]
pub struct HookDispatcher {
    mri: String,
    registry: Arc<BlockRegistry>,
}

impl HookDispatcher {
    /// Dispatcher for the controller `mri`.
    pub fn new(mri: impl Into<String>, registry: Arc<BlockRegistry>) -> Self {
        Self {
            mri: mri.into(),
            registry,
        }
    }

    /// Run `hook` on every part that registered for it and gather their infos.
    pub async fn dispatch(
        &self,
        parts: &[Arc<PartHandlers>],
        hook: Hook,
        args: HookArgs,
        scope: &CancellationToken,
        progress: Option<ProgressSink>,
    ) -> ScanResult<PartInfo> {
        let token = scope.child_token();
        let call = HookCall {
            hook,
            args: Arc::new(args),
        };

        let mut tasks = JoinSet::new();
        for part in parts {
            let Some(handler) = part.handler(hook) else {
                continue;
            };
            let mut ctx = Context::new(self.registry.clone(), token.clone(), part.name());
            if let Some(sink) = &progress {
                ctx = ctx.with_progress(sink.clone());
            }
            let name = part.name().to_string();
            let call = call.clone();
            tasks.spawn(async move {
                let result = handler(Arc::new(ctx), call).await;
                (name, result)
            });
        }
        debug!(mri = %self.mri, %hook, parts = tasks.len(), "Dispatching hook");

        let mut part_info = PartInfo::new();
        let mut first_error: Option<ScanError> = None;
        let mut aborted = false;
        while let Some(joined) = tasks.join_next().await {
            let (name, result) = match joined {
                Ok(output) => output,
                Err(e) => (
                    "<task>".to_string(),
                    Err(ScanError::device(&self.mri, format!("{hook} handler panicked: {e}"))),
                ),
            };
            match result {
                Ok(infos) => {
                    part_info.insert(name, infos);
                }
                Err(ScanError::Aborted) => aborted = true,
                Err(e) => {
                    if first_error.is_none() {
                        warn!(mri = %self.mri, %hook, part = %name, error = %e, "Hook failed, cancelling siblings");
                        token.cancel();
                        first_error = Some(e);
                    } else {
                        debug!(mri = %self.mri, %hook, part = %name, error = %e, "Further hook failure");
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None if aborted => Err(ScanError::Aborted),
            None => Ok(part_info),
        }
    }
}

impl std::fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookDispatcher").field("mri", &self.mri).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::Info;
    use crate::part::{Part, PartRegistrar};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Sleeper {
        name: String,
        delay: Duration,
        fail: bool,
        cancelled: AtomicBool,
    }

    impl Part for Sleeper {
        fn name(&self) -> &str {
            &self.name
        }

        fn setup(self: Arc<Self>, registrar: &mut PartRegistrar) {
            registrar.hook(Hook::Run, &self, |part, ctx, _call| async move {
                if let Err(e) = ctx.sleep(part.delay).await {
                    part.cancelled.store(true, Ordering::SeqCst);
                    return Err(e);
                }
                if part.fail {
                    return Err(ScanError::device(&part.name, "motor fault"));
                }
                Ok(vec![Info::RunProgress { steps: 1 }])
            });
        }
    }

    fn sleeper(name: &str, secs: u64, fail: bool) -> Arc<Sleeper> {
        Arc::new(Sleeper {
            name: name.into(),
            delay: Duration::from_secs(secs),
            fail,
            cancelled: AtomicBool::new(false),
        })
    }

    fn handlers(parts: &[Arc<Sleeper>]) -> Vec<Arc<PartHandlers>> {
        parts
            .iter()
            .map(|p| Arc::new(PartHandlers::register(p.clone())))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn gathers_infos_from_every_part() {
        let parts = [sleeper("a", 1, false), sleeper("b", 2, false)];
        let dispatcher = HookDispatcher::new("SCAN", Arc::new(BlockRegistry::new()));
        let info = dispatcher
            .dispatch(&handlers(&parts), Hook::Run, HookArgs::None, &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(info.len(), 2);
        assert_eq!(info["b"], vec![Info::RunProgress { steps: 1 }]);

        let skipped = dispatcher
            .dispatch(&handlers(&parts), Hook::Pause, HookArgs::None, &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(skipped.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn first_failure_cancels_siblings() {
        let parts = [sleeper("broken", 1, true), sleeper("slow", 100, false)];
        let dispatcher = HookDispatcher::new("SCAN", Arc::new(BlockRegistry::new()));
        let scope = CancellationToken::new();
        let err = dispatcher
            .dispatch(&handlers(&parts), Hook::Run, HookArgs::None, &scope, None)
            .await
            .unwrap_err();
        assert_eq!(err, ScanError::device("broken", "motor fault"));
        assert!(parts[1].cancelled.load(Ordering::SeqCst));
        assert!(!scope.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_scope_reports_aborted() {
        let parts = [sleeper("slow", 100, false)];
        let dispatcher = HookDispatcher::new("SCAN", Arc::new(BlockRegistry::new()));
        let scope = CancellationToken::new();
        let canceller = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let err = dispatcher
            .dispatch(&handlers(&parts), Hook::Run, HookArgs::None, &scope, None)
            .await
            .unwrap_err();
        assert!(err.is_aborted());
    }
}
