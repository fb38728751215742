//! Parts and explicit hook registration
//!
//! A part never relies on reflection to advertise its hooks. When it is added to a
//! controller its [`Part::setup`] runs once and registers a handler per hook on a
//! [`PartRegistrar`]. The controller keeps the resulting `hook → handler` table and
//! the dispatcher looks handlers up by hook.
//!
//! ```rust,ignore
//! impl Part for MyPart {
//!     fn name(&self) -> &str { &self.name }
//!
//!     fn setup(self: Arc<Self>, registrar: &mut PartRegistrar) {
//!         registrar.hook(Hook::Configure, &self, |part, ctx, call| async move {
//!             part.configure(&ctx, call.configure()?).await
//!         });
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::Context;
use crate::error::ScanResult;
use crate::hooks::{Hook, HookCall};
use crate::info::Info;

/// Future returned by a registered hook handler.
pub type HookFuture = BoxFuture<'static, ScanResult<Vec<Info>>>;

/// Type-erased hook handler.
pub type HookHandler = Arc<dyn Fn(Arc<Context>, HookCall) -> HookFuture + Send + Sync>;

/// A participant in a scan.
pub trait Part: Send + Sync + 'static {
    /// Unique name within the controller
    fn name(&self) -> &str;

    /// Block this part drives, if any
    fn mri(&self) -> Option<&str> {
        None
    }

    /// Register hook handlers.
    fn setup(self: Arc<Self>, registrar: &mut PartRegistrar);
}

/// Collects the hook handlers of one part.
pub struct PartRegistrar {
    part: String,
    handlers: BTreeMap<Hook, HookHandler>,
}

impl PartRegistrar {
    /// Registrar for the named part.
    pub fn new(part: impl Into<String>) -> Self {
        Self {
            part: part.into(),
            handlers: BTreeMap::new(),
        }
    }

    /// Register `handler` for `hook`, replacing any earlier registration.
    pub fn hook<P, F, Fut>(&mut self, hook: Hook, part: &Arc<P>, handler: F)
    where
        P: Send + Sync + 'static + ?Sized,
        F: Fn(Arc<P>, Arc<Context>, HookCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ScanResult<Vec<Info>>> + Send + 'static,
    {
        let part = Arc::clone(part);
        let handler: HookHandler = Arc::new(move |ctx, call| Box::pin(handler(part.clone(), ctx, call)));
        if self.handlers.insert(hook, handler).is_some() {
            tracing::warn!(part = %self.part, %hook, "Replaced existing hook handler");
        }
    }

    /// Register the same handler for several hooks.
    pub fn hooks<P, F, Fut>(&mut self, hooks: &[Hook], part: &Arc<P>, handler: F)
    where
        P: Send + Sync + 'static + ?Sized,
        F: Fn(Arc<P>, Arc<Context>, HookCall) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ScanResult<Vec<Info>>> + Send + 'static,
    {
        for hook in hooks {
            self.hook(*hook, part, handler.clone());
        }
    }

    /// Finish registration.
    pub fn finish(self) -> PartHandlers {
        PartHandlers {
            name: self.part,
            handlers: self.handlers,
        }
    }
}

/// Registered handlers of one part.
pub struct PartHandlers {
    name: String,
    handlers: BTreeMap<Hook, HookHandler>,
}

impl PartHandlers {
    /// Run `setup` on a part and collect its handlers.
    pub fn register<P: Part>(part: Arc<P>) -> Self {
        let mut registrar = PartRegistrar::new(part.name());
        part.setup(&mut registrar);
        registrar.finish()
    }

    /// Part name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handler for `hook`, if the part registered one
    pub fn handler(&self, hook: Hook) -> Option<HookHandler> {
        self.handlers.get(&hook).cloned()
    }

    /// Hooks the part takes part in
    pub fn hooks(&self) -> impl Iterator<Item = Hook> + '_ {
        self.handlers.keys().copied()
    }
}

impl std::fmt::Debug for PartHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartHandlers")
            .field("name", &self.name)
            .field("hooks", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockRegistry;
    use crate::hooks::HookArgs;
    use tokio_util::sync::CancellationToken;

    struct Echo {
        name: String,
    }

    impl Part for Echo {
        fn name(&self) -> &str {
            &self.name
        }

        fn setup(self: Arc<Self>, registrar: &mut PartRegistrar) {
            registrar.hooks(&[Hook::Pause, Hook::Abort], &self, |part, _ctx, call| async move {
                Ok(vec![Info::Exportable {
                    field: format!("{}:{}", part.name, call.hook),
                }])
            });
        }
    }

    #[tokio::test]
    async fn registered_hooks_are_callable() {
        let handlers = PartHandlers::register(Arc::new(Echo { name: "echo".into() }));
        assert_eq!(handlers.hooks().collect::<Vec<_>>(), vec![Hook::Pause, Hook::Abort]);
        assert!(handlers.handler(Hook::Run).is_none());

        let ctx = Arc::new(Context::new(
            Arc::new(BlockRegistry::new()),
            CancellationToken::new(),
            "echo",
        ));
        let handler = handlers.handler(Hook::Abort).unwrap();
        let infos = handler(
            ctx,
            HookCall {
                hook: Hook::Abort,
                args: Arc::new(HookArgs::None),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            infos,
            vec![Info::Exportable {
                field: "echo:Abort".into()
            }]
        );
    }
}
