//! Per-invocation capability bundle handed to every hook handler.
//!
//! A [`Context`] gives a part access to block views, attribute waits, sleeps and
//! progress reporting. Every suspension point races the dispatch's cancellation
//! token: once the controller cancels the scope, the pending call returns
//! [`ScanError::Aborted`] and the handler unwinds with `?`.
//!
//! Attribute subscriptions started through a context are aborted when it is dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::block::{AttributeUpdate, BlockRegistry, BlockView};
use crate::error::{ScanError, ScanResult};

/// Receives `(part, completed_steps)` progress reports.
pub type ProgressSink = Arc<dyn Fn(&str, u64) + Send + Sync>;

// =============================================================================
// Block futures
// =============================================================================

/// Result of a method call running in the background.
///
/// The future can be awaited by several waiters and its completion peeked without
/// blocking, which is how the writer checks whether its `start` call already failed.
#[derive(Clone)]
pub struct BlockFuture {
    what: String,
    inner: Shared<BoxFuture<'static, ScanResult<Value>>>,
    abort: AbortHandle,
}

impl BlockFuture {
    /// Spawn `future` and wrap its result.
    pub fn spawn<F>(what: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = ScanResult<Value>> + Send + 'static,
    {
        let what = what.into();
        let handle = tokio::spawn(future);
        let abort = handle.abort_handle();
        let label = what.clone();
        let inner = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(ScanError::Aborted),
                Err(e) => Err(ScanError::device(label, format!("task failed: {e}"))),
            }
        }
        .boxed()
        .shared();
        Self { what, inner, abort }
    }

    /// Future that already resolved to `value`.
    pub fn ready(what: impl Into<String>, value: ScanResult<Value>) -> Self {
        Self::spawn(what, async move { value })
    }

    /// Description used in timeout messages
    pub fn what(&self) -> &str {
        &self.what
    }

    /// Result if the call has finished, without waiting
    pub fn peek(&self) -> Option<ScanResult<Value>> {
        // Nobody may be awaiting the shared future, so poll it once here.
        self.inner.clone().now_or_never()
    }

    /// True once the call has finished
    pub fn is_finished(&self) -> bool {
        self.peek().is_some()
    }

    /// Stop the background call
    pub fn abort(&self) {
        self.abort.abort();
    }

    fn future(&self) -> Shared<BoxFuture<'static, ScanResult<Value>>> {
        self.inner.clone()
    }
}

impl std::fmt::Debug for BlockFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFuture")
            .field("what", &self.what)
            .field("finished", &self.is_finished())
            .finish()
    }
}

// =============================================================================
// Context
// =============================================================================

/// Capability bundle for one hook invocation on one part.
pub struct Context {
    registry: Arc<BlockRegistry>,
    token: CancellationToken,
    part: String,
    progress: Option<ProgressSink>,
    subscriptions: Mutex<Vec<AbortHandle>>,
}

impl Context {
    /// Create a context for `part` bound to the cancellation scope `token`.
    pub fn new(registry: Arc<BlockRegistry>, token: CancellationToken, part: impl Into<String>) -> Self {
        Self {
            registry,
            token,
            part: part.into(),
            progress: None,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Attach a progress sink used by [`Context::update_completed_steps`].
    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Name of the part this context was created for
    pub fn part_name(&self) -> &str {
        &self.part
    }

    /// Cancellation token of the enclosing scope
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Registry of reachable blocks
    pub fn registry(&self) -> &Arc<BlockRegistry> {
        &self.registry
    }

    /// True once the scope has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Return [`ScanError::Aborted`] if the scope has been cancelled.
    pub fn check_cancelled(&self) -> ScanResult<()> {
        if self.token.is_cancelled() {
            Err(ScanError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Resolve a block view by mri.
    pub fn block_view(&self, mri: &str) -> ScanResult<Arc<dyn BlockView>> {
        self.registry.get(mri)
    }

    /// Run `future` unless the scope is cancelled first.
    pub async fn cancellable<T>(&self, future: impl Future<Output = ScanResult<T>>) -> ScanResult<T> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ScanError::Aborted),
            result = future => result,
        }
    }

    /// Write an attribute.
    pub async fn put(&self, view: &dyn BlockView, attribute: &str, value: Value) -> ScanResult<()> {
        self.cancellable(view.put(attribute, value)).await
    }

    /// Write several attributes in order.
    pub async fn put_many(&self, view: &dyn BlockView, values: Vec<(&str, Value)>) -> ScanResult<()> {
        for (attribute, value) in values {
            self.put(view, attribute, value).await?;
        }
        Ok(())
    }

    /// Call a method and wait for its result.
    pub async fn post(&self, view: &dyn BlockView, method: &str, args: Value) -> ScanResult<Value> {
        self.cancellable(view.post(method, args)).await
    }

    /// Call a method in the background.
    ///
    /// The call outlives this context; parts stop long-running device work from their
    /// `Pause`/`Abort` handlers.
    pub fn post_async(&self, view: Arc<dyn BlockView>, method: &str, args: Value) -> BlockFuture {
        let method = method.to_string();
        let what = format!("{}.{}", view.mri(), method);
        BlockFuture::spawn(what, async move { view.post(&method, args).await })
    }

    /// Wait for a background call.
    pub async fn wait(&self, future: &BlockFuture) -> ScanResult<Value> {
        self.cancellable(future.future()).await
    }

    /// Wait until `predicate` holds for an attribute, returning the matching value.
    ///
    /// `event_timeout` bounds the time between successive updates, not the total wait.
    pub async fn wait_value<P>(
        &self,
        view: &dyn BlockView,
        attribute: &str,
        mut predicate: P,
        event_timeout: Option<Duration>,
    ) -> ScanResult<Value>
    where
        P: FnMut(&Value) -> bool,
    {
        let mut rx = view.subscribe(attribute)?;
        loop {
            {
                let update = rx.borrow_and_update();
                if predicate(&update.value) {
                    return Ok(update.value.clone());
                }
            }
            let changed = rx.changed();
            let changed = async {
                match event_timeout {
                    Some(timeout) => match tokio::time::timeout(timeout, changed).await {
                        Ok(result) => Ok(result),
                        Err(_) => Err(ScanError::FrameTimeout {
                            what: format!("{}.{}", view.mri(), attribute),
                            seconds: timeout.as_secs_f64(),
                        }),
                    },
                    None => Ok(changed.await),
                }
            };
            match self.cancellable(changed).await? {
                Ok(()) => continue,
                Err(_) => {
                    return Err(ScanError::device(
                        view.mri(),
                        format!("attribute '{attribute}' closed"),
                    ))
                }
            }
        }
    }

    /// Resolve in the background once `predicate` holds for an attribute.
    ///
    /// The subscription starts now, so updates made after this call are never missed.
    pub fn when_value<P>(&self, view: &dyn BlockView, attribute: &str, mut predicate: P) -> ScanResult<BlockFuture>
    where
        P: FnMut(&Value) -> bool + Send + 'static,
    {
        let mut rx = view.subscribe(attribute)?;
        let mri = view.mri().to_string();
        let attribute = attribute.to_string();
        let what = format!("{mri}.{attribute}");
        Ok(BlockFuture::spawn(what, async move {
            loop {
                {
                    let update = rx.borrow_and_update();
                    if predicate(&update.value) {
                        return Ok(update.value.clone());
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(ScanError::device(mri, format!("attribute '{attribute}' closed")));
                }
            }
        }))
    }

    /// Wait until an attribute equals `expected`.
    pub async fn wait_equal(
        &self,
        view: &dyn BlockView,
        attribute: &str,
        expected: Value,
        event_timeout: Option<Duration>,
    ) -> ScanResult<Value> {
        self.wait_value(view, attribute, |v| *v == expected, event_timeout)
            .await
    }

    /// Wait for every future, failing on the first error.
    ///
    /// With an `event_timeout` the wait fails if no future completes within that
    /// interval of the previous completion.
    pub async fn wait_all(
        &self,
        futures: &[BlockFuture],
        event_timeout: Option<Duration>,
    ) -> ScanResult<Vec<Value>> {
        let mut results: Vec<Option<Value>> = vec![None; futures.len()];
        let mut pending: FuturesUnordered<_> = futures
            .iter()
            .enumerate()
            .map(|(i, f)| f.future().map(move |r| (i, r)))
            .collect();

        while !pending.is_empty() {
            let next = async {
                match event_timeout {
                    Some(timeout) => tokio::time::timeout(timeout, pending.next())
                        .await
                        .map_err(|_| ScanError::FrameTimeout {
                            what: describe(futures),
                            seconds: timeout.as_secs_f64(),
                        }),
                    None => Ok(pending.next().await),
                }
            };
            match self.cancellable(next).await? {
                Some((i, result)) => results[i] = Some(result?),
                None => break,
            }
        }
        Ok(results.into_iter().map(|r| r.unwrap_or(Value::Null)).collect())
    }

    /// Sleep unless cancelled.
    pub async fn sleep(&self, duration: Duration) -> ScanResult<()> {
        self.cancellable(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    /// Deliver every update of an attribute to `callback`, starting with the current value.
    ///
    /// Callbacks for one subscription run one at a time. The subscription ends when the
    /// context is dropped or its scope is cancelled.
    pub fn subscribe_value<F>(&self, view: &dyn BlockView, attribute: &str, mut callback: F) -> ScanResult<()>
    where
        F: FnMut(AttributeUpdate) + Send + 'static,
    {
        let mut rx = view.subscribe(attribute)?;
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            loop {
                let update = rx.borrow_and_update().clone();
                callback(update);
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        self.subscriptions.lock().push(handle.abort_handle());
        Ok(())
    }

    /// Stop every subscription made through this context.
    pub fn unsubscribe_all(&self) {
        for handle in self.subscriptions.lock().drain(..) {
            handle.abort();
        }
    }

    /// Report how many steps this part has completed.
    pub fn update_completed_steps(&self, steps: u64) {
        if let Some(sink) = &self.progress {
            sink(&self.part, steps);
        }
    }

    /// Progress sink, for parts that report from spawned callbacks.
    pub fn progress_sink(&self) -> Option<ProgressSink> {
        self.progress.clone()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("part", &self.part)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

fn describe(futures: &[BlockFuture]) -> String {
    futures
        .iter()
        .filter(|f| !f.is_finished())
        .map(BlockFuture::what)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{AttributeMeta, Block};
    use serde_json::json;

    fn setup() -> (Arc<BlockRegistry>, Arc<Block>) {
        let registry = Arc::new(BlockRegistry::new());
        let block = Block::builder("DEV")
            .attribute("counter", json!(0), AttributeMeta::new("counter").writeable())
            .method("slow", "sleeps then returns", |_block, args| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(args)
            })
            .method("fail", "always fails", |block, _args| async move {
                Err(ScanError::device(block.mri(), "broken"))
            })
            .build();
        registry.register(block.clone()).unwrap();
        (registry, block)
    }

    #[tokio::test(start_paused = true)]
    async fn wait_value_resolves_on_match() {
        let (registry, block) = setup();
        let ctx = Context::new(registry, CancellationToken::new(), "part");
        let setter = block.clone();
        tokio::spawn(async move {
            for i in 1..=3 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                setter.set("counter", json!(i)).unwrap();
            }
        });
        let value = ctx
            .wait_value(block.as_ref(), "counter", |v| v.as_i64() >= Some(3), None)
            .await
            .unwrap();
        assert_eq!(value, json!(3));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_value_times_out_between_events() {
        let (registry, block) = setup();
        let ctx = Context::new(registry, CancellationToken::new(), "part");
        let err = ctx
            .wait_equal(block.as_ref(), "counter", json!(1), Some(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::FrameTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn when_value_resolves_in_the_background() {
        let (registry, block) = setup();
        let ctx = Context::new(registry, CancellationToken::new(), "part");
        let first = ctx
            .when_value(block.as_ref(), "counter", |v| v.as_i64() > Some(1))
            .unwrap();
        block.set("counter", json!(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!first.is_finished());
        block.set("counter", json!(5)).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(matches!(first.peek(), Some(Ok(_))));
        assert_eq!(ctx.wait(&first).await.unwrap(), json!(5));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_yields_aborted() {
        let (registry, block) = setup();
        let token = CancellationToken::new();
        let ctx = Context::new(registry, token.clone(), "part");
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let err = ctx
            .post(block.as_ref(), "slow", json!({}))
            .await
            .unwrap_err();
        assert!(err.is_aborted());
        assert!(ctx.check_cancelled().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_all_collects_in_order_and_surfaces_errors() {
        let (registry, block) = setup();
        let ctx = Context::new(registry, CancellationToken::new(), "part");
        let a = ctx.post_async(block.clone(), "slow", json!(1));
        let b = ctx.post_async(block.clone(), "slow", json!(2));
        let values = ctx.wait_all(&[a, b], None).await.unwrap();
        assert_eq!(values, vec![json!(1), json!(2)]);

        let failing = ctx.post_async(block.clone(), "fail", json!({}));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(matches!(failing.peek(), Some(Err(_))));
        let err = ctx.wait_all(&[failing.clone()], None).await.unwrap_err();
        assert!(matches!(err, ScanError::Device { .. }));
        assert!(matches!(failing.peek(), Some(Err(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_deliver_updates_and_end_on_drop() {
        let (registry, block) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ctx = Context::new(registry, CancellationToken::new(), "part");
        let sink = seen.clone();
        ctx.subscribe_value(block.as_ref(), "counter", move |u| sink.lock().push(u.value))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        block.set("counter", json!(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        drop(ctx);
        tokio::time::sleep(Duration::from_millis(1)).await;
        block.set("counter", json!(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(*seen.lock(), vec![json!(0), json!(1)]);
    }

    #[test]
    fn progress_is_forwarded_with_part_name() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink_reports = reports.clone();
        let ctx = Context::new(Arc::new(BlockRegistry::new()), CancellationToken::new(), "det")
            .with_progress(Arc::new(move |part, n| sink_reports.lock().push((part.to_string(), n))));
        ctx.update_completed_steps(4);
        assert_eq!(*reports.lock(), vec![("det".to_string(), 4)]);
    }
}
