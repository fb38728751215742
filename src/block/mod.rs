//! Blocks: named attributes plus callable methods
//!
//! A block is the uniform face every subordinate device presents to the scan
//! controller. Parts never hold a block directly; they obtain an
//! `Arc<dyn BlockView>` from their [`Context`](crate::context::Context) and talk to it
//! through four operations:
//!
//! - `value` / `subscribe` read an attribute or follow its updates
//! - `put` writes an attribute (only when its metadata says it is writeable)
//! - `post` invokes a method with a JSON argument map and returns its JSON result
//!
//! [`Block`] is the in-process implementation used by the simulated devices in
//! [`crate::sim`]; the runnable controller publishes itself through the same trait so
//! it can be driven as a child of another controller.
//!
//! # Example
//!
//! ```rust,ignore
//! let block = Block::builder("MOTOR:X")
//!     .attribute("readback", json!(0.0), AttributeMeta::new("Position"))
//!     .attribute("demand", json!(0.0), AttributeMeta::new("Setpoint").writeable())
//!     .build();
//!
//! block.put("demand", json!(2.5)).await?;
//! ```

pub mod attribute;
pub mod registry;

pub use attribute::{Alarm, AlarmSeverity, Attribute, AttributeMeta, AttributeUpdate, CONFIG_TAG};
pub use registry::BlockRegistry;

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{ScanError, ScanResult};

// =============================================================================
// Block View
// =============================================================================

/// Abstract handle on a subordinate device.
#[async_trait]
pub trait BlockView: Send + Sync {
    /// Malcolm resource identifier of the block
    fn mri(&self) -> &str;

    /// Current value of an attribute
    fn value(&self, attribute: &str) -> ScanResult<Value>;

    /// Follow an attribute; the receiver starts at the current value
    fn subscribe(&self, attribute: &str) -> ScanResult<watch::Receiver<AttributeUpdate>>;

    /// Write an attribute
    async fn put(&self, attribute: &str, value: Value) -> ScanResult<()>;

    /// Call a method with a JSON argument map
    async fn post(&self, method: &str, args: Value) -> ScanResult<Value>;
}

/// Typed helpers over any [`BlockView`].
pub trait BlockViewExt: BlockView {
    /// Read an attribute and deserialize it.
    fn get<T: DeserializeOwned>(&self, attribute: &str) -> ScanResult<T> {
        let value = self.value(attribute)?;
        serde_json::from_value(value).map_err(|e| {
            ScanError::device(
                self.mri(),
                format!("attribute '{attribute}' has unexpected type: {e}"),
            )
        })
    }
}

impl<T: BlockView + ?Sized> BlockViewExt for T {}

/// Serialize a value for `put`, mapping failures into the scan error type.
pub fn to_value<T: Serialize>(value: &T) -> ScanResult<Value> {
    Ok(serde_json::to_value(value)?)
}

// =============================================================================
// Methods
// =============================================================================

/// Future returned by a method handler.
pub type MethodFuture = BoxFuture<'static, ScanResult<Value>>;

/// Method implementation: receives the owning block and the argument map.
pub type MethodHandler = Arc<dyn Fn(Arc<Block>, Value) -> MethodFuture + Send + Sync>;

/// Hook run instead of a plain store when a writeable attribute is put.
pub type PutHandler = Arc<dyn Fn(Arc<Block>, Value) -> BoxFuture<'static, ScanResult<()>> + Send + Sync>;

/// Metadata for a block method.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodMeta {
    /// Description shown to users
    pub description: String,
    /// Whether the method may currently be called
    pub writeable: bool,
}

struct Method {
    meta: RwLock<MethodMeta>,
    handler: MethodHandler,
}

// =============================================================================
// Block
// =============================================================================

/// In-process block implementation.
pub struct Block {
    mri: String,
    attributes: BTreeMap<String, Attribute>,
    methods: BTreeMap<String, Method>,
    put_handlers: BTreeMap<String, PutHandler>,
    changes: Mutex<()>,
    self_ref: Weak<Block>,
}

/// Handle passed to [`Block::squashed`] for grouped attribute updates.
pub struct Changes<'a> {
    block: &'a Block,
}

impl Changes<'_> {
    /// Set an attribute as part of the squashed group.
    pub fn set(&self, attribute: &str, value: Value) -> ScanResult<()> {
        self.block.attribute(attribute)?.set(value);
        Ok(())
    }
}

impl Block {
    /// Start building a block.
    pub fn builder(mri: impl Into<String>) -> BlockBuilder {
        BlockBuilder {
            mri: mri.into(),
            attributes: BTreeMap::new(),
            methods: BTreeMap::new(),
            put_handlers: BTreeMap::new(),
        }
    }

    /// Look up an attribute.
    pub fn attribute(&self, name: &str) -> ScanResult<&Attribute> {
        self.attributes
            .get(name)
            .ok_or_else(|| ScanError::UnknownAttribute {
                mri: self.mri.clone(),
                attribute: name.to_string(),
            })
    }

    /// Attribute names in sorted order.
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Set an attribute from the device side, ignoring writeability.
    pub fn set(&self, attribute: &str, value: Value) -> ScanResult<()> {
        let _guard = self.changes.lock();
        self.attribute(attribute)?.set(value);
        Ok(())
    }

    /// Set an attribute along with an alarm.
    pub fn set_with_alarm(&self, attribute: &str, value: Value, alarm: Alarm) -> ScanResult<()> {
        let _guard = self.changes.lock();
        self.attribute(attribute)?.set_with_alarm(value, alarm);
        Ok(())
    }

    /// Apply several attribute changes so that [`Block::snapshot`] sees all or none.
    pub fn squashed<R>(&self, f: impl FnOnce(&Changes<'_>) -> R) -> R {
        let _guard = self.changes.lock();
        f(&Changes { block: self })
    }

    /// Consistent copy of every attribute value.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let _guard = self.changes.lock();
        self.attributes
            .iter()
            .map(|(name, attr)| (name.clone(), attr.value()))
            .collect()
    }

    /// Metadata of a method.
    pub fn method_meta(&self, method: &str) -> ScanResult<MethodMeta> {
        self.method(method).map(|m| m.meta.read().clone())
    }

    /// Change whether a method may be called.
    pub fn set_method_writeable(&self, method: &str, writeable: bool) -> ScanResult<()> {
        self.method(method)?.meta.write().writeable = writeable;
        Ok(())
    }

    fn method(&self, method: &str) -> ScanResult<&Method> {
        self.methods.get(method).ok_or_else(|| ScanError::UnknownMethod {
            mri: self.mri.clone(),
            method: method.to_string(),
        })
    }

    fn arc(&self) -> ScanResult<Arc<Block>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| ScanError::device(&self.mri, "block has been dropped"))
    }
}

#[async_trait]
impl BlockView for Block {
    fn mri(&self) -> &str {
        &self.mri
    }

    fn value(&self, attribute: &str) -> ScanResult<Value> {
        Ok(self.attribute(attribute)?.value())
    }

    fn subscribe(&self, attribute: &str) -> ScanResult<watch::Receiver<AttributeUpdate>> {
        Ok(self.attribute(attribute)?.subscribe())
    }

    async fn put(&self, attribute: &str, value: Value) -> ScanResult<()> {
        let attr = self.attribute(attribute)?;
        if !attr.meta().writeable {
            return Err(ScanError::device(
                &self.mri,
                format!("attribute '{attribute}' is not writeable"),
            ));
        }
        match self.put_handlers.get(attribute) {
            Some(handler) => handler(self.arc()?, value).await,
            None => {
                attr.set(value);
                Ok(())
            }
        }
    }

    async fn post(&self, method: &str, args: Value) -> ScanResult<Value> {
        let entry = self.method(method)?;
        if !entry.meta.read().writeable {
            return Err(ScanError::device(
                &self.mri,
                format!("method '{method}' is not writeable"),
            ));
        }
        let handler = entry.handler.clone();
        handler(self.arc()?, args).await
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("mri", &self.mri)
            .field("attributes", &self.attributes.keys().collect::<Vec<_>>())
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Block`].
pub struct BlockBuilder {
    mri: String,
    attributes: BTreeMap<String, Attribute>,
    methods: BTreeMap<String, Method>,
    put_handlers: BTreeMap<String, PutHandler>,
}

impl BlockBuilder {
    /// Add an attribute.
    pub fn attribute(mut self, name: &str, initial: Value, meta: AttributeMeta) -> Self {
        self.attributes
            .insert(name.to_string(), Attribute::new(name, initial, meta));
        self
    }

    /// Add a writeable attribute whose puts run `handler` instead of storing directly.
    pub fn attribute_with_put<F, Fut>(mut self, name: &str, initial: Value, meta: AttributeMeta, handler: F) -> Self
    where
        F: Fn(Arc<Block>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ScanResult<()>> + Send + 'static,
    {
        self.attributes.insert(
            name.to_string(),
            Attribute::new(name, initial, meta.writeable()),
        );
        self.put_handlers.insert(
            name.to_string(),
            Arc::new(move |block, value| Box::pin(handler(block, value))),
        );
        self
    }

    /// Add a method.
    pub fn method<F, Fut>(mut self, name: &str, description: &str, handler: F) -> Self
    where
        F: Fn(Arc<Block>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ScanResult<Value>> + Send + 'static,
    {
        self.methods.insert(
            name.to_string(),
            Method {
                meta: RwLock::new(MethodMeta {
                    description: description.to_string(),
                    writeable: true,
                }),
                handler: Arc::new(move |block, args| Box::pin(handler(block, args))),
            },
        );
        self
    }

    /// Finish the block.
    pub fn build(self) -> Arc<Block> {
        Arc::new_cyclic(|self_ref| Block {
            mri: self.mri,
            attributes: self.attributes,
            methods: self.methods,
            put_handlers: self.put_handlers,
            changes: Mutex::new(()),
            self_ref: self_ref.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counter_block() -> Arc<Block> {
        Block::builder("COUNTER")
            .attribute("count", json!(0), AttributeMeta::new("Count"))
            .attribute("step", json!(1), AttributeMeta::new("Step").config())
            .attribute_with_put(
                "target",
                json!(0),
                AttributeMeta::new("Target"),
                |block, value| async move { block.set("count", value) },
            )
            .method("increment", "Add step to count", |block, _args| async move {
                let count: i64 = block.get("count")?;
                let step: i64 = block.get("step")?;
                block.set("count", json!(count + step))?;
                Ok(json!(count + step))
            })
            .build()
    }

    #[tokio::test]
    async fn put_respects_writeability() {
        let block = counter_block();
        block.put("step", json!(5)).await.unwrap();
        assert_eq!(block.value("step").unwrap(), json!(5));

        let err = block.put("count", json!(3)).await.unwrap_err();
        assert!(matches!(err, ScanError::Device { .. }));
    }

    #[tokio::test]
    async fn put_handler_replaces_store() {
        let block = counter_block();
        block.put("target", json!(7)).await.unwrap();
        assert_eq!(block.value("count").unwrap(), json!(7));
        assert_eq!(block.value("target").unwrap(), json!(0));
    }

    #[tokio::test]
    async fn post_runs_handler_and_honours_writeable_flag() {
        let block = counter_block();
        assert_eq!(block.post("increment", json!({})).await.unwrap(), json!(1));

        block.set_method_writeable("increment", false).unwrap();
        assert!(block.post("increment", json!({})).await.is_err());
        assert!(matches!(
            block.post("missing", json!({})).await,
            Err(ScanError::UnknownMethod { .. })
        ));
    }

    #[test]
    fn squashed_changes_are_seen_together() {
        let block = counter_block();
        block
            .squashed(|changes| {
                changes.set("count", json!(10))?;
                changes.set("step", json!(2))
            })
            .unwrap();
        let snapshot = block.snapshot();
        assert_eq!(snapshot["count"], json!(10));
        assert_eq!(snapshot["step"], json!(2));
    }

    #[test]
    fn typed_get_reports_type_mismatch() {
        let block = counter_block();
        let result: ScanResult<String> = block.get("count");
        assert!(result.is_err());
    }
}
