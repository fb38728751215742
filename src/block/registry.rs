//! Block Registry
//!
//! Central lookup of block views by mri. Parts resolve their device through the
//! registry held by their [`Context`](crate::context::Context); nothing else keeps
//! references between blocks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::BlockView;
use crate::error::{ScanError, ScanResult};

/// Registry of every block reachable by a controller and its parts.
#[derive(Default)]
pub struct BlockRegistry {
    blocks: RwLock<HashMap<String, Arc<dyn BlockView>>>,
}

impl BlockRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block under its own mri
    ///
    /// # Errors
    /// Returns [`ScanError::Configuration`] if the mri is already registered.
    pub fn register(&self, block: Arc<dyn BlockView>) -> ScanResult<()> {
        let mri = block.mri().to_string();
        let mut blocks = self.blocks.write();
        if blocks.contains_key(&mri) {
            return Err(ScanError::Configuration(format!(
                "Block '{mri}' is already registered"
            )));
        }
        tracing::debug!(mri = %mri, "Registered block");
        blocks.insert(mri, block);
        Ok(())
    }

    /// Remove a block, returning true if it was present
    pub fn unregister(&self, mri: &str) -> bool {
        self.blocks.write().remove(mri).is_some()
    }

    /// Look up a block view
    pub fn get(&self, mri: &str) -> ScanResult<Arc<dyn BlockView>> {
        self.blocks
            .read()
            .get(mri)
            .cloned()
            .ok_or_else(|| ScanError::UnknownBlock(mri.to_string()))
    }

    /// Sorted list of registered mris
    pub fn list_mris(&self) -> Vec<String> {
        let mut mris: Vec<String> = self.blocks.read().keys().cloned().collect();
        mris.sort();
        mris
    }

    /// Check if a block is registered
    pub fn contains(&self, mri: &str) -> bool {
        self.blocks.read().contains_key(mri)
    }

    /// Number of registered blocks
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl std::fmt::Debug for BlockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRegistry")
            .field("blocks", &self.list_mris())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{AttributeMeta, Block};
    use serde_json::json;

    fn block(mri: &str) -> Arc<Block> {
        Block::builder(mri)
            .attribute("value", json!(1), AttributeMeta::new("value"))
            .build()
    }

    #[test]
    fn register_and_lookup() {
        let registry = BlockRegistry::new();
        assert!(registry.is_empty());
        registry.register(block("B")).unwrap();
        registry.register(block("A")).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.list_mris(), vec!["A", "B"]);
        assert_eq!(registry.get("A").unwrap().value("value").unwrap(), json!(1));
    }

    #[test]
    fn duplicates_and_unknowns_are_errors() {
        let registry = BlockRegistry::new();
        registry.register(block("A")).unwrap();
        assert!(registry.register(block("A")).is_err());
        assert!(matches!(registry.get("Z"), Err(ScanError::UnknownBlock(_))));
        assert!(registry.unregister("A"));
        assert!(!registry.contains("A"));
    }
}
