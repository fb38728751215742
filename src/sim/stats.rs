//! Simulated statistics plugin.

use std::sync::Arc;

use serde_json::json;

use crate::block::{AttributeMeta, Block};

/// Statistics plugin block; it only records how it was configured.
pub fn stats_block(mri: &str) -> Arc<Block> {
    Block::builder(mri)
        .attribute("enableCallbacks", json!(false), AttributeMeta::new("Process arrays").writeable())
        .attribute("computeStatistics", json!(false), AttributeMeta::new("Compute totals").writeable())
        .attribute("attributesFile", json!(""), AttributeMeta::new("NDAttributes XML file").writeable())
        .build()
}
