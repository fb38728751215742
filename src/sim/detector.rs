//! Simulated area detector driver.
//!
//! `start` acquires `numImages` frames, one per `acquirePeriod`, numbering them
//! from `arrayCounter + 1`. Each frame id is published on `uniqueId`, which
//! downstream plugins and the file writer follow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::block::{AttributeMeta, Block, BlockView, BlockViewExt};
use crate::error::ScanResult;

async fn acquire(block: Arc<Block>, generation: Arc<AtomicU64>) -> ScanResult<Value> {
    let this_run = generation.fetch_add(1, Ordering::SeqCst) + 1;
    let frames: u64 = block.get("numImages")?;
    let period: f64 = block.get("acquirePeriod")?;
    let mut counter: i64 = block.get("arrayCounterReadback")?;
    block.set("acquiring", json!(true))?;
    debug!(mri = block.mri(), frames, period, first = counter + 1, "Acquisition started");

    let mut acquired = 0u64;
    while acquired < frames {
        tokio::time::sleep(Duration::from_secs_f64(period.max(0.0))).await;
        if generation.load(Ordering::SeqCst) != this_run {
            return Ok(json!({ "acquired": acquired, "stopped": true }));
        }
        counter += 1;
        acquired += 1;
        block.squashed(|changes| {
            changes.set("arrayCounterReadback", json!(counter))?;
            changes.set("uniqueId", json!(counter))
        })?;
    }
    block.set("acquiring", json!(false))?;
    Ok(json!({ "acquired": acquired, "stopped": false }))
}

/// Detector driver block with the given readout time.
pub fn detector_block(mri: &str, readout_time: f64) -> Arc<Block> {
    let generation = Arc::new(AtomicU64::new(0));
    let g = generation.clone();
    Block::builder(mri)
        .attribute("numImages", json!(1), AttributeMeta::new("Frames per acquisition").writeable())
        .attribute("exposure", json!(0.1), AttributeMeta::new("Exposure time").config())
        .attribute("acquirePeriod", json!(0.1), AttributeMeta::new("Time between frames").config())
        .attribute("imageMode", json!("Multiple"), AttributeMeta::new("Image mode").config())
        .attribute("arrayCallbacks", json!(true), AttributeMeta::new("Publish arrays").writeable())
        .attribute("readoutTime", json!(readout_time), AttributeMeta::new("Dead time between exposures"))
        .attribute("acquiring", json!(false), AttributeMeta::new("Acquisition in progress"))
        .attribute("arrayCounterReadback", json!(0), AttributeMeta::new("Frames acquired"))
        .attribute("uniqueId", json!(0), AttributeMeta::new("Id of the last frame"))
        .attribute_with_put(
            "arrayCounter",
            json!(0),
            AttributeMeta::new("Frame counter"),
            |block, value| async move {
                block.squashed(|changes| {
                    changes.set("arrayCounter", value.clone())?;
                    changes.set("arrayCounterReadback", value)
                })
            },
        )
        .method("start", "Acquire numImages frames", move |block, _args| {
            acquire(block, g.clone())
        })
        .method("stop", "Stop acquiring", move |block, _args| {
            let generation = generation.clone();
            async move {
                generation.fetch_add(1, Ordering::SeqCst);
                block.set("acquiring", json!(false))?;
                Ok(Value::Null)
            }
        })
        .build()
}
