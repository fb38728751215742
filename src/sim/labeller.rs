//! Simulated position labeller plugin.
//!
//! Positions arrive as XML chunks written to `xml`; each frame consumes one. The
//! queue length `qty` is derived from the frame ids seen since `idStart`. A frame
//! with no position left to label fails the `start` call.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::block::{AttributeMeta, Block, BlockView, BlockViewExt};
use crate::error::{ScanError, ScanResult};

#[derive(Debug, Default)]
struct Queue {
    loaded: u64,
    consumed: u64,
}

fn publish(block: &Block, queue: &Queue) -> ScanResult<()> {
    block.squashed(|changes| {
        changes.set("qty", json!(queue.loaded - queue.consumed))?;
        changes.set("loaded", json!(queue.loaded))
    })
}

async fn follow(block: Arc<Block>, source: Arc<Block>, queue: Arc<Mutex<Queue>>) -> ScanResult<Value> {
    let mut frames = source.subscribe("uniqueId")?;
    frames.borrow_and_update();
    let mut running = block.subscribe("running")?;
    block.set("running", json!(true))?;
    running.borrow_and_update();
    loop {
        tokio::select! {
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let id = frames.borrow_and_update().value.as_i64().unwrap_or_default();
                let start: i64 = block.get("idStart")?;
                let seen = u64::try_from(id - start + 1).unwrap_or(0);
                let mut q = queue.lock();
                if seen > q.loaded {
                    block.set("running", json!(false))?;
                    return Err(ScanError::device(block.mri(), format!("no position left for frame {id}")));
                }
                q.consumed = seen;
                publish(&block, &q)?;
            }
            changed = running.changed() => {
                if changed.is_err() || running.borrow_and_update().value != json!(true) {
                    break;
                }
            }
        }
    }
    Ok(Value::Null)
}

/// Labeller block consuming one position per frame published by `source`.
pub fn position_labeller_block(mri: &str, source: Arc<Block>) -> Arc<Block> {
    let queue = Arc::new(Mutex::new(Queue::default()));
    let q = queue.clone();
    let reset_queue = queue.clone();
    let follow_queue = queue;
    Block::builder(mri)
        .attribute("enableCallbacks", json!(false), AttributeMeta::new("Process arrays").writeable())
        .attribute("idStart", json!(1), AttributeMeta::new("Frame id of the first position").writeable())
        .attribute("qty", json!(0), AttributeMeta::new("Positions still queued"))
        .attribute("loaded", json!(0), AttributeMeta::new("Positions loaded since reset"))
        .attribute("running", json!(false), AttributeMeta::new("Labelling frames"))
        .attribute_with_put(
            "xml",
            json!(""),
            AttributeMeta::new("Position chunk to append"),
            move |block, value| {
                let queue = q.clone();
                async move {
                    let text = value.as_str().unwrap_or_default();
                    let positions = text.matches("<position ").count() as u64;
                    block.set("xml", value.clone())?;
                    let mut q = queue.lock();
                    q.loaded += positions;
                    publish(&block, &q)
                }
            },
        )
        .method("reset", "Clear queued positions", move |block, _args| {
            let queue = reset_queue.clone();
            async move {
                let mut q = queue.lock();
                *q = Queue::default();
                publish(&block, &q)?;
                Ok(Value::Null)
            }
        })
        .method("start", "Label frames until stopped", move |block, _args| {
            follow(block, source.clone(), follow_queue.clone())
        })
        .method("stop", "Stop labelling", |block, _args| async move {
            block.set("running", json!(false))?;
            Ok(Value::Null)
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::detector_block;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn frames_drain_the_queue() {
        let detector = detector_block("DET", 0.0);
        let labeller = position_labeller_block("POS", detector.clone());
        labeller
            .put("xml", json!("<positions><position d0=\"0\" /><position d0=\"1\" /><position d0=\"2\" /></positions>"))
            .await
            .unwrap();
        assert_eq!(labeller.value("qty").unwrap(), json!(3));

        let l = labeller.clone();
        tokio::spawn(async move { l.post("start", json!({})).await });
        tokio::task::yield_now().await;
        detector.put("numImages", json!(2)).await.unwrap();
        detector.post("start", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(labeller.value("qty").unwrap(), json!(1));
        labeller.post("reset", json!({})).await.unwrap();
        assert_eq!(labeller.value("qty").unwrap(), json!(0));
    }

    #[tokio::test(start_paused = true)]
    async fn frame_without_position_fails_labelling() {
        let detector = detector_block("DET", 0.0);
        let labeller = position_labeller_block("POS", detector.clone());
        labeller
            .put("xml", json!("<positions><position d0=\"0\" /></positions>"))
            .await
            .unwrap();

        let l = labeller.clone();
        let labelling = tokio::spawn(async move { l.post("start", json!({})).await });
        tokio::task::yield_now().await;
        detector.put("numImages", json!(2)).await.unwrap();
        detector.post("start", json!({})).await.unwrap();

        let err = labelling.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("frame 2"), "{err}");
        assert_eq!(labeller.value("running").unwrap(), json!(false));
    }
}
