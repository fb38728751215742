//! Simulated HDF5 file writer plugin.
//!
//! While capturing, every frame id published on the source's `uniqueId` is
//! "written": the writer copies it to its own `uniqueId` and counts it. Setting
//! `stalled` makes the writer drop frames, and setting `diskFull` makes capture
//! fail on the next frame.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::block::{AttributeMeta, Block, BlockView, BlockViewExt};
use crate::error::{ScanError, ScanResult};
use crate::writer::DIM_SUFFIXES;

fn full_file_name(block: &Block) -> ScanResult<String> {
    let template: String = block.get("fileTemplate")?;
    let path: String = block.get("filePath")?;
    let name: String = block.get("fileName")?;
    Ok(template.replacen("%s", &path, 1).replacen("%s", &name, 1))
}

async fn capture(block: Arc<Block>, source: Arc<Block>) -> ScanResult<Value> {
    let mut frames = source.subscribe("uniqueId")?;
    frames.borrow_and_update();
    let mut running = block.subscribe("running")?;
    let file = full_file_name(&block)?;
    block.squashed(|changes| {
        changes.set("running", json!(true))?;
        changes.set("numCaptured", json!(0))?;
        changes.set("fullFileName", json!(file))
    })?;
    running.borrow_and_update();
    debug!(mri = block.mri(), file = %file, "Capture started");

    let mut captured = 0u64;
    loop {
        tokio::select! {
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let id = frames.borrow_and_update().value.clone();
                if block.get::<bool>("diskFull")? {
                    block.set("running", json!(false))?;
                    return Err(ScanError::device(block.mri(), format!("disk full after {captured} frames")));
                }
                if block.get::<bool>("stalled")? {
                    continue;
                }
                captured += 1;
                let written: i64 = block.get("arrayCounterReadback")?;
                block.squashed(|changes| {
                    changes.set("uniqueId", id)?;
                    changes.set("numCaptured", json!(captured))?;
                    changes.set("arrayCounterReadback", json!(written + 1))
                })?;
                let limit: u64 = block.get("numCapture")?;
                if limit > 0 && captured >= limit {
                    block.set("running", json!(false))?;
                    break;
                }
            }
            changed = running.changed() => {
                if changed.is_err() || running.borrow_and_update().value != json!(true) {
                    break;
                }
            }
        }
    }
    debug!(mri = block.mri(), captured, "Capture finished");
    Ok(json!({ "numCaptured": captured }))
}

/// Writer block capturing frames published by `source`.
pub fn hdf_writer_block(mri: &str, source: Arc<Block>) -> Arc<Block> {
    let mut builder = Block::builder(mri);
    for (name, initial) in [
        ("enableCallbacks", json!(false)),
        ("fileWriteMode", json!("Single")),
        ("swmrMode", json!(false)),
        ("storeAttr", json!(false)),
        ("dimAttDatasets", json!(false)),
        ("lazyOpen", json!(false)),
        ("positionMode", json!(false)),
        ("filePath", json!("")),
        ("fileName", json!("")),
        ("fileTemplate", json!("%s%s")),
        ("numCapture", json!(0)),
        ("flushDataPerNFrames", json!(1)),
        ("flushAttrPerNFrames", json!(1)),
        ("xmlLayout", json!("")),
        ("numExtraDims", json!(0)),
        ("stalled", json!(false)),
        ("diskFull", json!(false)),
    ] {
        builder = builder.attribute(name, initial, AttributeMeta::new(name).writeable());
    }
    for suffix in DIM_SUFFIXES {
        builder = builder
            .attribute(&format!("posNameDim{suffix}"), json!(""), AttributeMeta::new("Position dimension name").writeable())
            .attribute(&format!("extraDimSize{suffix}"), json!(1), AttributeMeta::new("Position dimension size").writeable());
    }
    builder
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
        .attribute("arrayCounterReadback", json!(0), AttributeMeta::new("Frames received"))
        .attribute("uniqueId", json!(0), AttributeMeta::new("Id of the last frame written"))
        .attribute("numCaptured", json!(0), AttributeMeta::new("Frames written to the file"))
        .attribute("fullFileName", json!(""), AttributeMeta::new("File being written"))
        .attribute("flushCount", json!(0), AttributeMeta::new("Flushes requested"))
        .attribute("running", json!(false), AttributeMeta::new("Capture in progress"))
        .method("start", "Open the file and capture frames", move |block, _args| {
            capture(block, source.clone())
        })
        .method("stop", "Stop capturing and close the file", |block, _args| async move {
            block.set("running", json!(false))?;
            Ok(Value::Null)
        })
        .method("flushNow", "Flush buffered frames to disk", |block, _args| async move {
            let count: u64 = block.get("flushCount")?;
            block.set("flushCount", json!(count + 1))?;
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
    async fn captures_frames_until_stopped() {
        let detector = detector_block("DET", 0.0);
        let writer = hdf_writer_block("HDF", detector.clone());
        writer.put("filePath", json!("/data/")).await.unwrap();
        writer.put("fileName", json!("det")).await.unwrap();
        writer.put("fileTemplate", json!("%s%s.h5")).await.unwrap();
        detector.put("numImages", json!(4)).await.unwrap();

        let w = writer.clone();
        let capture = tokio::spawn(async move { w.post("start", json!({})).await });
        tokio::task::yield_now().await;
        detector.post("start", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(writer.value("fullFileName").unwrap(), json!("/data/det.h5"));
        assert_eq!(writer.value("uniqueId").unwrap(), json!(4));
        writer.post("stop", json!({})).await.unwrap();
        let result = capture.await.unwrap().unwrap();
        assert_eq!(result["numCaptured"], json!(4));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_writer_drops_frames() {
        let detector = detector_block("DET", 0.0);
        let writer = hdf_writer_block("HDF", detector.clone());
        writer.put("stalled", json!(true)).await.unwrap();
        writer.put("numCapture", json!(2)).await.unwrap();
        detector.put("numImages", json!(2)).await.unwrap();

        let w = writer.clone();
        tokio::spawn(async move { w.post("start", json!({})).await });
        tokio::task::yield_now().await;
        detector.post("start", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(writer.value("uniqueId").unwrap(), json!(0));
        assert_eq!(writer.value("running").unwrap(), json!(true));
    }

    #[tokio::test(start_paused = true)]
    async fn full_disk_fails_the_capture() {
        let detector = detector_block("DET", 0.0);
        let writer = hdf_writer_block("HDF", detector.clone());
        writer.put("arrayCounter", json!(0)).await.unwrap();
        detector.put("numImages", json!(3)).await.unwrap();

        let w = writer.clone();
        let capture = tokio::spawn(async move { w.post("start", json!({})).await });
        tokio::task::yield_now().await;
        writer.put("diskFull", json!(true)).await.unwrap();
        detector.post("start", json!({})).await.unwrap();

        let err = capture.await.unwrap().unwrap_err();
        assert!(matches!(err, ScanError::Device { .. }));
        assert_eq!(writer.value("running").unwrap(), json!(false));
        assert_eq!(writer.value("arrayCounterReadback").unwrap(), json!(0));
    }
}
