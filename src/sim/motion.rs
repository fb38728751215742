//! Simulated motion controller executing profile rows against the clock.
//!
//! Built rows are kept in a buffer; `executeProfile` walks it row by row, sleeping
//! for each row time and publishing `pointsScanned`. Rows appended while the
//! profile executes are picked up as long as the buffer has not run dry.
//! Setting `stalled` holds execution at the current row.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use crate::block::{AttributeMeta, Block, BlockView, BlockViewExt};
use crate::error::{ScanError, ScanResult};
use crate::info::CS_AXIS_NAMES;
use crate::trajectory::TICK_S;

#[derive(Debug, Default)]
struct Buffer {
    times: Vec<u32>,
    executing: bool,
    abort: bool,
}

fn take_rows(block: &Block, buffer: &Mutex<Buffer>, append: bool) -> ScanResult<Value> {
    let n: usize = block.get("pointsToBuild")?;
    let times: Vec<u32> = block.get("timeArray")?;
    let modes: Vec<u8> = block.get("velocityMode")?;
    let programs: Vec<u8> = block.get("userPrograms")?;
    if times.len() < n || modes.len() < n || programs.len() < n {
        return Err(ScanError::device(
            block.mri(),
            format!("pointsToBuild {n} exceeds the profile arrays"),
        ));
    }
    for axis in CS_AXIS_NAMES {
        if block.get::<bool>(&format!("use{axis}"))? {
            let positions: Vec<f64> = block.get(&format!("positions{axis}"))?;
            if positions.len() < n {
                return Err(ScanError::device(
                    block.mri(),
                    format!("positions{axis} has {} rows, expected {n}", positions.len()),
                ));
            }
        }
    }
    if let Some(row) = times[..n].iter().position(|&t| t == 0) {
        return Err(ScanError::device(block.mri(), format!("row {row} has zero time")));
    }

    let mut buffer = buffer.lock();
    if append {
        buffer.times.extend_from_slice(&times[..n]);
    } else {
        if buffer.executing {
            return Err(ScanError::device(block.mri(), "cannot build while executing"));
        }
        buffer.times = times[..n].to_vec();
        buffer.abort = false;
        block.set("pointsScanned", json!(0))?;
    }
    let built = buffer.times.len();
    block.set("pointsBuilt", json!(built))?;
    debug!(mri = block.mri(), rows = n, built, append, "Profile rows loaded");
    Ok(json!({ "pointsBuilt": built }))
}

const STALL_POLL: Duration = Duration::from_millis(100);

async fn execute(block: Arc<Block>, buffer: Arc<Mutex<Buffer>>) -> ScanResult<Value> {
    buffer.lock().executing = true;
    let mut row = block.get::<usize>("pointsScanned")?;
    let result = loop {
        let ticks = {
            let mut buf = buffer.lock();
            if buf.abort {
                buf.abort = false;
                break Err(ScanError::device(block.mri(), "profile aborted"));
            }
            match buf.times.get(row) {
                Some(&ticks) => ticks,
                None => break Ok(json!({ "pointsScanned": row })),
            }
        };
        if block.get::<bool>("stalled")? {
            tokio::time::sleep(STALL_POLL).await;
            continue;
        }
        tokio::time::sleep(Duration::from_secs_f64(f64::from(ticks) * TICK_S)).await;
        row += 1;
        block.set("pointsScanned", json!(row))?;
    };
    buffer.lock().executing = false;
    result
}

/// Motion controller block for coordinate system `cs_port`.
pub fn motion_controller_block(mri: &str, cs_port: &str) -> Arc<Block> {
    let buffer = Arc::new(Mutex::new(Buffer::default()));
    let mut builder = Block::builder(mri)
        .attribute("cs", json!(cs_port), AttributeMeta::new("Coordinate system port"))
        .attribute("timeArray", json!([]), AttributeMeta::new("Row times in ticks").writeable())
        .attribute("velocityMode", json!([]), AttributeMeta::new("Velocity mode per row").writeable())
        .attribute("userPrograms", json!([]), AttributeMeta::new("User program per row").writeable())
        .attribute("numPoints", json!(0), AttributeMeta::new("Rows in the whole profile").writeable())
        .attribute("pointsToBuild", json!(0), AttributeMeta::new("Rows in this build").writeable())
        .attribute("pointsBuilt", json!(0), AttributeMeta::new("Rows held in the buffer"))
        .attribute("pointsScanned", json!(0), AttributeMeta::new("Rows executed"))
        .attribute("moveTime", json!(0.0), AttributeMeta::new("Time of the last CS move"))
        .attribute("stalled", json!(false), AttributeMeta::new("Hold execution at the current row").writeable());
    for axis in CS_AXIS_NAMES {
        builder = builder
            .attribute(&format!("use{axis}"), json!(false), AttributeMeta::new("Axis in profile").writeable())
            .attribute(&format!("positions{axis}"), json!([]), AttributeMeta::new("Demand per row").writeable())
            .attribute(&format!("resolution{axis}"), json!(1.0), AttributeMeta::new("EGU per count").writeable())
            .attribute(&format!("offset{axis}"), json!(0.0), AttributeMeta::new("EGU offset").writeable())
            .attribute(&format!("demand{axis}"), json!(0.0), AttributeMeta::new("Last CS demand"));
    }

    let b = buffer.clone();
    builder = builder.method("buildProfile", "Replace the profile buffer", move |block, _args| {
        let buffer = b.clone();
        async move { take_rows(&block, &buffer, false) }
    });
    let b = buffer.clone();
    builder = builder.method("appendProfile", "Append rows to the profile buffer", move |block, _args| {
        let buffer = b.clone();
        async move { take_rows(&block, &buffer, true) }
    });
    let b = buffer.clone();
    builder = builder.method("executeProfile", "Run the buffered rows", move |block, _args| {
        execute(block, b.clone())
    });
    let b = buffer;
    builder = builder.method("abortProfile", "Stop the executing profile", move |_block, _args| {
        let buffer = b.clone();
        async move {
            let mut buf = buffer.lock();
            if buf.executing {
                buf.abort = true;
            }
            Ok(Value::Null)
        }
    });
    builder = builder.method("moveCS", "Move CS axes to the given demands", |block, args| async move {
        let move_time = args.get("moveTime").and_then(Value::as_f64).unwrap_or(0.0);
        tokio::time::sleep(Duration::from_secs_f64(move_time.max(0.0))).await;
        for axis in CS_AXIS_NAMES {
            if let Some(demand) = args.get(axis) {
                block.set(&format!("demand{axis}"), demand.clone())?;
            }
        }
        block.set("moveTime", json!(move_time))?;
        Ok(Value::Null)
    });
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn load(block: &Block, times: Vec<u32>) {
        let n = times.len();
        block.put("useA", json!(true)).await.unwrap();
        block.put("positionsA", json!(vec![0.0; n])).await.unwrap();
        block.put("velocityMode", json!(vec![0; n])).await.unwrap();
        block.put("userPrograms", json!(vec![0; n])).await.unwrap();
        block.put("timeArray", json!(times)).await.unwrap();
        block.put("pointsToBuild", json!(n)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn executes_built_and_appended_rows() {
        let block = motion_controller_block("PMAC", "CS1");
        load(&block, vec![4000, 4000]).await;
        block.post("buildProfile", json!({})).await.unwrap();
        load(&block, vec![2000]).await;
        block.post("appendProfile", json!({})).await.unwrap();
        assert_eq!(block.value("pointsBuilt").unwrap(), json!(3));

        let start = tokio::time::Instant::now();
        let result = block.post("executeProfile", json!({})).await.unwrap();
        assert_eq!(result["pointsScanned"], json!(3));
        assert_eq!(start.elapsed(), Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_execution() {
        let block = motion_controller_block("PMAC", "CS1");
        load(&block, vec![40_000; 10]).await;
        block.post("buildProfile", json!({})).await.unwrap();

        let runner = block.clone();
        let task = tokio::spawn(async move { runner.post("executeProfile", json!({})).await });
        tokio::time::sleep(Duration::from_secs(25)).await;
        block.post("abortProfile", json!({})).await.unwrap();
        assert!(task.await.unwrap().is_err());
        assert!(block.get::<u64>("pointsScanned").unwrap() < 10);
    }

    #[tokio::test]
    async fn short_position_arrays_are_rejected() {
        let block = motion_controller_block("PMAC", "CS1");
        load(&block, vec![1, 1, 1]).await;
        block.put("positionsA", json!([0.0])).await.unwrap();
        assert!(block.post("buildProfile", json!({})).await.is_err());
    }
}
