//! Profile rows and tick quantisation
//!
//! A profile is a set of parallel arrays programmed into the motion controller: the
//! time of each row in 0.25 ms ticks, how the controller derives the velocity at
//! that row, which user program fires there, and the demand position of every
//! coordinate-system axis in use.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ScanError, ScanResult};

/// Motion controller profile tick in seconds.
pub const TICK_S: f64 = 0.000_25;

/// How the motion controller derives the velocity at a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VelocityMode {
    /// Average of the inbound and outbound segments
    PrevToNext = 0,
    /// Inbound segment only, used before a turnaround
    PrevToCurrent = 1,
    /// Outbound segment only, used at the start of a segment
    CurrentToNext = 2,
    /// Stationary
    Zero = 3,
}

/// User program fired when a row is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum UserProgram {
    /// No trigger
    NoProgram = 0,
    /// Start of an exposure window
    Live = 1,
    /// End of an exposure window
    Dead = 2,
    /// Middle of an exposure window
    Mid = 4,
    /// Run-up, turnaround or tail-off
    Zero = 8,
}

/// Seconds to ticks, carrying the fractional remainder between rows.
///
/// Every row gets at least one tick; the carry keeps the running total within one
/// tick of the exact sum over any number of rows.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickQuantiser {
    carry: f64,
}

impl TickQuantiser {
    /// New quantiser with no carry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert `seconds` into whole ticks.
    pub fn ticks(&mut self, seconds: f64) -> u32 {
        let exact = seconds / TICK_S + self.carry;
        let mut whole = exact.floor();
        if whole < 1.0 {
            whole = 1.0;
        }
        self.carry = exact - whole;
        whole as u32
    }

    /// Fraction of a tick not yet released
    pub fn carry(&self) -> f64 {
        self.carry
    }
}

/// Round `seconds` up to a whole number of ticks.
pub fn round_up_to_tick(seconds: f64) -> f64 {
    (seconds / TICK_S - 1e-9).ceil() * TICK_S
}

/// One batch of profile rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileBatch {
    /// Row times in ticks
    pub time: Vec<u32>,
    /// Velocity mode of each row
    pub velocity_mode: Vec<VelocityMode>,
    /// User program of each row
    pub user_programs: Vec<UserProgram>,
    /// Demand positions per CS axis
    pub positions: BTreeMap<String, Vec<f64>>,
    /// Scan steps complete once each row has been scanned
    pub completed_steps: Vec<u64>,
}

impl ProfileBatch {
    /// Empty batch for the given CS axes.
    pub fn new<'a>(cs_axes: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            positions: cs_axes
                .into_iter()
                .map(|axis| (axis.to_string(), Vec::new()))
                .collect(),
            ..Default::default()
        }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.time.len()
    }

    /// True when the batch has no rows
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Append a row. `positions` must hold every axis of the batch.
    pub fn push(
        &mut self,
        ticks: u32,
        mode: VelocityMode,
        program: UserProgram,
        positions: &BTreeMap<String, f64>,
        completed_steps: u64,
    ) {
        self.time.push(ticks);
        self.velocity_mode.push(mode);
        self.user_programs.push(program);
        for (axis, column) in self.positions.iter_mut() {
            column.push(positions.get(axis).copied().unwrap_or_default());
        }
        self.completed_steps.push(completed_steps);
    }

    /// Change the velocity mode of the last row.
    pub fn set_last_mode(&mut self, mode: VelocityMode) {
        if let Some(last) = self.velocity_mode.last_mut() {
            *last = mode;
        }
    }

    /// CS axes used by this batch
    pub fn use_axes(&self) -> impl Iterator<Item = &str> {
        self.positions.keys().map(String::as_str)
    }

    /// Sum of row times in ticks
    pub fn total_ticks(&self) -> u64 {
        self.time.iter().map(|&t| u64::from(t)).sum()
    }

    /// Sum of row times in seconds
    pub fn total_seconds(&self) -> f64 {
        self.total_ticks() as f64 * TICK_S
    }

    /// Check the batch is consistent before it is programmed.
    pub fn check(&self) -> ScanResult<()> {
        let n = self.time.len();
        let consistent = self.velocity_mode.len() == n
            && self.user_programs.len() == n
            && self.completed_steps.len() == n
            && self.positions.values().all(|column| column.len() == n);
        if !consistent {
            return Err(ScanError::ParameterOutOfRange(
                "profile arrays have different lengths".into(),
            ));
        }
        if let Some(row) = self.time.iter().position(|&t| t == 0) {
            return Err(ScanError::ParameterOutOfRange(format!(
                "profile row {row} has zero time"
            )));
        }
        Ok(())
    }
}
