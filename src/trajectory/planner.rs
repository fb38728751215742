//! Profile planning
//!
//! Converts a span of generator points into profile batches for one coordinate
//! system. Each point becomes three rows:
//!
//! ```text
//!   lower (CURRENT_TO_NEXT, LIVE) → mid (PREV_TO_NEXT, MID) → upper (PREV_TO_NEXT, DEAD)
//! ```
//!
//! The mid row takes half the point duration and the upper row the other half,
//! less the single tick spent on the lower row when the point follows its
//! neighbour directly. A point entered from a run-up or a turnaround spends that
//! transit time on its lower row instead. The upper row switches to PREV_TO_CURRENT
//! before a turnaround or the tail-off.
//!
//! The first batch starts with a stationary row at the run-up start and the last
//! one ends with a stationary tail-off row past the final upper bound. Batches are
//! cut at `points_per_build` rows; planning stops early if an axis outside the
//! coordinate system would have to move, leaving the controller to start afresh.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::{ScanError, ScanResult};
use crate::generator::{CompoundGenerator, ScanPoint};
use crate::info::{MotorInfo, CS_AXIS_NAMES};

use super::profile::{round_up_to_tick, ProfileBatch, TickQuantiser, UserProgram, VelocityMode, TICK_S};

/// Positions closer than this are treated as equal.
const POSITION_TOLERANCE: f64 = 1e-9;

/// Shortest point duration the row layout can express.
pub const MIN_POINT_DURATION_S: f64 = 4.0 * TICK_S;

// =============================================================================
// Coordinate system resolution
// =============================================================================

/// Scannables mapped onto a single coordinate system.
#[derive(Debug, Clone, PartialEq)]
pub struct CsMapping {
    /// Coordinate system port
    pub cs_port: String,
    /// Motor info keyed by scannable
    pub axes: BTreeMap<String, MotorInfo>,
}

impl CsMapping {
    /// CS axis moving `scannable`
    pub fn cs_axis(&self, scannable: &str) -> Option<&str> {
        self.axes.get(scannable).map(|m| m.cs_axis.as_str())
    }

    /// CS axes in use, sorted
    pub fn cs_axes(&self) -> Vec<&str> {
        let mut axes: Vec<&str> = self.axes.values().map(|m| m.cs_axis.as_str()).collect();
        axes.sort_unstable();
        axes
    }

    fn to_cs(&self, by_scannable: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
        self.axes
            .iter()
            .filter_map(|(scannable, motor)| {
                by_scannable
                    .get(scannable)
                    .map(|&p| (motor.cs_axis.clone(), p))
            })
            .collect()
    }
}

/// Map every scannable in `axes_to_move` onto one coordinate system.
///
/// Fails with [`ScanError::MissingScannable`] when no motor moves a requested axis and
/// with [`ScanError::InconsistentCoordinateSystem`] when the motors span several CS
/// ports or share a CS axis.
pub fn resolve_cs(motors: &[MotorInfo], axes_to_move: &[String]) -> ScanResult<CsMapping> {
    let mut axes = BTreeMap::new();
    for scannable in axes_to_move {
        let motor = motors
            .iter()
            .find(|m| &m.scannable == scannable)
            .ok_or_else(|| {
                ScanError::MissingScannable(format!("no motor moves axis '{scannable}'"))
            })?;
        if !CS_AXIS_NAMES.contains(&motor.cs_axis.as_str()) {
            return Err(ScanError::InconsistentCoordinateSystem(format!(
                "'{scannable}' is on CS axis '{}', expected one of {CS_AXIS_NAMES:?}",
                motor.cs_axis
            )));
        }
        axes.insert(scannable.clone(), motor.clone());
    }

    let ports: BTreeSet<&str> = axes.values().map(|m| m.cs_port.as_str()).collect();
    if ports.len() != 1 {
        return Err(ScanError::InconsistentCoordinateSystem(format!(
            "axes {axes_to_move:?} span {} coordinate systems {ports:?}",
            ports.len()
        )));
    }
    let mut used = BTreeMap::new();
    for (scannable, motor) in &axes {
        if let Some(other) = used.insert(motor.cs_axis.as_str(), scannable.as_str()) {
            return Err(ScanError::InconsistentCoordinateSystem(format!(
                "'{other}' and '{scannable}' both map to CS axis {}",
                motor.cs_axis
            )));
        }
    }
    let cs_port = ports.into_iter().next().unwrap_or_default().to_string();
    Ok(CsMapping { cs_port, axes })
}

/// Shortest point duration that keeps every mapped axis within its maximum velocity.
pub fn minimum_duration(generator: &CompoundGenerator, mapping: &CsMapping) -> f64 {
    let mut duration = MIN_POINT_DURATION_S;
    if let Some(inner) = generator.dimensions().last() {
        for (axis, positions) in &inner.positions {
            let Some(motor) = mapping.axes.get(axis) else {
                continue;
            };
            if positions.len() > 1 && motor.max_velocity > 0.0 {
                let step = (positions[1] - positions[0]).abs();
                duration = duration.max(step / motor.max_velocity);
            }
        }
    }
    round_up_to_tick(duration)
}

// =============================================================================
// Planner
// =============================================================================

/// How consecutive points join.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Join {
    /// Next lower bound equals last upper bound
    Contiguous,
    /// Transit row needed, lasting this many seconds
    Turnaround(f64),
    /// An axis outside the coordinate system moves
    Break,
}

/// Streams profile batches for a span of steps.
#[derive(Debug, Clone)]
pub struct ProfilePlanner {
    generator: CompoundGenerator,
    mapping: CsMapping,
    external_axes: Vec<String>,
    points_per_build: usize,
    next_step: u64,
    end_step: u64,
    started: bool,
    finished: bool,
    lead_in: Option<f64>,
    quantiser: TickQuantiser,
}

impl ProfilePlanner {
    /// Planner for steps `[start, end)`.
    pub fn new(
        generator: CompoundGenerator,
        mapping: CsMapping,
        start: u64,
        end: u64,
        points_per_build: usize,
    ) -> Self {
        let external_axes = generator
            .axes()
            .into_iter()
            .filter(|a| !mapping.axes.contains_key(a))
            .collect();
        let end = end.min(generator.size());
        Self {
            generator,
            mapping,
            external_axes,
            points_per_build: points_per_build.max(5),
            next_step: start,
            end_step: end,
            started: false,
            finished: start >= end,
            lead_in: None,
            quantiser: TickQuantiser::new(),
        }
    }

    /// True once the tail-off has been planned
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// First step not yet planned
    pub fn next_step(&self) -> u64 {
        self.next_step
    }

    /// Step after the last one this planner will cover
    pub fn end_step(&self) -> u64 {
        self.end_step
    }

    /// CS positions where the profile starts
    pub fn start_positions(&self) -> ScanResult<BTreeMap<String, f64>> {
        let first = self.generator.point(self.next_step)?;
        Ok(self.mapping.to_cs(&self.run_up_start(&first)))
    }

    /// Plan the next batch, or `None` once the tail-off has been emitted.
    pub fn next_batch(&mut self) -> ScanResult<Option<ProfileBatch>> {
        if self.finished {
            return Ok(None);
        }
        let mut batch = ProfileBatch::new(self.mapping.cs_axes());

        if !self.started {
            let first = self.generator.point(self.next_step)?;
            let start = self.mapping.to_cs(&self.run_up_start(&first));
            let ticks = self.quantiser.ticks(TICK_S);
            batch.push(ticks, VelocityMode::Zero, UserProgram::Zero, &start, self.next_step);
            self.lead_in = Some(self.run_up_time(&first));
            self.started = true;
        }

        let mut emitted = 0usize;
        while self.next_step < self.end_step {
            if emitted > 0 && batch.len() + 4 > self.points_per_build {
                break;
            }
            let step = self.next_step;
            let point = self.generator.point(step)?;
            self.push_point(&mut batch, &point);
            emitted += 1;
            self.next_step += 1;

            let join = if self.next_step < self.end_step {
                let next = self.generator.point(self.next_step)?;
                self.join(&point, &next)
            } else {
                Join::Break
            };
            match join {
                Join::Contiguous => self.lead_in = None,
                Join::Turnaround(seconds) => {
                    batch.set_last_mode(VelocityMode::PrevToCurrent);
                    self.lead_in = Some(seconds);
                }
                Join::Break => {
                    batch.set_last_mode(VelocityMode::PrevToCurrent);
                    self.push_tail_off(&mut batch, &point);
                    self.end_step = self.next_step;
                    self.finished = true;
                    break;
                }
            }
        }

        debug!(
            rows = batch.len(),
            points = emitted,
            next_step = self.next_step,
            finished = self.finished,
            "Planned profile batch"
        );
        Ok(Some(batch))
    }

    fn push_point(&mut self, batch: &mut ProfileBatch, point: &ScanPoint) {
        let step = point.step_index;
        let half = point.duration / 2.0;
        let (lower_s, upper_s) = match self.lead_in.take() {
            Some(transit) => (transit, half),
            None => (TICK_S, half - TICK_S),
        };

        let lower = self.mapping.to_cs(&point.lower);
        let mid = self.mapping.to_cs(&point.positions);
        let upper = self.mapping.to_cs(&point.upper);

        let ticks = self.quantiser.ticks(lower_s);
        batch.push(ticks, VelocityMode::CurrentToNext, UserProgram::Live, &lower, step);
        let ticks = self.quantiser.ticks(half);
        batch.push(ticks, VelocityMode::PrevToNext, UserProgram::Mid, &mid, step);
        let ticks = self.quantiser.ticks(upper_s);
        batch.push(ticks, VelocityMode::PrevToNext, UserProgram::Dead, &upper, step + 1);
    }

    fn push_tail_off(&mut self, batch: &mut ProfileBatch, last: &ScanPoint) {
        let mut end = BTreeMap::new();
        let mut time: f64 = 0.0;
        for (scannable, motor) in &self.mapping.axes {
            let upper = last.upper.get(scannable).copied().unwrap_or_default();
            let run = run_distance(last, scannable, motor);
            end.insert(scannable.clone(), upper + run);
            time = time.max(motor.move_time(run));
        }
        let ticks = self.quantiser.ticks(time);
        let end = self.mapping.to_cs(&end);
        batch.push(ticks, VelocityMode::Zero, UserProgram::Zero, &end, last.step_index + 1);
    }

    fn run_up_start(&self, first: &ScanPoint) -> BTreeMap<String, f64> {
        self.mapping
            .axes
            .iter()
            .map(|(scannable, motor)| {
                let lower = first.lower.get(scannable).copied().unwrap_or_default();
                (scannable.clone(), lower - run_distance(first, scannable, motor))
            })
            .collect()
    }

    fn run_up_time(&self, first: &ScanPoint) -> f64 {
        self.mapping
            .axes
            .iter()
            .map(|(scannable, motor)| motor.move_time(run_distance(first, scannable, motor)))
            .fold(0.0, f64::max)
    }

    /// How `next` follows on from `last`.
    pub fn join(&self, last: &ScanPoint, next: &ScanPoint) -> Join {
        for axis in &self.external_axes {
            let before = last.positions.get(axis).copied().unwrap_or_default();
            let after = next.positions.get(axis).copied().unwrap_or_default();
            if (before - after).abs() > POSITION_TOLERANCE {
                return Join::Break;
            }
        }

        let mut needed = false;
        let mut accel: f64 = 0.0;
        let mut travel: f64 = 0.0;
        for (scannable, motor) in &self.mapping.axes {
            let from = last.upper.get(scannable).copied().unwrap_or_default();
            let to = next.lower.get(scannable).copied().unwrap_or_default();
            let gap = to - from;
            if gap.abs() > POSITION_TOLERANCE {
                needed = true;
            }
            let v_last = velocity(last, scannable);
            let v_next = velocity(next, scannable);
            if changes_direction(v_last, gap, v_next) {
                needed = true;
                accel = accel.max(motor.acceleration_time());
            }
            if motor.max_velocity > 0.0 {
                travel = travel.max(gap.abs() / motor.max_velocity);
            }
        }
        if needed {
            Join::Turnaround(accel + travel)
        } else {
            Join::Contiguous
        }
    }
}

fn velocity(point: &ScanPoint, scannable: &str) -> f64 {
    let lower = point.lower.get(scannable).copied().unwrap_or_default();
    let upper = point.upper.get(scannable).copied().unwrap_or_default();
    (upper - lower) / point.duration
}

/// Distance covered ramping to the point velocity.
fn run_distance(point: &ScanPoint, scannable: &str, motor: &MotorInfo) -> f64 {
    let lower = point.lower.get(scannable).copied().unwrap_or_default();
    let upper = point.upper.get(scannable).copied().unwrap_or_default();
    (upper - lower) * motor.acceleration_time() / point.duration
}

fn changes_direction(v_last: f64, gap: f64, v_next: f64) -> bool {
    let signs: Vec<f64> = [v_last, gap, v_next]
        .into_iter()
        .filter(|v| v.abs() > POSITION_TOLERANCE)
        .map(f64::signum)
        .collect();
    signs.windows(2).any(|w| w[0] != w[1])
}
