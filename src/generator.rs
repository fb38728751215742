//! Scan point generation
//!
//! A [`CompoundGenerator`] nests linear dimensions, outermost first. Points are
//! computed on demand from a step index, so the sequence is restartable from any
//! step without materialising it. With `snake` enabled every inner dimension runs
//! backwards on odd passes of the dimensions enclosing it, and the reversed points
//! swap their `lower`/`upper` bounds so motion stays continuous. Only axes of the
//! innermost dimension move during a point; outer axes have `lower == upper`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ScanError, ScanResult};

/// A linear dimension moving one or more axes together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineSpec {
    /// Axes moved by this dimension
    pub axes: Vec<String>,
    /// Units of each axis
    pub units: Vec<String>,
    /// First position of each axis
    pub start: Vec<f64>,
    /// Last position of each axis
    pub stop: Vec<f64>,
    /// Number of points
    pub size: usize,
}

impl LineSpec {
    /// Single-axis line.
    pub fn new(axis: &str, units: &str, start: f64, stop: f64, size: usize) -> Self {
        Self {
            axes: vec![axis.to_string()],
            units: vec![units.to_string()],
            start: vec![start],
            stop: vec![stop],
            size,
        }
    }

    /// Line moving several axes together; each entry is `(axis, units, start, stop)`.
    pub fn with_axes(axes: &[(&str, &str, f64, f64)], size: usize) -> Self {
        Self {
            axes: axes.iter().map(|a| a.0.to_string()).collect(),
            units: axes.iter().map(|a| a.1.to_string()).collect(),
            start: axes.iter().map(|a| a.2).collect(),
            stop: axes.iter().map(|a| a.3).collect(),
            size,
        }
    }

    fn step(&self, axis: usize) -> f64 {
        let span = self.stop[axis] - self.start[axis];
        if self.size > 1 {
            span / (self.size - 1) as f64
        } else {
            span
        }
    }

    fn position(&self, axis: usize, index: usize) -> f64 {
        if self.size > 1 {
            self.start[axis] + self.step(axis) * index as f64
        } else {
            self.start[axis]
        }
    }
}

/// One dimension of the scan shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dimension {
    /// Name used for writer dimension slots, `d0` being outermost
    pub name: String,
    /// Axes moved by this dimension
    pub axes: Vec<String>,
    /// Number of points
    pub size: usize,
    /// Positions visited by each axis, in forward order
    pub positions: BTreeMap<String, Vec<f64>>,
}

/// A single point of the scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanPoint {
    /// Demand position of every axis
    pub positions: BTreeMap<String, f64>,
    /// Position at the start of the point's exposure window
    pub lower: BTreeMap<String, f64>,
    /// Position at the end of the point's exposure window
    pub upper: BTreeMap<String, f64>,
    /// Index into each dimension, outermost first
    pub indexes: Vec<usize>,
    /// Exposure window length in seconds
    pub duration: f64,
    /// Global step index
    pub step_index: u64,
}

/// Nested line scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundGenerator {
    /// Dimensions, outermost first
    pub lines: Vec<LineSpec>,
    /// Duration of every point in seconds
    pub duration: f64,
    /// Reverse inner dimensions on alternate passes
    #[serde(default)]
    pub snake: bool,
}

impl CompoundGenerator {
    /// Create a generator.
    pub fn new(lines: Vec<LineSpec>, duration: f64, snake: bool) -> Self {
        Self {
            lines,
            duration,
            snake,
        }
    }

    /// Check the generator describes a usable scan.
    pub fn validate(&self) -> ScanResult<()> {
        if !(self.duration.is_finite() && self.duration > 0.0) {
            return Err(ScanError::ParameterOutOfRange(format!(
                "generator duration must be positive, got {}",
                self.duration
            )));
        }
        if self.lines.is_empty() {
            return Err(ScanError::ParameterOutOfRange(
                "generator has no dimensions".into(),
            ));
        }
        for line in &self.lines {
            let n = line.axes.len();
            if n == 0 || line.units.len() != n || line.start.len() != n || line.stop.len() != n {
                return Err(ScanError::ParameterOutOfRange(format!(
                    "dimension {:?} has mismatched axis fields",
                    line.axes
                )));
            }
            if line.size == 0 {
                return Err(ScanError::ParameterOutOfRange(format!(
                    "dimension {:?} has no points",
                    line.axes
                )));
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for axis in self.axes() {
            if !seen.insert(axis.clone()) {
                return Err(ScanError::ParameterOutOfRange(format!(
                    "axis '{axis}' appears in more than one dimension"
                )));
            }
        }
        Ok(())
    }

    /// Total number of points
    pub fn size(&self) -> u64 {
        self.lines.iter().map(|l| l.size as u64).product()
    }

    /// Dimensions, outermost first
    pub fn dimensions(&self) -> Vec<Dimension> {
        self.lines
            .iter()
            .enumerate()
            .map(|(i, line)| Dimension {
                name: format!("d{i}"),
                axes: line.axes.clone(),
                size: line.size,
                positions: line
                    .axes
                    .iter()
                    .enumerate()
                    .map(|(a, axis)| {
                        let visited = (0..line.size).map(|idx| line.position(a, idx)).collect();
                        (axis.clone(), visited)
                    })
                    .collect(),
            })
            .collect()
    }

    /// Every axis, outermost dimension first
    pub fn axes(&self) -> Vec<String> {
        self.lines.iter().flat_map(|l| l.axes.iter().cloned()).collect()
    }

    /// Units of every axis
    pub fn units(&self) -> BTreeMap<String, String> {
        self.lines
            .iter()
            .flat_map(|l| l.axes.iter().cloned().zip(l.units.iter().cloned()))
            .collect()
    }

    /// Compute the point at `step`.
    pub fn point(&self, step: u64) -> ScanResult<ScanPoint> {
        let size = self.size();
        if step >= size {
            return Err(ScanError::ParameterOutOfRange(format!(
                "step {step} is outside a scan of {size} points"
            )));
        }

        let mut point = ScanPoint {
            positions: BTreeMap::new(),
            lower: BTreeMap::new(),
            upper: BTreeMap::new(),
            indexes: Vec::with_capacity(self.lines.len()),
            duration: self.duration,
            step_index: step,
        };

        // Points enclosed by each dimension, including itself.
        let mut inner: u64 = size;
        for (dim, line) in self.lines.iter().enumerate() {
            let outer_pass = step / inner;
            inner /= line.size as u64;
            let mut index = ((step / inner) % line.size as u64) as usize;
            let reversed = self.snake && dim > 0 && outer_pass % 2 == 1;
            if reversed {
                index = line.size - 1 - index;
            }
            point.indexes.push(index);

            let innermost = dim + 1 == self.lines.len();
            for (a, axis) in line.axes.iter().enumerate() {
                let position = line.position(a, index);
                let half = if innermost { line.step(a) / 2.0 } else { 0.0 };
                let (lower, upper) = if reversed {
                    (position + half, position - half)
                } else {
                    (position - half, position + half)
                };
                point.positions.insert(axis.clone(), position);
                point.lower.insert(axis.clone(), lower);
                point.upper.insert(axis.clone(), upper);
            }
        }
        Ok(point)
    }

    /// Points in `[start, end)`.
    pub fn points(&self, start: u64, end: u64) -> impl Iterator<Item = ScanResult<ScanPoint>> + '_ {
        (start..end.min(self.size())).map(move |step| self.point(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snake_grid() -> CompoundGenerator {
        CompoundGenerator::new(
            vec![
                LineSpec::new("y", "mm", 0.0, 1.0, 2),
                LineSpec::new("x", "mm", 0.0, 1.0, 3),
            ],
            1.0,
            true,
        )
    }

    #[test]
    fn shape_and_names() {
        let generator = snake_grid();
        assert_eq!(generator.size(), 6);
        let dims = generator.dimensions();
        assert_eq!(dims[0].name, "d0");
        assert_eq!(dims[1].axes, vec!["x"]);
        assert_eq!(dims[1].positions["x"], vec![0.0, 0.5, 1.0]);
        assert_eq!(generator.axes(), vec!["y", "x"]);
        assert_eq!(generator.units()["x"], "mm");
    }

    #[test]
    fn snake_reverses_odd_rows_and_swaps_bounds() {
        let generator = snake_grid();
        let forward = generator.point(2).unwrap();
        assert_eq!(forward.indexes, vec![0, 2]);
        assert_eq!(forward.lower["x"], 0.75);
        assert_eq!(forward.upper["x"], 1.25);

        let reversed = generator.point(3).unwrap();
        assert_eq!(reversed.indexes, vec![1, 2]);
        assert_eq!(reversed.positions["x"], 1.0);
        assert_eq!(reversed.lower["x"], 1.25);
        assert_eq!(reversed.upper["x"], 0.75);

        let last = generator.point(5).unwrap();
        assert_eq!(last.indexes, vec![1, 0]);
        assert_eq!(last.positions["y"], 1.0);
        assert_eq!(last.lower["y"], 1.0);
        assert_eq!(last.upper["y"], 1.0);
    }

    #[test]
    fn out_of_range_step_is_rejected() {
        assert!(matches!(
            snake_grid().point(6),
            Err(ScanError::ParameterOutOfRange(_))
        ));
    }

    #[test]
    fn validation_catches_bad_generators() {
        let mut generator = snake_grid();
        generator.duration = 0.0;
        assert!(generator.validate().is_err());

        let duplicated = CompoundGenerator::new(
            vec![
                LineSpec::new("x", "mm", 0.0, 1.0, 2),
                LineSpec::new("x", "mm", 0.0, 1.0, 2),
            ],
            0.1,
            false,
        );
        assert!(duplicated.validate().is_err());
        assert!(snake_grid().validate().is_ok());
    }

    #[test]
    fn multi_axis_line_moves_together() {
        let generator = CompoundGenerator::new(
            vec![LineSpec::with_axes(
                &[("x", "mm", 0.0, 2.0), ("y", "mm", 10.0, 12.0)],
                3,
            )],
            0.5,
            false,
        );
        let point = generator.point(1).unwrap();
        assert_eq!(point.positions["x"], 1.0);
        assert_eq!(point.positions["y"], 11.0);
        assert_eq!(generator.dimensions().len(), 1);
    }

    #[test]
    fn survives_serde() {
        let generator = snake_grid();
        let json = serde_json::to_value(&generator).unwrap();
        let back: CompoundGenerator = serde_json::from_value(json).unwrap();
        assert_eq!(back, generator);
    }
}
