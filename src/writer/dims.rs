//! Dimension slots programmed onto the writer
//!
//! The writer places each frame using up to ten position dimensions named by slot
//! suffix, innermost first: `N`, `X`, `Y`, then `3` to `9`.

use serde_json::{json, Value};

use crate::error::{ScanError, ScanResult};
use crate::generator::CompoundGenerator;

/// Slot suffixes, innermost dimension first.
pub const DIM_SUFFIXES: [&str; 10] = ["N", "X", "Y", "3", "4", "5", "6", "7", "8", "9"];

/// `(attribute, value)` pairs describing the generator shape to the writer.
///
/// Sets `numExtraDims`, then `posNameDim<S>` and `extraDimSize<S>` for every slot;
/// unused slots get an empty name and size 1.
pub fn dimension_attributes(generator: &CompoundGenerator) -> ScanResult<Vec<(String, Value)>> {
    let dims = generator.dimensions();
    if dims.len() > DIM_SUFFIXES.len() {
        return Err(ScanError::ParameterOutOfRange(format!(
            "writer supports at most {} dimensions, generator has {}",
            DIM_SUFFIXES.len(),
            dims.len()
        )));
    }

    let mut values = vec![("numExtraDims".to_string(), json!(dims.len().saturating_sub(1)))];
    let mut innermost_first = dims.iter().rev();
    for suffix in DIM_SUFFIXES {
        let (name, size) = match innermost_first.next() {
            Some(dim) => (dim.name.clone(), dim.size),
            None => (String::new(), 1),
        };
        values.push((format!("posNameDim{suffix}"), json!(name)));
        values.push((format!("extraDimSize{suffix}"), json!(size)));
    }
    Ok(values)
}
