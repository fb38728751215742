//! Saved designs
//!
//! A design captures the layout of a controller's children, its exports and the
//! `config`-tagged settings of every part. Designs live in a directory private to
//! the controller, one JSON file per design name:
//!
//! ```text
//! <design_dir>/<mri>/<design>.json
//! ```
//!
//! Files are written to a temporary sibling and renamed into place, so a reader
//! never sees a half-written design.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{ScanError, ScanResult};
use crate::info::LayoutInfo;

/// Position of one child on the layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutEntry {
    /// Horizontal position
    pub x: f64,
    /// Vertical position
    pub y: f64,
    /// Whether the child is shown
    pub visible: bool,
}

/// Contents of a design file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedDesign {
    /// Layout keyed by part name
    #[serde(default)]
    pub layout: BTreeMap<String, LayoutEntry>,
    /// `part.field` → exported name
    #[serde(default)]
    pub exports: BTreeMap<String, String>,
    /// Saved settings keyed by part name
    #[serde(flatten)]
    pub parts: BTreeMap<String, Value>,
}

impl SavedDesign {
    /// Layout entries for the given rows.
    pub fn layout_from_rows(rows: &[LayoutInfo]) -> BTreeMap<String, LayoutEntry> {
        rows.iter()
            .map(|row| {
                (
                    row.name.clone(),
                    LayoutEntry {
                        x: row.x,
                        y: row.y,
                        visible: row.visible,
                    },
                )
            })
            .collect()
    }

    /// Apply the saved layout onto existing rows, leaving unknown parts untouched.
    pub fn apply_layout(&self, rows: &mut [LayoutInfo]) {
        for row in rows.iter_mut() {
            if let Some(entry) = self.layout.get(&row.name) {
                row.x = entry.x;
                row.y = entry.y;
                row.visible = entry.visible;
            }
        }
    }
}

/// Directory of designs for one controller.
#[derive(Debug, Clone)]
pub struct DesignStore {
    dir: PathBuf,
}

impl DesignStore {
    /// Store for `mri` under `design_dir`.
    pub fn new(design_dir: impl AsRef<Path>, mri: &str) -> Self {
        Self {
            dir: design_dir.as_ref().join(sanitize(mri)),
        }
    }

    /// Directory holding the designs
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a design file.
    pub fn path(&self, design: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(design)))
    }

    /// Write a design atomically.
    pub fn save(&self, design: &str, contents: &SavedDesign) -> ScanResult<PathBuf> {
        validate_name(design)?;
        fs::create_dir_all(&self.dir)?;
        let path = self.path(design);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(contents)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        info!(path = %path.display(), "Saved design");
        Ok(path)
    }

    /// Read a design.
    pub fn load(&self, design: &str) -> ScanResult<SavedDesign> {
        validate_name(design)?;
        let path = self.path(design);
        let text = fs::read_to_string(&path).map_err(|e| {
            ScanError::Configuration(format!("Cannot read design '{}': {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Names of every saved design, sorted.
    pub fn list(&self) -> ScanResult<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

fn validate_name(design: &str) -> ScanResult<()> {
    if design.is_empty() || design.contains(['/', '\\']) || design.starts_with('.') {
        return Err(ScanError::Configuration(format!(
            "Invalid design name '{design}'"
        )));
    }
    Ok(())
}

fn sanitize(name: &str) -> String {
    name.replace(':', "_")
}
