//! HDF5 layout document
//!
//! The writer builds its file tree from an XML layout: groups, constant
//! attributes, constant datasets and datasets fed from the detector or from
//! NDAttributes. Set-point datasets live under `/entry/detector` and every other
//! NXdata group hard-links them so each signal carries its own axes.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;

use crate::error::{ScanError, ScanResult};
use crate::generator::{CompoundGenerator, Dimension};
use crate::writer::producers::{AttributeSource, DatasetSources};

fn xml_err(e: impl std::fmt::Display) -> ScanError {
    ScanError::Serialization(format!("layout xml: {e}"))
}

/// Inputs to the layout document.
#[derive(Debug, Clone)]
pub struct LayoutSpec<'a> {
    /// Scan shape
    pub generator: &'a CompoundGenerator,
    /// What the detector side will send
    pub sources: &'a DatasetSources,
    /// Capture every NDAttribute, not only those listed
    pub capture_all_attributes: bool,
}

struct LayoutWriter {
    writer: Writer<Vec<u8>>,
}

impl LayoutWriter {
    fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        }
    }

    fn start(&mut self, tag: &str, attrs: &[(&str, &str)]) -> ScanResult<()> {
        let mut el = BytesStart::new(tag);
        for attr in attrs {
            el.push_attribute(*attr);
        }
        self.writer.write_event(Event::Start(el)).map_err(xml_err)
    }

    fn end(&mut self, tag: &str) -> ScanResult<()> {
        self.writer
            .write_event(Event::End(BytesEnd::new(tag)))
            .map_err(xml_err)
    }

    fn empty(&mut self, tag: &str, attrs: &[(&str, &str)]) -> ScanResult<()> {
        let mut el = BytesStart::new(tag);
        for attr in attrs {
            el.push_attribute(*attr);
        }
        self.writer.write_event(Event::Empty(el)).map_err(xml_err)
    }

    /// Constant string attribute on the enclosing element.
    fn constant(&mut self, name: &str, value: &str) -> ScanResult<()> {
        self.empty(
            "attribute",
            &[("name", name), ("source", "constant"), ("value", value), ("type", "string")],
        )
    }

    fn open_nxdata(&mut self, group: &str, signal: &str, axes: &str) -> ScanResult<()> {
        self.start("group", &[("name", group)])?;
        self.constant("signal", signal)?;
        self.constant("axes", axes)?;
        self.constant("NX_class", "NXdata")
    }

    fn finish(self) -> ScanResult<String> {
        String::from_utf8(self.writer.into_inner()).map_err(xml_err)
    }
}

/// `axes` attribute value: one entry per scan dimension then one `.` per frame
/// dimension. Dimensions moving several axes are listed as `.`.
fn axes_attribute(dims: &[Dimension], frame_rank: usize) -> String {
    dims.iter()
        .map(|d| match d.axes.as_slice() {
            [axis] => format!("{axis}_set"),
            _ => ".".to_string(),
        })
        .chain(std::iter::repeat(".".to_string()).take(frame_rank))
        .collect::<Vec<_>>()
        .join(",")
}

fn set_indices(w: &mut LayoutWriter, dims: &[Dimension]) -> ScanResult<()> {
    for (index, dim) in dims.iter().enumerate() {
        for axis in &dim.axes {
            w.constant(&format!("{axis}_set_indices"), &index.to_string())?;
        }
    }
    Ok(())
}

fn hardlinks(w: &mut LayoutWriter, dims: &[Dimension]) -> ScanResult<()> {
    for axis in dims.iter().flat_map(|d| d.axes.iter()) {
        let name = format!("{axis}_set");
        let target = format!("/entry/detector/{name}");
        w.empty("hardlink", &[("name", name.as_str()), ("target", target.as_str())])?;
    }
    Ok(())
}

fn attribute_group(w: &mut LayoutWriter, dims: &[Dimension], source: &AttributeSource) -> ScanResult<()> {
    w.open_nxdata(&source.name, &source.name, &axes_attribute(dims, source.rank))?;
    set_indices(w, dims)?;
    hardlinks(w, dims)?;
    w.empty(
        "dataset",
        &[
            ("name", source.name.as_str()),
            ("source", "ndattribute"),
            ("ndattribute", source.attr.as_str()),
        ],
    )?;
    w.end("group")
}

/// Render the layout document.
pub fn layout_xml(layout: &LayoutSpec<'_>) -> ScanResult<String> {
    let dims = layout.generator.dimensions();
    let units = layout.generator.units();
    let mut w = LayoutWriter::new();

    w.writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;
    w.start("hdf5_layout", &[("auto_ndattr_default", "false")])?;
    w.start("group", &[("name", "entry")])?;
    w.constant("NX_class", "NXentry")?;

    let frame_rank = layout.sources.primary_rank.unwrap_or(0);
    w.open_nxdata("detector", "detector", &axes_attribute(&dims, frame_rank))?;
    set_indices(&mut w, &dims)?;
    for dim in &dims {
        for axis in &dim.axes {
            let positions = dim
                .positions
                .get(axis)
                .map(|p| p.iter().map(f64::to_string).collect::<Vec<_>>().join(","))
                .unwrap_or_default();
            let name = format!("{axis}_set");
            w.start(
                "dataset",
                &[
                    ("name", name.as_str()),
                    ("source", "constant"),
                    ("type", "float"),
                    ("value", positions.as_str()),
                ],
            )?;
            w.constant("units", units.get(axis).map(String::as_str).unwrap_or(""))?;
            w.end("dataset")?;
        }
    }
    if layout.sources.primary_rank.is_some() {
        w.start("dataset", &[("name", "detector"), ("source", "detector"), ("det_default", "true")])?;
        w.constant("NX_class", "SDS")?;
        w.end("dataset")?;
    }
    w.end("group")?;

    for calc in &layout.sources.calculated {
        w.open_nxdata(&calc.attr, &calc.attr, &axes_attribute(&dims, 0))?;
        set_indices(&mut w, &dims)?;
        hardlinks(&mut w, &dims)?;
        w.empty(
            "dataset",
            &[
                ("name", calc.attr.as_str()),
                ("source", "ndattribute"),
                ("ndattribute", calc.attr.as_str()),
            ],
        )?;
        w.end("group")?;
    }
    for source in &layout.sources.attributes {
        attribute_group(&mut w, &dims, source)?;
    }

    let ndattr_default = if layout.capture_all_attributes { "true" } else { "false" };
    w.start("group", &[("name", "NDAttributes"), ("ndattr_default", ndattr_default)])?;
    w.constant("NX_class", "NXcollection")?;
    w.empty(
        "dataset",
        &[("name", "NDArrayUniqueId"), ("source", "ndattribute"), ("ndattribute", "NDArrayUniqueId")],
    )?;
    w.end("group")?;

    w.end("group")?;
    w.end("hdf5_layout")?;
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::LineSpec;
    use crate::info::AttributeDatasetType;
    use crate::writer::producers::CalculatedSource;

    fn grid() -> CompoundGenerator {
        CompoundGenerator::new(
            vec![
                LineSpec::new("y", "mm", 0.0, 1.0, 2),
                LineSpec::new("x", "um", 0.0, 1.0, 3),
            ],
            1.0,
            true,
        )
    }

    #[test]
    fn detector_group_lists_set_axes() {
        let generator = grid();
        let sources = DatasetSources {
            primary_rank: Some(2),
            calculated: vec![CalculatedSource {
                name: "det".into(),
                attr: "StatsTotal".into(),
            }],
            attributes: vec![],
        };
        let xml = layout_xml(&LayoutSpec {
            generator: &generator,
            sources: &sources,
            capture_all_attributes: true,
        })
        .unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("value=\"NXentry\""));
        assert!(xml.contains("name=\"axes\" source=\"constant\" value=\"y_set,x_set,.,.\""));
        assert!(xml.contains("name=\"y_set_indices\" source=\"constant\" value=\"0\""));
        assert!(xml.contains("name=\"x_set_indices\" source=\"constant\" value=\"1\""));
        assert!(xml.contains("name=\"x_set\" source=\"constant\" type=\"float\" value=\"0,0.5,1\""));
        assert!(xml.contains("name=\"units\" source=\"constant\" value=\"um\""));
        assert!(xml.contains("name=\"detector\" source=\"detector\" det_default=\"true\""));
        assert!(xml.contains("<hardlink name=\"x_set\" target=\"/entry/detector/x_set\"/>"));
        assert!(xml.contains("ndattribute=\"StatsTotal\""));
        assert!(xml.contains("name=\"NDAttributes\" ndattr_default=\"true\""));
        assert!(xml.contains("value=\"NXcollection\""));
    }

    #[test]
    fn multi_axis_dimension_lists_dot() {
        let generator = CompoundGenerator::new(
            vec![LineSpec::with_axes(&[("x", "mm", 0.0, 1.0), ("y", "mm", 0.0, 2.0)], 3)],
            0.5,
            false,
        );
        let sources = DatasetSources {
            primary_rank: None,
            calculated: vec![],
            attributes: vec![AttributeSource {
                name: "I0".into(),
                dataset_type: AttributeDatasetType::Monitor,
                attr: "I0.value".into(),
                rank: 0,
            }],
        };
        let xml = layout_xml(&LayoutSpec {
            generator: &generator,
            sources: &sources,
            capture_all_attributes: false,
        })
        .unwrap();

        assert!(xml.contains("name=\"axes\" source=\"constant\" value=\".\""));
        assert!(xml.contains("name=\"x_set_indices\" source=\"constant\" value=\"0\""));
        assert!(xml.contains("name=\"y_set_indices\" source=\"constant\" value=\"0\""));
        assert!(!xml.contains("source=\"detector\""));
        assert!(xml.contains("<group name=\"I0\">"));
        assert!(xml.contains("ndattribute=\"I0.value\""));
        assert!(xml.contains("ndattr_default=\"false\""));
    }
}
