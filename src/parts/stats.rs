//! Statistics plugin part: a per-frame total written beside the detector data.
//!
//! Configure writes an NDAttributes document declaring the total next to the data
//! and points the plugin at it, translated for the writer host when a
//! `FilePathTranslator` is reported.

use std::path::Path;
use std::sync::Arc;

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use serde_json::json;
use tracing::debug;

use crate::context::Context;
use crate::error::{ScanError, ScanResult};
use crate::hooks::{ConfigureArgs, Hook};
use crate::info::{unique_value, Info, PathTranslation};
use crate::part::{Part, PartRegistrar};
use crate::writer::translate;

/// NDAttribute the plugin attaches to every frame.
pub const STATS_TOTAL_ATTR: &str = "StatsTotal";

fn xml_err(e: impl std::fmt::Display) -> ScanError {
    ScanError::Serialization(format!("attributes xml: {e}"))
}

/// NDAttributes document exposing the plugin's total as [`STATS_TOTAL_ATTR`].
pub fn attributes_xml() -> ScanResult<String> {
    let mut w = Writer::new(Vec::new());
    w.write_event(Event::Start(BytesStart::new("Attributes"))).map_err(xml_err)?;
    let mut el = BytesStart::new("Attribute");
    el.push_attribute(("name", STATS_TOTAL_ATTR));
    el.push_attribute(("type", "PARAM"));
    el.push_attribute(("source", "TOTAL"));
    el.push_attribute(("addr", "0"));
    el.push_attribute(("datatype", "DOUBLE"));
    el.push_attribute(("description", "Sum of the array"));
    w.write_event(Event::Empty(el)).map_err(xml_err)?;
    w.write_event(Event::End(BytesEnd::new("Attributes"))).map_err(xml_err)?;
    String::from_utf8(w.into_inner()).map_err(xml_err)
}

/// Enables a statistics plugin and declares its total as a secondary dataset.
#[derive(Debug)]
pub struct StatsPluginPart {
    name: String,
    mri: String,
    detector: String,
}

impl StatsPluginPart {
    /// Part for plugin `mri` whose totals are filed under detector name `detector`.
    pub fn new(name: impl Into<String>, mri: impl Into<String>, detector: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mri: mri.into(),
            detector: detector.into(),
        }
    }

    async fn configure(&self, ctx: &Context, args: &ConfigureArgs) -> ScanResult<Vec<Info>> {
        let translation: Option<PathTranslation> = unique_value(&args.part_info, "FilePathTranslator")?;
        let file_dir = args.params.file_dir.trim_end_matches('/');
        let path = Path::new(file_dir).join(format!("{}-attributes.xml", self.mri));
        tokio::fs::create_dir_all(file_dir).await?;
        tokio::fs::write(&path, attributes_xml()?).await?;
        debug!(part = %self.name, path = %path.display(), "Wrote attributes");
        let attributes_file = translate(&path.to_string_lossy(), translation.as_ref())?;

        let view = ctx.block_view(&self.mri)?;
        ctx.put_many(
            view.as_ref(),
            vec![
                ("enableCallbacks", json!(true)),
                ("computeStatistics", json!(true)),
                ("attributesFile", json!(attributes_file)),
            ],
        )
        .await?;
        Ok(vec![])
    }
}

impl Part for StatsPluginPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn mri(&self) -> Option<&str> {
        Some(&self.mri)
    }

    fn setup(self: Arc<Self>, registrar: &mut PartRegistrar) {
        registrar.hook(Hook::ReportStatus, &self, |part, _ctx, _call| async move {
            Ok(vec![Info::CalculatedNdAttributeDataset {
                name: part.detector.clone(),
                attr: STATS_TOTAL_ATTR.into(),
            }])
        });
        registrar.hook(Hook::Configure, &self, |part, ctx, call| async move {
            part.configure(&ctx, call.configure()?).await
        });
    }
}
