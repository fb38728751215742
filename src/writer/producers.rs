//! Dataset sources and the producer list
//!
//! Detector-side parts declare what they produce during ReportStatus; the writer
//! gathers those declarations, turns them into the datasets its file will hold and
//! returns them from Configure.

use crate::error::{ScanError, ScanResult};
use crate::generator::CompoundGenerator;
use crate::info::{AttributeDatasetType, DatasetProducer, DatasetType, Info, PartInfo};

/// Path of the unique id dataset every frame-indexed dataset is keyed by.
pub const UNIQUE_ID_PATH: &str = "/entry/NDAttributes/NDArrayUniqueId";

/// Scalar derived from each frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculatedSource {
    /// Dataset name prefix
    pub name: String,
    /// NDAttribute holding the value
    pub attr: String,
}

/// NDAttribute captured alongside frames.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeSource {
    /// Dataset name
    pub name: String,
    /// Kind of value
    pub dataset_type: AttributeDatasetType,
    /// NDAttribute holding the value
    pub attr: String,
    /// Rank of one value
    pub rank: usize,
}

/// Everything the detector side will send the writer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetSources {
    /// Rank of the primary frames, if a detector produces them
    pub primary_rank: Option<usize>,
    /// Calculated scalars
    pub calculated: Vec<CalculatedSource>,
    /// Captured NDAttributes
    pub attributes: Vec<AttributeSource>,
}

impl DatasetSources {
    /// Gather declarations from ReportStatus infos. At most one primary is allowed.
    pub fn collect(part_info: &PartInfo) -> ScanResult<Self> {
        let mut sources = Self::default();
        for (part, infos) in part_info {
            for info in infos {
                match info {
                    Info::NdArrayDataset { rank } => {
                        if sources.primary_rank.is_some() {
                            return Err(ScanError::Configuration(format!(
                                "part '{part}' declares a second primary NDArray dataset"
                            )));
                        }
                        sources.primary_rank = Some(*rank);
                    }
                    Info::CalculatedNdAttributeDataset { name, attr } => {
                        sources.calculated.push(CalculatedSource {
                            name: name.clone(),
                            attr: attr.clone(),
                        });
                    }
                    Info::NdAttributeDataset {
                        name,
                        dataset_type,
                        attr,
                        rank,
                    } => sources.attributes.push(AttributeSource {
                        name: name.clone(),
                        dataset_type: *dataset_type,
                        attr: attr.clone(),
                        rank: *rank,
                    }),
                    _ => {}
                }
            }
        }
        Ok(sources)
    }
}

/// Datasets the file will contain.
///
/// `name` prefixes the primary dataset and `filename` is recorded on every producer.
pub fn dataset_producers(
    name: &str,
    filename: &str,
    sources: &DatasetSources,
    generator: &CompoundGenerator,
) -> Vec<DatasetProducer> {
    let scan_rank = generator.dimensions().len();
    let producer = |name: String, dataset_type, rank, path: String| DatasetProducer {
        name,
        filename: filename.to_string(),
        dataset_type,
        rank,
        path,
        unique_id_path: UNIQUE_ID_PATH.to_string(),
    };

    let mut producers = Vec::new();
    if let Some(rank) = sources.primary_rank {
        producers.push(producer(
            format!("{name}.data"),
            DatasetType::Primary,
            rank + scan_rank,
            "/entry/detector/detector".to_string(),
        ));
    }
    for calc in &sources.calculated {
        producers.push(producer(
            format!("{}.{}", calc.name, calc.attr),
            DatasetType::Secondary,
            sources.primary_rank.unwrap_or(0) + scan_rank,
            format!("/entry/{0}/{0}", calc.attr),
        ));
    }
    for attr in &sources.attributes {
        let (suffix, dataset_type) = match attr.dataset_type {
            AttributeDatasetType::Detector => ("data", DatasetType::Primary),
            AttributeDatasetType::Monitor => ("data", DatasetType::Monitor),
            AttributeDatasetType::Position => ("value", DatasetType::PositionValue),
        };
        producers.push(producer(
            format!("{}.{suffix}", attr.name),
            dataset_type,
            attr.rank + scan_rank,
            format!("/entry/{0}/{0}", attr.name),
        ));
    }
    for axis in generator.axes() {
        producers.push(DatasetProducer {
            name: format!("{axis}.value_set"),
            filename: filename.to_string(),
            dataset_type: DatasetType::PositionSet,
            rank: 1,
            path: format!("/entry/detector/{axis}_set"),
            unique_id_path: String::new(),
        });
    }
    producers
}
