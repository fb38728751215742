//! File-writing coordination
//!
//! Pure helpers the HDF writer part uses during Configure and Run:
//!
//! - [`producers`]: gather dataset declarations and build the producer list
//! - [`dims`]: `posNameDim*`/`extraDimSize*` slot programming
//! - [`layout`]: the XML layout document
//! - [`path`]: Unix to Windows path translation
//! - [`progress`]: unique-id to completed-step bookkeeping

pub mod dims;
pub mod layout;
pub mod path;
pub mod producers;
pub mod progress;

pub use dims::{dimension_attributes, DIM_SUFFIXES};
pub use layout::{layout_xml, LayoutSpec};
pub use path::translate;
pub use producers::{dataset_producers, AttributeSource, CalculatedSource, DatasetSources, UNIQUE_ID_PATH};
pub use progress::UniqueIdTracker;
