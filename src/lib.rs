//! Kili label parsing and export
//!
//! This library interprets Kili label payloads against a project ontology and
//! converts them to YOLO, COCO, Pascal VOC or raw Kili JSON archives.

pub mod coco;
pub mod config;
pub mod conversion;
pub mod error;
pub mod export;
pub mod geometry;
pub mod io;
pub mod kili_raw;
pub mod label;
pub mod ontology;
pub mod pascal_voc;
pub mod types;
pub mod utils;
pub mod yolo;

// Re-export commonly used types and functions
pub use config::{Args, ExportFormat, ExportOptions, LabelSelection, SplitOption};
pub use error::{KiliError, Result};
pub use export::{export_to_file, run_export, select_labels, ExportReport, MANIFEST_FILE};
pub use label::{JobResponse, Label};
pub use ontology::{build_ontology, MlTask, Ontology};
pub use types::{Asset, ExportSummary, InputType, LabelType, ProjectInfo, RawLabel};

// Import paths
pub use coco::import_coco;
pub use kili_raw::import_kili_raw;
pub use yolo::{import_yolo, parse_class_names};
