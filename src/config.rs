use clap::{Parser, ValueEnum};
use std::fmt;

use crate::error::{KiliError, Result};
use crate::types::LabelType;

/// Command-line arguments for exporting Kili labels to an archive.
#[derive(Parser, Debug, Clone)]
#[command(version, long_about = None)]
pub struct Args {
    /// Project JSON file (id, title, description, jsonInterface)
    #[arg(short = 'p', long = "project")]
    pub project: String,

    /// Assets JSON file: an array of assets with their labels
    #[arg(short = 'a', long = "assets")]
    pub assets: String,

    /// Target format
    #[arg(short = 'f', long = "format", value_enum)]
    pub format: ExportFormat,

    /// Path of the zip archive to write
    #[arg(short = 'o', long = "output", default_value = "export.zip")]
    pub output: String,

    /// Export every eligible label instead of the latest one per asset
    #[arg(long = "all_labels")]
    pub all_labels: bool,

    /// Write one file for the whole project (true) or one per asset (false)
    #[arg(long = "single_file")]
    pub single_file: Option<bool>,

    /// YOLO layout: one folder per job, or all jobs merged into one class list
    #[arg(long = "split_option", value_enum, default_value = "split")]
    pub split_option: SplitOption,

    /// Also export prediction and inference labels
    #[arg(long = "include_prediction_labels")]
    pub include_prediction_labels: bool,

    /// Show a progress bar
    #[arg(long = "progress")]
    pub progress: bool,
}

impl Args {
    pub fn to_export_options(&self) -> ExportOptions {
        ExportOptions {
            format: self.format,
            selection: if self.all_labels {
                LabelSelection::All
            } else {
                LabelSelection::Latest
            },
            single_file: self.single_file,
            split_option: self.split_option,
            include_prediction_labels: self.include_prediction_labels,
            show_progress: self.progress,
        }
    }
}

// Enumeration for the archive formats
#[derive(Copy, Clone, PartialEq, Eq, Hash, ValueEnum, Debug)]
pub enum ExportFormat {
    #[value(name = "kili_raw")]
    KiliRaw,
    #[value(name = "yolo_v4")]
    YoloV4,
    #[value(name = "yolo_v5")]
    YoloV5,
    #[value(name = "yolo_v7")]
    YoloV7,
    #[value(name = "pascal_voc")]
    PascalVoc,
    #[value(name = "coco")]
    Coco,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::KiliRaw => "kili_raw",
            ExportFormat::YoloV4 => "yolo_v4",
            ExportFormat::YoloV5 => "yolo_v5",
            ExportFormat::YoloV7 => "yolo_v7",
            ExportFormat::PascalVoc => "pascal_voc",
            ExportFormat::Coco => "coco",
        }
    }

    /// Settle the file layout: `None` picks the format's own layout, an
    /// explicit request the format cannot honour is rejected.
    pub fn resolve_single_file(&self, requested: Option<bool>) -> Result<bool> {
        let (supports_single, supports_multi) = match self {
            ExportFormat::KiliRaw => (true, true),
            ExportFormat::YoloV4 | ExportFormat::YoloV5 | ExportFormat::YoloV7 => (false, true),
            ExportFormat::PascalVoc => (false, true),
            ExportFormat::Coco => (true, false),
        };
        match requested {
            None => Ok(supports_single && !supports_multi),
            Some(true) if !supports_single => Err(KiliError::UnsupportedOption(format!(
                "{} cannot be exported as a single file",
                self
            ))),
            Some(false) if !supports_multi => Err(KiliError::UnsupportedOption(format!(
                "{} is only exported as a single file",
                self
            ))),
            Some(single_file) => Ok(single_file),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Which labels of an asset end up in the export
#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug, Default)]
pub enum LabelSelection {
    #[default]
    Latest,
    All,
}

impl LabelSelection {
    pub fn describe(&self) -> &'static str {
        match self {
            LabelSelection::Latest => "latest label per asset",
            LabelSelection::All => "all labels",
        }
    }
}

// Directory layout of a YOLO export
#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug, Default)]
pub enum SplitOption {
    #[default]
    Split,
    Merged,
}

/// Library-facing export configuration.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub format: ExportFormat,
    pub selection: LabelSelection,
    pub single_file: Option<bool>,
    pub split_option: SplitOption,
    pub include_prediction_labels: bool,
    pub show_progress: bool,
}

impl ExportOptions {
    pub fn new(format: ExportFormat) -> Self {
        Self {
            format,
            selection: LabelSelection::Latest,
            single_file: None,
            split_option: SplitOption::Split,
            include_prediction_labels: false,
            show_progress: false,
        }
    }

    pub fn with_selection(mut self, selection: LabelSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_single_file(mut self, single_file: bool) -> Self {
        self.single_file = Some(single_file);
        self
    }

    pub fn with_split_option(mut self, split_option: SplitOption) -> Self {
        self.split_option = split_option;
        self
    }

    /// Label lifecycle types admitted to the export.
    pub fn eligible_label_types(&self) -> &'static [LabelType] {
        if self.include_prediction_labels {
            &[
                LabelType::Default,
                LabelType::Review,
                LabelType::Prediction,
                LabelType::Inference,
            ]
        } else {
            &[LabelType::Default, LabelType::Review]
        }
    }
}
