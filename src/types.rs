use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// Kind of data an asset holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InputType {
    Image,
    Video,
    Text,
    Pdf,
}

// Lifecycle type of a label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LabelType {
    Default,
    Review,
    Prediction,
    Inference,
    Autosave,
}

impl LabelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelType::Default => "DEFAULT",
            LabelType::Review => "REVIEW",
            LabelType::Prediction => "PREDICTION",
            LabelType::Inference => "INFERENCE",
            LabelType::Autosave => "AUTOSAVE",
        }
    }
}

/// A label as delivered by the service: an uninterpreted `jsonResponse` plus
/// its bookkeeping fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLabel {
    pub id: String,
    pub label_type: LabelType,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub json_response: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub input_type: InputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_metadata: Option<Value>,
    #[serde(default)]
    pub labels: Vec<RawLabel>,
}

impl Asset {
    /// Pixel dimensions as floats, when both are known and non-zero.
    pub fn dimensions(&self) -> Option<(f64, f64)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w as f64, h as f64)),
            _ => None,
        }
    }
}

/// Project identity recorded in the export manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// A job or annotation the target format cannot represent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversionSkipped {
    pub external_id: String,
    pub job_id: String,
    pub mid: Option<String>,
    pub reason: String,
}

impl fmt::Display for ConversionSkipped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mid {
            Some(mid) => write!(
                f,
                "{}: job {} annotation {} skipped ({})",
                self.external_id, self.job_id, mid, self.reason
            ),
            None => write!(
                f,
                "{}: job {} skipped ({})",
                self.external_id, self.job_id, self.reason
            ),
        }
    }
}

/// An asset that could not be exported.
#[derive(Debug)]
pub struct AssetFailure {
    pub external_id: String,
    pub error: crate::error::KiliError,
}

// Struct to hold export statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub total_assets: usize,
    pub exported_assets: usize,
    pub assets_without_labels: usize,
    pub exported_labels: usize,
    pub written_files: usize,
    pub skipped_items: usize,
    pub failed_assets: usize,
}

impl ExportSummary {
    pub fn print_summary(&self) {
        info!("=== Export Summary ===");
        info!("Total assets: {}", self.total_assets);
        info!("Exported assets: {}", self.exported_assets);
        info!("Exported labels: {}", self.exported_labels);
        info!("Files written: {}", self.written_files);
        if self.assets_without_labels > 0 {
            info!(
                "Assets without an eligible label: {}",
                self.assets_without_labels
            );
        }
        if self.skipped_items > 0 {
            warn!(
                "Skipped {} jobs/annotations unsupported by the target format",
                self.skipped_items
            );
        }
        if self.failed_assets > 0 {
            warn!("Failed assets: {}", self.failed_assets);
        }
    }
}
