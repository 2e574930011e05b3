//! Kili's own JSON format: asset records carrying their labels' payloads
//! unchanged, either in one `data.json` array or one `labels/<stem>.json` per
//! asset.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::config::LabelSelection;
use crate::conversion::{ArchivePaths, ArchiveSink, Converter, ExportLabel, SkipLog};
use crate::error::{KiliError, Result};
use crate::label::Label;
use crate::ontology::Ontology;
use crate::types::{Asset, InputType, RawLabel};
use crate::utils::file_stem;

pub const SINGLE_FILE: &str = "data.json";

/// One asset as written to (and read from) a kili_raw export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KiliRawAsset {
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_label: Option<RawLabel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<RawLabel>>,
}

impl KiliRawAsset {
    fn into_asset(self) -> Asset {
        let labels = match (self.latest_label, self.labels) {
            (_, Some(labels)) => labels,
            (Some(latest), None) => vec![latest],
            (None, None) => Vec::new(),
        };
        Asset {
            id: self.id,
            external_id: self.external_id,
            content: self.content,
            width: self.width,
            height: self.height,
            input_type: self.input_type,
            json_metadata: self.json_metadata,
            labels,
        }
    }
}

pub struct KiliRawConverter {
    selection: LabelSelection,
    single_file: bool,
}

impl KiliRawConverter {
    pub fn new(selection: LabelSelection, single_file: bool) -> Self {
        Self {
            selection,
            single_file,
        }
    }
}

impl Converter for KiliRawConverter {
    type Output = KiliRawAsset;

    fn convert_asset(
        &self,
        asset: &Asset,
        labels: &[ExportLabel<'_>],
        _skips: &mut SkipLog,
    ) -> Result<KiliRawAsset> {
        let mut exported: Vec<RawLabel> = labels
            .iter()
            .map(|export_label| RawLabel {
                json_response: export_label.label.to_dict(),
                ..export_label.raw.clone()
            })
            .collect();

        let (latest_label, labels) = match self.selection {
            LabelSelection::Latest => (exported.pop(), None),
            LabelSelection::All => (None, Some(exported)),
        };
        Ok(KiliRawAsset {
            id: asset.id.clone(),
            external_id: asset.external_id.clone(),
            content: asset.content.clone(),
            width: asset.width,
            height: asset.height,
            input_type: asset.input_type,
            json_metadata: asset.json_metadata.clone(),
            latest_label,
            labels,
        })
    }

    fn write_outputs(&self, outputs: Vec<KiliRawAsset>, sink: &mut dyn ArchiveSink) -> Result<usize> {
        if self.single_file {
            sink.add_file(SINGLE_FILE, &serde_json::to_vec_pretty(&outputs)?)?;
            return Ok(1);
        }
        let mut paths = ArchivePaths::default();
        for record in &outputs {
            let path = paths.claim(format!("labels/{}.json", file_stem(&record.external_id)));
            sink.add_file(&path, &serde_json::to_vec_pretty(record)?)?;
        }
        debug!("Wrote {} kili_raw files", outputs.len());
        Ok(outputs.len())
    }
}

/// Read assets back from kili_raw files. Each file holds either one asset
/// record or an array of them; every label is checked against the ontology.
pub fn import_kili_raw(files: &[(String, String)], ontology: &Arc<Ontology>) -> Result<Vec<Asset>> {
    let mut assets = Vec::new();

    for (path, contents) in files {
        let value: Value = serde_json::from_str(contents)?;
        let records: Vec<KiliRawAsset> = match value {
            Value::Array(_) => serde_json::from_value(value)?,
            Value::Object(_) => vec![serde_json::from_value(value)?],
            _ => {
                return Err(KiliError::InvalidImport {
                    format: "kili_raw",
                    message: format!("{} holds neither an asset nor a list of assets", path),
                })
            }
        };
        for record in records {
            let asset = record.into_asset();
            for raw in &asset.labels {
                Label::parse(&raw.json_response, ontology, asset.input_type)?;
            }
            assets.push(asset);
        }
    }
    Ok(assets)
}
