//! Export orchestration: label selection, parallel per-asset conversion,
//! single-point aggregation into the archive, and the manifest.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::coco::CocoConverter;
use crate::config::{ExportFormat, ExportOptions, LabelSelection};
use crate::conversion::{ArchiveSink, Converter, ExportLabel, SkipLog, ZipSink};
use crate::error::Result;
use crate::kili_raw::KiliRawConverter;
use crate::label::Label;
use crate::ontology::Ontology;
use crate::pascal_voc::PascalVocConverter;
use crate::types::{Asset, AssetFailure, ConversionSkipped, ExportSummary, ProjectInfo, RawLabel};
use crate::utils::create_progress_bar;
use crate::yolo::{YoloClassMap, YoloConverter, YoloVersion};

pub const MANIFEST_FILE: &str = "README.kili.txt";

/// Partial-success result of an export run.
#[derive(Debug, Default)]
pub struct ExportReport {
    pub summary: ExportSummary,
    pub skipped: Vec<ConversionSkipped>,
    pub failures: Vec<AssetFailure>,
}

/// Labels of one asset that go into the export, oldest first. Labels are
/// ordered by creation time, then by id when timestamps are equal.
pub fn select_labels<'a>(labels: &'a [RawLabel], options: &ExportOptions) -> Vec<&'a RawLabel> {
    let eligible = options.eligible_label_types();
    let mut selected: Vec<&RawLabel> = labels
        .iter()
        .filter(|label| eligible.contains(&label.label_type))
        .collect();
    selected.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

    match options.selection {
        LabelSelection::All => selected,
        LabelSelection::Latest => selected.pop().into_iter().collect(),
    }
}

/// Plain-text description of an export.
pub fn manifest(project: &ProjectInfo, options: &ExportOptions, exported_at: DateTime<Utc>) -> String {
    let label_types: Vec<&str> = options
        .eligible_label_types()
        .iter()
        .map(|label_type| label_type.as_str())
        .collect();

    let mut text = String::from("Exported from Kili\n\n");
    text.push_str(&format!("Project name: {}\n", project.title));
    text.push_str(&format!("Project identifier: {}\n", project.id));
    text.push_str(&format!("Project description: {}\n", project.description));
    text.push_str(&format!(
        "Export date: {}\n",
        exported_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    text.push_str(&format!("Exported format: {}\n", options.format));
    text.push_str(&format!("Exported labels: {}\n", options.selection.describe()));
    text.push_str(&format!("Label types: {}\n", label_types.join(", ")));
    text
}

enum AssetOutcome<O> {
    Exported {
        output: O,
        labels: usize,
        skipped: Vec<ConversionSkipped>,
    },
    NoLabels,
    Failed(AssetFailure),
}

fn export_asset<C: Converter>(
    converter: &C,
    asset: &Asset,
    ontology: &Arc<Ontology>,
    options: &ExportOptions,
) -> Result<Option<(C::Output, usize, Vec<ConversionSkipped>)>> {
    let selected = select_labels(&asset.labels, options);
    if selected.is_empty() {
        return Ok(None);
    }
    let labels = selected
        .into_iter()
        .map(|raw| {
            Ok(ExportLabel {
                raw,
                label: Label::parse(&raw.json_response, ontology, asset.input_type)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut skips = SkipLog::new(&asset.external_id);
    let output = converter.convert_asset(asset, &labels, &mut skips)?;
    Ok(Some((output, labels.len(), skips.into_entries())))
}

fn convert_all<C: Converter>(
    converter: &C,
    assets: &[Asset],
    ontology: &Arc<Ontology>,
    options: &ExportOptions,
    sink: &mut dyn ArchiveSink,
) -> Result<ExportReport> {
    let pb = create_progress_bar(assets.len() as u64, options.format.as_str(), options.show_progress);

    let outcomes: Vec<AssetOutcome<C::Output>> = assets
        .par_iter()
        .map(|asset| {
            let outcome = match export_asset(converter, asset, ontology, options) {
                Ok(Some((output, labels, skipped))) => AssetOutcome::Exported {
                    output,
                    labels,
                    skipped,
                },
                Ok(None) => AssetOutcome::NoLabels,
                Err(error) => {
                    warn!("Failed to export asset {}: {}", asset.external_id, error);
                    AssetOutcome::Failed(AssetFailure {
                        external_id: asset.external_id.clone(),
                        error,
                    })
                }
            };
            pb.inc(1);
            outcome
        })
        .collect();
    pb.finish_and_clear();

    let mut report = ExportReport::default();
    report.summary.total_assets = assets.len();
    let mut outputs = Vec::new();
    for outcome in outcomes {
        match outcome {
            AssetOutcome::Exported {
                output,
                labels,
                skipped,
            } => {
                report.summary.exported_assets += 1;
                report.summary.exported_labels += labels;
                for skip in &skipped {
                    debug!("{}", skip);
                }
                report.skipped.extend(skipped);
                outputs.push(output);
            }
            AssetOutcome::NoLabels => report.summary.assets_without_labels += 1,
            AssetOutcome::Failed(failure) => report.failures.push(failure),
        }
    }

    report.summary.written_files = converter.write_outputs(outputs, sink)?;
    report.summary.skipped_items = report.skipped.len();
    report.summary.failed_assets = report.failures.len();
    Ok(report)
}

/// Export `assets` into `sink` in the requested format, followed by the
/// manifest. Option errors abort before anything is written; per-asset
/// errors are collected in the report.
pub fn run_export(
    assets: &[Asset],
    ontology: &Arc<Ontology>,
    project: &ProjectInfo,
    options: &ExportOptions,
    sink: &mut dyn ArchiveSink,
) -> Result<ExportReport> {
    let single_file = options.format.resolve_single_file(options.single_file)?;
    let one_file_per_label = options.selection == LabelSelection::All;
    let exported_at = Utc::now();
    info!(
        "Exporting {} assets of project {} as {}",
        assets.len(),
        project.id,
        options.format
    );

    let mut report = match options.format {
        ExportFormat::KiliRaw => {
            let converter = KiliRawConverter::new(options.selection, single_file);
            convert_all(&converter, assets, ontology, options, sink)?
        }
        ExportFormat::YoloV4 | ExportFormat::YoloV5 | ExportFormat::YoloV7 => {
            let version = match options.format {
                ExportFormat::YoloV4 => YoloVersion::V4,
                ExportFormat::YoloV5 => YoloVersion::V5,
                _ => YoloVersion::V7,
            };
            let classes = YoloClassMap::from_ontology(ontology, options.split_option);
            let converter = YoloConverter::new(version, classes, one_file_per_label);
            convert_all(&converter, assets, ontology, options, sink)?
        }
        ExportFormat::PascalVoc => {
            let converter = PascalVocConverter::new(Arc::clone(ontology), one_file_per_label);
            convert_all(&converter, assets, ontology, options, sink)?
        }
        ExportFormat::Coco => {
            let converter = CocoConverter::new(ontology, project, exported_at, one_file_per_label);
            convert_all(&converter, assets, ontology, options, sink)?
        }
    };

    sink.add_file(MANIFEST_FILE, manifest(project, options, exported_at).as_bytes())?;
    report.summary.written_files += 1;
    Ok(report)
}

/// [`run_export`] into a zip archive at `path`.
pub fn export_to_file(
    assets: &[Asset],
    ontology: &Arc<Ontology>,
    project: &ProjectInfo,
    options: &ExportOptions,
    path: &Path,
) -> Result<ExportReport> {
    options.format.resolve_single_file(options.single_file)?;

    let file = File::create(path)?;
    let mut sink = ZipSink::new(BufWriter::new(file));
    let report = run_export(assets, ontology, project, options, &mut sink)?;
    sink.finish()?.flush()?;
    info!("Archive written to {}", path.display());
    Ok(report)
}
