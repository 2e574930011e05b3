//! Contract shared by the format converters.
//!
//! A converter works in two phases. [`Converter::convert_asset`] is a pure
//! function of one asset and its selected labels; the export driver runs it in
//! parallel. [`Converter::write_outputs`] then receives every successful
//! per-asset output, in asset order, and is the only place that writes into
//! the archive.

use indexmap::IndexSet;
use log::warn;
use std::collections::{BTreeMap, HashSet};
use std::io::{Seek, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::Result;
use crate::label::{Annotation, JobResponses, Label};
use crate::types::{Asset, ConversionSkipped, RawLabel};

/// A selected label together with the raw record it came from.
#[derive(Debug, Clone)]
pub struct ExportLabel<'a> {
    pub raw: &'a RawLabel,
    pub label: Label,
}

pub trait Converter: Sync {
    type Output: Send;

    fn convert_asset(
        &self,
        asset: &Asset,
        labels: &[ExportLabel<'_>],
        skips: &mut SkipLog,
    ) -> Result<Self::Output>;

    /// Write all outputs plus any format-level metadata; returns the number
    /// of files written.
    fn write_outputs(&self, outputs: Vec<Self::Output>, sink: &mut dyn ArchiveSink) -> Result<usize>;
}

/// Per-asset record of what the target format had to leave out.
#[derive(Debug)]
pub struct SkipLog {
    external_id: String,
    entries: IndexSet<ConversionSkipped>,
}

impl SkipLog {
    pub fn new(external_id: &str) -> Self {
        Self {
            external_id: external_id.to_string(),
            entries: IndexSet::new(),
        }
    }

    pub fn job(&mut self, job_id: &str, reason: impl Into<String>) {
        self.entries.insert(ConversionSkipped {
            external_id: self.external_id.clone(),
            job_id: job_id.to_string(),
            mid: None,
            reason: reason.into(),
        });
    }

    pub fn annotation(&mut self, job_id: &str, mid: &str, reason: impl Into<String>) {
        self.entries.insert(ConversionSkipped {
            external_id: self.external_id.clone(),
            job_id: job_id.to_string(),
            mid: Some(mid.to_string()),
            reason: reason.into(),
        });
    }

    /// Record the nested `children` of an exported annotation, which flat
    /// formats cannot carry: one entry per child job.
    pub fn nested(&mut self, job_id: &str, annotation: &Annotation, format: &str) {
        let fragments = std::iter::once(annotation.children.as_ref())
            .chain(annotation.categories.iter().map(|category| category.children()))
            .flatten();
        for children in fragments {
            self.nested_jobs(job_id, &annotation.mid, children, format);
        }
    }

    fn nested_jobs(&mut self, job_id: &str, mid: &str, children: &JobResponses, format: &str) {
        let nested = children
            .iter()
            .map(|(child_job, _)| child_job)
            .chain(children.passthrough().keys().map(String::as_str));
        for child_job in nested {
            self.annotation(
                job_id,
                mid,
                format!("nested job {} is not exported to {}", child_job, format),
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<ConversionSkipped> {
        self.entries.into_iter().collect()
    }
}

/// Destination for exported files.
pub trait ArchiveSink {
    fn add_file(&mut self, path: &str, contents: &[u8]) -> Result<()>;
}

/// Zip archive writer.
pub struct ZipSink<W: Write + Seek> {
    writer: ZipWriter<W>,
    options: SimpleFileOptions,
}

impl<W: Write + Seek> ZipSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: ZipWriter::new(inner),
            options: SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .last_modified_time(zip::DateTime::default()),
        }
    }

    pub fn finish(self) -> Result<W> {
        Ok(self.writer.finish()?)
    }
}

impl<W: Write + Seek> ArchiveSink for ZipSink<W> {
    fn add_file(&mut self, path: &str, contents: &[u8]) -> Result<()> {
        self.writer.start_file(path, self.options)?;
        self.writer.write_all(contents)?;
        Ok(())
    }
}

/// In-memory sink, keyed by archive path.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub files: BTreeMap<String, Vec<u8>>,
}

impl MemorySink {
    pub fn text(&self, path: &str) -> Option<&str> {
        self.files
            .get(path)
            .and_then(|contents| std::str::from_utf8(contents).ok())
    }
}

impl ArchiveSink for MemorySink {
    fn add_file(&mut self, path: &str, contents: &[u8]) -> Result<()> {
        self.files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }
}

/// Archive paths handed out during one export. Distinct external ids can
/// sanitize to the same stem; a path that is already taken gets a `__<n>`
/// suffix before its extension, in asset order.
#[derive(Debug, Default)]
pub struct ArchivePaths {
    taken: HashSet<String>,
}

impl ArchivePaths {
    pub fn claim(&mut self, path: String) -> String {
        if self.taken.insert(path.clone()) {
            return path;
        }
        let (base, extension) = match path.rfind('.') {
            Some(dot) if !path[dot..].contains('/') => path.split_at(dot),
            _ => (path.as_str(), ""),
        };
        let mut n = 2;
        loop {
            let candidate = format!("{}__{}{}", base, n, extension);
            if self.taken.insert(candidate.clone()) {
                warn!("Archive path {} is already used, writing {} instead", path, candidate);
                return candidate;
            }
            n += 1;
        }
    }
}

/// Stem for one label's file. With several labels per asset the label id
/// keeps the names apart.
pub fn label_file_stem(stem: &str, raw: &RawLabel, one_file_per_label: bool) -> String {
    if one_file_per_label {
        format!("{}__{}", stem, crate::utils::file_stem(&raw.id))
    } else {
        stem.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_skip_log_deduplicates() {
        let mut skips = SkipLog::new("asset-1");
        skips.job("TRANSCRIPTION_JOB", "transcription is not supported");
        skips.job("TRANSCRIPTION_JOB", "transcription is not supported");
        skips.annotation("OD", "m1", "polygon");
        assert_eq!(skips.len(), 2);
        let entries = skips.into_entries();
        assert_eq!(entries[0].external_id, "asset-1");
        assert_eq!(entries[1].mid.as_deref(), Some("m1"));
    }

    #[test]
    fn test_zip_sink_round_trip() {
        let mut sink = ZipSink::new(std::io::Cursor::new(Vec::new()));
        sink.add_file("labels/a.txt", b"0 0.5 0.5 0.1 0.1\n").unwrap();
        let cursor = sink.finish().unwrap();
        let mut archive = zip::ZipArchive::new(cursor).unwrap();
        let mut file = archive.by_name("labels/a.txt").unwrap();
        let mut contents = String::new();
        std::io::Read::read_to_string(&mut file, &mut contents).unwrap();
        assert_eq!(contents, "0 0.5 0.5 0.1 0.1\n");
    }

    #[test]
    fn test_archive_paths_are_unique() {
        let mut paths = ArchivePaths::default();
        assert_eq!(paths.claim("labels/ab.jpg.txt".to_string()), "labels/ab.jpg.txt");
        assert_eq!(paths.claim("labels/ab.jpg.txt".to_string()), "labels/ab.jpg__2.txt");
        assert_eq!(paths.claim("labels/ab.jpg__2.txt".to_string()), "labels/ab.jpg__2__2.txt");
        assert_eq!(paths.claim("OD/labels/ab.jpg.txt".to_string()), "OD/labels/ab.jpg.txt");
        assert_eq!(paths.claim("v1.0/notes".to_string()), "v1.0/notes");
        assert_eq!(paths.claim("v1.0/notes".to_string()), "v1.0/notes__2");
    }

    #[test]
    fn test_label_file_stem() {
        let raw = RawLabel {
            id: "lbl/1".to_string(),
            label_type: crate::types::LabelType::Default,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            author: None,
            json_response: json!({}),
        };
        assert_eq!(label_file_stem("img", &raw, false), "img");
        assert_eq!(label_file_stem("img", &raw, true), "img__lbl1");
    }
}
